use crate::{
    parser::{take, Parser, Propagate},
    AmlError,
};

/// Describes how much of the remaining stream belongs to the package (`Scope`, `Device`,
/// `Method`, a buffer, ...) that this length was read from.
///
/// Package lengths are encoded in one to four bytes:
///   - if the two high bits of the first byte are `00`, the whole length is the low six bits of
///     that byte.
///   - otherwise, the low two bits of the first byte give the number (1-3) of following bytes;
///     the low four bits of the first byte plus the following bytes (least-significant first)
///     form the length.
///
/// The length field *includes* the bytes used to encode it, so subtracting it from the stream
/// length at the point the `PkgLength` was read gives an absolute "remaining bytes once this
/// package ends" marker that's valid no matter how the caller's slice has been further sliced up
/// in between (as long as it's a suffix of the original).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PkgLength {
    pub raw_length: u32,
    end_offset: usize,
}

impl PkgLength {
    /// Constructs a length that spans the whole of the given stream. Used at the top level, where
    /// the "package" is the entire table.
    pub fn from_raw_length(stream: &[u8], raw_length: u32) -> Result<PkgLength, AmlError> {
        if raw_length as usize > stream.len() {
            return Err(AmlError::InvalidPkgLength);
        }
        Ok(PkgLength { raw_length, end_offset: stream.len() - raw_length as usize })
    }

    /// Returns `true` if there's still more of this package left to parse, from `stream` (a
    /// suffix of the slice this `PkgLength` was originally read from).
    pub fn still_parsing(&self, stream: &[u8]) -> bool {
        stream.len() > self.end_offset
    }

    /// Number of bytes the current position is short of the package boundary. Used by parsers
    /// that need to skip straight to the end of a package (e.g. a `Method`'s deferred body).
    pub fn bytes_left(&self, stream: &[u8]) -> usize {
        stream.len().saturating_sub(self.end_offset)
    }
}

/// Parses a `PkgLength`.
pub fn pkg_length<'a, 'c>() -> impl Parser<'a, 'c, PkgLength> {
    move |input: &'a [u8], context| -> crate::parser::ParseResult<'a, 'c, PkgLength> {
        let start_len = input.len();
        let (input, context, lead_byte) = take().parse(input, context)?;

        let following_bytes = (lead_byte >> 6) as usize;
        if following_bytes == 0 {
            let raw_length = (lead_byte & 0x3f) as u32;
            let end_offset = start_len - raw_length as usize;
            return Ok((input, context, PkgLength { raw_length, end_offset }));
        }

        if following_bytes > 3 {
            return Err((input, context, Propagate::Err(AmlError::InvalidPkgLength)));
        }

        let mut length = (lead_byte & 0xf) as u32;
        let mut rest = input;
        let mut context = context;
        for i in 0..following_bytes {
            let (new_rest, new_context, byte) = take().parse(rest, context)?;
            length |= (byte as u32) << (4 + i * 8);
            rest = new_rest;
            context = new_context;
        }

        if length as usize > start_len {
            return Err((rest, context, Propagate::Err(AmlError::InvalidPkgLength)));
        }
        let end_offset = start_len - length as usize;
        Ok((rest, context, PkgLength { raw_length: length, end_offset }))
    }
}

/// Encodes `n` into its minimal `PkgLength` byte form. Pure function used by the table manager
/// when resource descriptors or field bodies need to be re-emitted, and by property tests
/// asserting the encode/decode involution (spec.md §8 invariant 5).
pub fn encode_pkg_length(n: u32) -> PkgLengthBytes {
    for following_bytes in 0..=3u32 {
        let total = n + 1 + following_bytes;
        let fits = match following_bytes {
            0 => total < 64,
            1 => total < (1 << 12),
            2 => total < (1 << 20),
            3 => total < (1 << 28),
            _ => false,
        };
        if fits {
            return write_length(total, following_bytes);
        }
    }
    panic!("package length too large to encode (max is 2^28 - 1)");
}

fn write_length(total: u32, following_bytes: u32) -> PkgLengthBytes {
    let mut out = PkgLengthBytes::new();
    if following_bytes == 0 {
        out.push(total as u8);
        return out;
    }
    out.push(((following_bytes as u8) << 6) | (total & 0xf) as u8);
    let mut remaining = total >> 4;
    for _ in 0..following_bytes {
        out.push((remaining & 0xff) as u8);
        remaining >>= 8;
    }
    out
}

pub fn decode_pkg_length(bytes: &[u8]) -> Result<(u32, usize), AmlError> {
    if bytes.is_empty() {
        return Err(AmlError::UnexpectedEndOfStream);
    }
    let lead = bytes[0];
    let following_bytes = (lead >> 6) as usize;
    if following_bytes == 0 {
        return Ok(((lead & 0x3f) as u32, 1));
    }
    if following_bytes > 3 || bytes.len() < 1 + following_bytes {
        return Err(AmlError::InvalidPkgLength);
    }
    let mut length = (lead & 0xf) as u32;
    for i in 0..following_bytes {
        length |= (bytes[1 + i] as u32) << (4 + i * 8);
    }
    Ok((length, 1 + following_bytes))
}

/// A tiny fixed-capacity byte buffer, just large enough for a 4-byte `PkgLength` encoding.
#[derive(Debug, Clone, Copy)]
pub struct PkgLengthBytes {
    buf: [u8; 4],
    len: usize,
}

impl PkgLengthBytes {
    fn new() -> Self {
        PkgLengthBytes { buf: [0; 4], len: 0 }
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.len] = byte;
        self.len += 1;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkg_length_round_trips_s1_scenario() {
        // S1 from spec.md: lengths whose encodings are 1,1,2,2,3,4 bytes.
        let cases: &[(u32, usize)] =
            &[(0, 1), (63, 1), (64, 2), (16383, 2), (16384, 3), (268435455, 4)];

        for &(n, expected_len) in cases {
            let encoded = encode_pkg_length(n);
            assert_eq!(encoded.as_slice().len(), expected_len, "n = {}", n);
            let (decoded, consumed) = decode_pkg_length(encoded.as_slice()).unwrap();
            assert_eq!(consumed, expected_len);
            assert_eq!(decoded, n);
        }
    }

    #[test]
    fn decode_encode_is_involution_for_sampled_lengths() {
        for n in [0u32, 1, 62, 63, 64, 4095, 4096, 1048575, 1048576, 268435455] {
            let encoded = encode_pkg_length(n);
            let (decoded, _) = decode_pkg_length(encoded.as_slice()).unwrap();
            assert_eq!(decoded, n);
        }
    }

    #[test]
    fn still_parsing_reflects_boundary() {
        // A length of 4 starting at a 10-byte stream: 1 header byte + 3 body bytes.
        let stream = [0x04u8, 0xaa, 0xbb, 0xcc, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x00];
        let (rest, _, len) = pkg_length().parse(&stream, ()).unwrap();
        assert_eq!(len.raw_length, 4);
        assert!(len.still_parsing(rest));
        let rest = &rest[3..];
        assert!(!len.still_parsing(rest));
    }
}
