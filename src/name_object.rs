//! Parsing and manipulation of AML names: `NameSeg`, `NameString` (absolute / parent-relative /
//! dual / multi / single segment forms), and `Target` (the destination of a `Store`-like
//! operation, which can be a name, an argument, a local, the debug object, or nothing).

use crate::{
    choice,
    misc::{ArgNum, LocalNum},
    namespace::AmlName,
    parser::{map, map_with_context, opt, take, take_n, Parser},
    AmlContext, AmlError,
};
use alloc::vec::Vec;
use core::fmt;

/// A single 4-character name segment, e.g. `_SB_`, `PCI0`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameSeg([u8; 4]);

impl NameSeg {
    pub fn from_bytes(bytes: [u8; 4]) -> Result<NameSeg, AmlError> {
        if !is_lead_name_char(bytes[0]) {
            return Err(AmlError::InvalidNameSeg);
        }
        for &byte in &bytes[1..] {
            if !is_name_char(byte) {
                return Err(AmlError::InvalidNameSeg);
            }
        }
        Ok(NameSeg(bytes))
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0).unwrap_or("????")
    }

    pub fn as_bytes(&self) -> [u8; 4] {
        self.0
    }
}

impl core::str::FromStr for NameSeg {
    type Err = AmlError;

    fn from_str(s: &str) -> Result<NameSeg, AmlError> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err(AmlError::InvalidNameSeg);
        }
        NameSeg::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl fmt::Debug for NameSeg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for NameSeg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn is_lead_name_char(byte: u8) -> bool {
    byte == b'_' || byte.is_ascii_uppercase()
}

fn is_name_char(byte: u8) -> bool {
    is_lead_name_char(byte) || byte.is_ascii_digit()
}

/// A parsed (but not yet resolved-against-a-scope) name path, as written on the wire: some number
/// of `^` prefixes, optionally an absolute `\` root, and zero or more name segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameString {
    pub is_absolute: bool,
    pub parent_levels: u32,
    pub segments: Vec<NameSeg>,
}

impl NameString {
    /// Resolves this wire-format name against `scope`, per spec.md §4.2's "Name formats on the
    /// wire": absolute names (`\` prefix) ignore `scope` entirely, `^`-prefixed names walk up
    /// `parent_levels` ancestors first.
    pub fn resolve(&self, scope: &AmlName) -> Result<AmlName, AmlError> {
        AmlName::resolve_relative(self.is_absolute, self.parent_levels, &self.segments, scope)
    }
}

/// The target of a store-like operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Null,
    Name(AmlName),
    Debug,
    Arg(ArgNum),
    Local(LocalNum),
}

/// Parses a `NameString` and resolves it against the context's current scope, producing a final
/// absolute [`AmlName`] - this is what every parser that consumes a `NameString` argument template
/// (spec.md §4.1) actually wants.
pub fn name_string<'a, 'c>() -> impl Parser<'a, 'c, AmlName> {
    map_with_context(name_path(), |parsed, context: &mut AmlContext| parsed.resolve(context.current_scope()))
}

/// Parses a `NameString` without resolving it - used where the caller needs the raw relative form
/// (e.g. to build a [`Target::Name`] that should re-resolve at execution time against whatever
/// scope is current then, or for diagnostics).
pub fn name_string_raw<'a, 'c>() -> impl Parser<'a, 'c, NameString> {
    name_path()
}

fn name_path<'a, 'c>() -> impl Parser<'a, 'c, NameString> {
    |input: &'a [u8], context| {
        let (input, context, is_absolute) = opt(crate::parser::opcode(b'\\')).parse(input, context)?;
        let is_absolute = is_absolute.is_some();

        let mut parent_levels = 0;
        let mut input = input;
        let mut context = context;
        loop {
            match crate::parser::opcode(b'^').parse(input, context) {
                Ok((new_input, new_context, ())) => {
                    parent_levels += 1;
                    input = new_input;
                    context = new_context;
                }
                Err((i, c, _)) => {
                    input = i;
                    context = c;
                    break;
                }
            }
        }

        let (input, context, segments) = name_path_segments().parse(input, context)?;
        Ok((input, context, NameString { is_absolute, parent_levels, segments }))
    }
}

fn name_path_segments<'a, 'c>() -> impl Parser<'a, 'c, Vec<NameSeg>> {
    choice!(
        map(crate::parser::opcode(0x00), |()| Vec::new()),
        map(dual_name_path(), |(a, b)| {
            let mut v = Vec::with_capacity(2);
            v.push(a);
            v.push(b);
            v
        }),
        multi_name_path(),
        map(name_seg(), |seg| {
            let mut v = Vec::with_capacity(1);
            v.push(seg);
            v
        })
    )
}

fn dual_name_path<'a, 'c>() -> impl Parser<'a, 'c, (NameSeg, NameSeg)> {
    map_with_context(
        crate::parser::and_then(
            crate::parser::opcode(0x2e),
            crate::parser::and_then(take_n(4), take_n(4)),
        ),
        |((), (a, b)), _| {
            Ok((
                NameSeg::from_bytes([a[0], a[1], a[2], a[3]])?,
                NameSeg::from_bytes([b[0], b[1], b[2], b[3]])?,
            ))
        },
    )
}

fn multi_name_path<'a, 'c>() -> impl Parser<'a, 'c, Vec<NameSeg>> {
    |input: &'a [u8], context| {
        let (input, context, ()) = crate::parser::opcode(0x2f).parse(input, context)?;
        let (input, context, count) = take().parse(input, context)?;
        let mut segments = Vec::with_capacity(count as usize);
        let mut input = input;
        let mut context = context;
        for _ in 0..count {
            let (new_input, new_context, seg) = name_seg().parse(input, context)?;
            segments.push(seg);
            input = new_input;
            context = new_context;
        }
        Ok((input, context, segments))
    }
}

pub fn name_seg<'a, 'c>() -> impl Parser<'a, 'c, NameSeg> {
    map_with_context(take_n(4), |bytes, _| {
        NameSeg::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    })
}

