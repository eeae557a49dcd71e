//! Resource descriptor encode/decode (spec.md §6 "get_current_resources", §6 "persisted/firmware-
//! facing byte formats: ... resource descriptor bytes are byte-for-byte identical to ACPI 1.0b/
//! 2.0"). A `_CRS`/`_PRS`/`_SRS` object evaluates to a `Buffer` containing a sequence of these
//! descriptors, terminated by an `EndTag`; this module turns that buffer into typed Rust values and
//! back, the way `pci_routing.rs` turns a `_PRT` package into typed entries.
//!
//! Grounded on `original_source/drivers/acpi/resources/rsxface.c` (the external resource-list
//! interface spec.md §6 names) for which descriptor kinds matter at this layer; byte-for-byte
//! layouts follow the ACPI specification's resource data type tables, not any one example repo.

use alloc::vec::Vec;
use bit_field::BitField;

use crate::AmlError;

/// One decoded resource descriptor. Only the kinds a typical `_CRS`/`_PRS` evaluation produces are
/// modelled; anything else round-trips as `Unknown` rather than failing the whole parse, mirroring
/// spec.md §7's "bad opcodes in the parse stream are skipped, not fatal" policy applied to resource
/// items.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Resource {
    Irq { mask: u16, edge_triggered: bool, active_low: bool, shared: bool },
    Dma { channel_mask: u8, bus_master: bool },
    Io { min: u16, max: u16, alignment: u8, length: u8, decodes_16bit: bool },
    FixedIo { address: u16, length: u8 },
    Memory24 { writable: bool, min: u16, max: u16, alignment: u16, length: u16 },
    Memory32 { writable: bool, min: u32, max: u32, alignment: u32, length: u32 },
    FixedMemory32 { writable: bool, address: u32, length: u32 },
    AddressSpace { resource_type: u8, min: u64, max: u64, length: u64, granularity: u64 },
    ExtendedIrq { consumer: bool, edge_triggered: bool, active_low: bool, shared: bool, irqs: Vec<u32> },
    Unknown { tag: u8, bytes: Vec<u8> },
    EndTag,
}

const SMALL_ITEM_IRQ: u8 = 0x4;
const SMALL_ITEM_DMA: u8 = 0x5;
const SMALL_ITEM_START_DEPENDENT: u8 = 0x6;
const SMALL_ITEM_END_DEPENDENT: u8 = 0x7;
const SMALL_ITEM_IO: u8 = 0x8;
const SMALL_ITEM_FIXED_IO: u8 = 0x9;
const SMALL_ITEM_END_TAG: u8 = 0xf;

const LARGE_ITEM_MEMORY24: u8 = 0x1;
const LARGE_ITEM_VENDOR_DEFINED: u8 = 0x4;
const LARGE_ITEM_MEMORY32: u8 = 0x5;
const LARGE_ITEM_FIXED_MEMORY32: u8 = 0x6;
const LARGE_ITEM_DWORD_ADDRESS_SPACE: u8 = 0x7;
const LARGE_ITEM_WORD_ADDRESS_SPACE: u8 = 0x8;
const LARGE_ITEM_EXTENDED_IRQ: u8 = 0x9;
const LARGE_ITEM_QWORD_ADDRESS_SPACE: u8 = 0xa;

/// Parses every descriptor out of a `_CRS`-style byte buffer, stopping at (and including) the
/// `EndTag`. Unrecognized tags are captured as [`Resource::Unknown`] rather than aborting, so a
/// caller interested in only e.g. IRQs isn't blocked by a descriptor kind this module hasn't
/// learned yet.
pub fn resources_from_buffer(buffer: &[u8]) -> Result<Vec<Resource>, AmlError> {
    let mut resources = Vec::new();
    let mut cursor = 0usize;

    while cursor < buffer.len() {
        let tag_byte = buffer[cursor];
        let is_large = tag_byte.get_bit(7);

        if is_large {
            let tag = tag_byte.get_bits(0..7);
            if cursor + 3 > buffer.len() {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let length = u16::from_le_bytes([buffer[cursor + 1], buffer[cursor + 2]]) as usize;
            let body_start = cursor + 3;
            if body_start + length > buffer.len() {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let body = &buffer[body_start..body_start + length];
            resources.push(decode_large_item(tag, body)?);
            cursor = body_start + length;
        } else {
            let tag = tag_byte.get_bits(3..7);
            let length = tag_byte.get_bits(0..3) as usize;
            let body_start = cursor + 1;
            if body_start + length > buffer.len() {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let body = &buffer[body_start..body_start + length];
            let end = tag == SMALL_ITEM_END_TAG;
            resources.push(decode_small_item(tag, body)?);
            cursor = body_start + length;
            if end {
                break;
            }
        }
    }

    Ok(resources)
}

fn decode_small_item(tag: u8, body: &[u8]) -> Result<Resource, AmlError> {
    match tag {
        SMALL_ITEM_IRQ => {
            if body.len() < 2 {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let mask = u16::from_le_bytes([body[0], body[1]]);
            let (edge_triggered, active_low, shared) = if body.len() >= 3 {
                (body[2].get_bit(0), body[2].get_bit(3), body[2].get_bit(4))
            } else {
                (true, false, false)
            };
            Ok(Resource::Irq { mask, edge_triggered, active_low, shared })
        }

        SMALL_ITEM_DMA => {
            if body.is_empty() {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let channel_mask = body[0];
            let bus_master = body.get(1).map(|b| b.get_bit(2)).unwrap_or(false);
            Ok(Resource::Dma { channel_mask, bus_master })
        }

        SMALL_ITEM_START_DEPENDENT | SMALL_ITEM_END_DEPENDENT => {
            Ok(Resource::Unknown { tag, bytes: body.to_vec() })
        }

        SMALL_ITEM_IO => {
            if body.len() < 7 {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let decodes_16bit = body[0].get_bit(0);
            let min = u16::from_le_bytes([body[1], body[2]]);
            let max = u16::from_le_bytes([body[3], body[4]]);
            Ok(Resource::Io { min, max, alignment: body[5], length: body[6], decodes_16bit })
        }

        SMALL_ITEM_FIXED_IO => {
            if body.len() < 3 {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let address = u16::from_le_bytes([body[0], body[1]]);
            Ok(Resource::FixedIo { address, length: body[2] })
        }

        SMALL_ITEM_END_TAG => Ok(Resource::EndTag),

        _ => Ok(Resource::Unknown { tag, bytes: body.to_vec() }),
    }
}

fn decode_large_item(tag: u8, body: &[u8]) -> Result<Resource, AmlError> {
    match tag {
        LARGE_ITEM_MEMORY24 => {
            if body.len() < 9 {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let writable = body[0].get_bit(0);
            let min = u16::from_le_bytes([body[1], body[2]]);
            let max = u16::from_le_bytes([body[3], body[4]]);
            let alignment = u16::from_le_bytes([body[5], body[6]]);
            let length = u16::from_le_bytes([body[7], body[8]]);
            Ok(Resource::Memory24 { writable, min, max, alignment, length })
        }

        LARGE_ITEM_MEMORY32 => {
            if body.len() < 17 {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let writable = body[0].get_bit(0);
            let min = u32::from_le_bytes(body[1..5].try_into().unwrap());
            let max = u32::from_le_bytes(body[5..9].try_into().unwrap());
            let alignment = u32::from_le_bytes(body[9..13].try_into().unwrap());
            let length = u32::from_le_bytes(body[13..17].try_into().unwrap());
            Ok(Resource::Memory32 { writable, min, max, alignment, length })
        }

        LARGE_ITEM_FIXED_MEMORY32 => {
            if body.len() < 9 {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let writable = body[0].get_bit(0);
            let address = u32::from_le_bytes(body[1..5].try_into().unwrap());
            let length = u32::from_le_bytes(body[5..9].try_into().unwrap());
            Ok(Resource::FixedMemory32 { writable, address, length })
        }

        LARGE_ITEM_DWORD_ADDRESS_SPACE => decode_address_space(body, 4),
        LARGE_ITEM_WORD_ADDRESS_SPACE => decode_address_space(body, 2),
        LARGE_ITEM_QWORD_ADDRESS_SPACE => decode_address_space(body, 8),

        LARGE_ITEM_EXTENDED_IRQ => {
            if body.len() < 2 {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let consumer = body[0].get_bit(0);
            let edge_triggered = body[0].get_bit(1);
            let active_low = body[0].get_bit(2);
            let shared = body[0].get_bit(3);
            let count = body[1] as usize;
            if body.len() < 2 + count * 4 {
                return Err(AmlError::ResourceDescriptorTooShort);
            }
            let mut irqs = Vec::with_capacity(count);
            for i in 0..count {
                let offset = 2 + i * 4;
                irqs.push(u32::from_le_bytes(body[offset..offset + 4].try_into().unwrap()));
            }
            Ok(Resource::ExtendedIrq { consumer, edge_triggered, active_low, shared, irqs })
        }

        LARGE_ITEM_VENDOR_DEFINED => Ok(Resource::Unknown { tag, bytes: body.to_vec() }),

        _ => Ok(Resource::Unknown { tag, bytes: body.to_vec() }),
    }
}

/// Decodes the common tail shared by the Word/DWord/QWord Address Space descriptors: a resource
/// type byte followed by `unit_size`-wide granularity/min/max/translation/length fields.
fn decode_address_space(body: &[u8], unit_size: usize) -> Result<Resource, AmlError> {
    // general flags (1) + type-specific flags (1) + 5 * unit_size fields
    let header = 3;
    if body.len() < header + unit_size * 5 {
        return Err(AmlError::ResourceDescriptorTooShort);
    }
    let resource_type = body[0];

    let read_uint = |offset: usize| -> u64 {
        let mut value = 0u64;
        for i in 0..unit_size {
            value |= (body[offset + i] as u64) << (i * 8);
        }
        value
    };

    let granularity = read_uint(header);
    let min = read_uint(header + unit_size);
    let max = read_uint(header + unit_size * 2);
    let length = read_uint(header + unit_size * 4);

    Ok(Resource::AddressSpace { resource_type, min, max, length, granularity })
}

/// Encodes a sequence of resources back into a `_SRS`-style buffer, for `set_current_resources`
/// (spec.md §6). Appends the `EndTag` with a zero checksum if the caller's list didn't include one.
pub fn resources_to_buffer(resources: &[Resource]) -> Vec<u8> {
    let mut buffer = Vec::new();

    for resource in resources {
        encode_resource(resource, &mut buffer);
    }

    if !matches!(resources.last(), Some(Resource::EndTag)) {
        encode_resource(&Resource::EndTag, &mut buffer);
    }

    buffer
}

fn encode_resource(resource: &Resource, buffer: &mut Vec<u8>) {
    match resource {
        Resource::Irq { mask, edge_triggered, active_low, shared } => {
            let mut flags = 0u8;
            flags.set_bit(0, *edge_triggered);
            flags.set_bit(3, *active_low);
            flags.set_bit(4, *shared);
            buffer.push(small_tag(SMALL_ITEM_IRQ, 3));
            buffer.extend_from_slice(&mask.to_le_bytes());
            buffer.push(flags);
        }

        Resource::Dma { channel_mask, bus_master } => {
            buffer.push(small_tag(SMALL_ITEM_DMA, 2));
            buffer.push(*channel_mask);
            let mut flags = 0u8;
            flags.set_bit(2, *bus_master);
            buffer.push(flags);
        }

        Resource::Io { min, max, alignment, length, decodes_16bit } => {
            buffer.push(small_tag(SMALL_ITEM_IO, 7));
            buffer.push(if *decodes_16bit { 1 } else { 0 });
            buffer.extend_from_slice(&min.to_le_bytes());
            buffer.extend_from_slice(&max.to_le_bytes());
            buffer.push(*alignment);
            buffer.push(*length);
        }

        Resource::FixedIo { address, length } => {
            buffer.push(small_tag(SMALL_ITEM_FIXED_IO, 3));
            buffer.extend_from_slice(&address.to_le_bytes());
            buffer.push(*length);
        }

        Resource::Memory24 { writable, min, max, alignment, length } => {
            buffer.push(large_tag(LARGE_ITEM_MEMORY24));
            buffer.extend_from_slice(&9u16.to_le_bytes());
            buffer.push(if *writable { 1 } else { 0 });
            buffer.extend_from_slice(&min.to_le_bytes());
            buffer.extend_from_slice(&max.to_le_bytes());
            buffer.extend_from_slice(&alignment.to_le_bytes());
            buffer.extend_from_slice(&length.to_le_bytes());
        }

        Resource::Memory32 { writable, min, max, alignment, length } => {
            buffer.push(large_tag(LARGE_ITEM_MEMORY32));
            buffer.extend_from_slice(&17u16.to_le_bytes());
            buffer.push(if *writable { 1 } else { 0 });
            buffer.extend_from_slice(&min.to_le_bytes());
            buffer.extend_from_slice(&max.to_le_bytes());
            buffer.extend_from_slice(&alignment.to_le_bytes());
            buffer.extend_from_slice(&length.to_le_bytes());
        }

        Resource::FixedMemory32 { writable, address, length } => {
            buffer.push(large_tag(LARGE_ITEM_FIXED_MEMORY32));
            buffer.extend_from_slice(&9u16.to_le_bytes());
            buffer.push(if *writable { 1 } else { 0 });
            buffer.extend_from_slice(&address.to_le_bytes());
            buffer.extend_from_slice(&length.to_le_bytes());
        }

        Resource::AddressSpace { resource_type, min, max, length, granularity } => {
            buffer.push(large_tag(LARGE_ITEM_DWORD_ADDRESS_SPACE));
            buffer.extend_from_slice(&23u16.to_le_bytes());
            buffer.push(*resource_type);
            buffer.push(0); // general flags
            buffer.push(0); // type-specific flags
            buffer.extend_from_slice(&(*granularity as u32).to_le_bytes());
            buffer.extend_from_slice(&(*min as u32).to_le_bytes());
            buffer.extend_from_slice(&(*max as u32).to_le_bytes());
            buffer.extend_from_slice(&0u32.to_le_bytes()); // translation offset
            buffer.extend_from_slice(&(*length as u32).to_le_bytes());
        }

        Resource::ExtendedIrq { consumer, edge_triggered, active_low, shared, irqs } => {
            let body_len = 2 + irqs.len() * 4;
            buffer.push(large_tag(LARGE_ITEM_EXTENDED_IRQ));
            buffer.extend_from_slice(&(body_len as u16).to_le_bytes());
            let mut flags = 0u8;
            flags.set_bit(0, *consumer);
            flags.set_bit(1, *edge_triggered);
            flags.set_bit(2, *active_low);
            flags.set_bit(3, *shared);
            buffer.push(flags);
            buffer.push(irqs.len() as u8);
            for irq in irqs {
                buffer.extend_from_slice(&irq.to_le_bytes());
            }
        }

        Resource::Unknown { tag, bytes } => {
            if tag.get_bit(7) {
                buffer.push(*tag);
                buffer.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            } else {
                buffer.push(small_tag(tag.get_bits(0..4), bytes.len()));
            }
            buffer.extend_from_slice(bytes);
        }

        Resource::EndTag => {
            buffer.push(small_tag(SMALL_ITEM_END_TAG, 1));
            buffer.push(0); // checksum (0 = "not used")
        }
    }
}

fn small_tag(tag: u8, length: usize) -> u8 {
    let mut byte = 0u8;
    byte.set_bits(3..7, tag);
    byte.set_bits(0..3, length as u8);
    byte
}

fn large_tag(tag: u8) -> u8 {
    let mut byte = 0x80u8;
    byte.set_bits(0..7, tag);
    byte
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fixed_io_and_end_tag() {
        let buffer = resources_to_buffer(&[Resource::FixedIo { address: 0x60, length: 1 }]);
        let resources = resources_from_buffer(&buffer).unwrap();
        assert_eq!(resources[0], Resource::FixedIo { address: 0x60, length: 1 });
        assert_eq!(resources[1], Resource::EndTag);
    }

    #[test]
    fn decodes_irq_descriptor() {
        let irq = Resource::Irq { mask: 0x0020, edge_triggered: true, active_low: false, shared: false };
        let buffer = resources_to_buffer(&[irq.clone()]);
        let resources = resources_from_buffer(&buffer).unwrap();
        assert_eq!(resources[0], irq);
    }

    #[test]
    fn decodes_extended_irq_with_multiple_irqs() {
        let irq = Resource::ExtendedIrq {
            consumer: true,
            edge_triggered: true,
            active_low: false,
            shared: false,
            irqs: alloc::vec![9, 10],
        };
        let buffer = resources_to_buffer(&[irq.clone()]);
        let resources = resources_from_buffer(&buffer).unwrap();
        assert_eq!(resources[0], irq);
    }

    #[test]
    fn truncated_descriptor_is_rejected() {
        let bytes = [small_tag(SMALL_ITEM_FIXED_IO, 3), 0x60];
        assert_eq!(resources_from_buffer(&bytes), Err(AmlError::ResourceDescriptorTooShort));
    }
}
