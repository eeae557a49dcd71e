//! PCI routing table (`_PRT`) evaluation (spec.md §6 "get_current_resources / ... /
//! irq_routing_table"). `_PRT` evaluates to a `Package` of 4-element packages: `(Address, Pin,
//! Source, SourceIndex)`. This module turns that `AmlValue::Package` into typed [`PrtEntry`]
//! values and answers the routing question a PCI driver actually asks: "which GSI (or link
//! device) serves this device's interrupt pin".
//!
//! Grounded on `original_source/drivers/acpi/resources/rsxface.c`'s `irq_routing_table` interface
//! and the ACPI specification's `_PRT` package layout. Because this interpreter's `name_or_method_call`
//! (`expression.rs`) resolves a package element that's a bare device name eagerly to that device's
//! *value* rather than preserving its path (see `expression.rs::package_element`), a `_PRT` entry
//! whose `Source` names a PCI Link Device loses that device's path here - `PrtSource::LinkDevice`
//! only remembers that indirection exists, not which device it points to. A caller that needs the
//! actual GSI behind a link device must resolve `_CRS` on it separately, keyed by whatever
//! identified the device before `_PRT` was evaluated. This is recorded as a limitation in
//! DESIGN.md, not silently worked around.

use alloc::vec::Vec;

use crate::{value::AmlValue, AmlContext, AmlError};

/// Where a `_PRT` entry's interrupt actually comes from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PrtSource {
    /// `Source` was the integer constant `0`; `SourceIndex` is a GSI number directly.
    Hardwired,
    /// `Source` named a PCI Link Device; the device's `_CRS` must be consulted (by the caller,
    /// using whatever handle it has on that device - see module docs) to learn the actual GSI.
    /// `SourceIndex` selects which resource of that device's list this entry corresponds to.
    LinkDevice,
}

/// One decoded `_PRT` entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PrtEntry {
    /// `(device_number << 16) | function_number`, with `function_number == 0xffff` meaning "any
    /// function on this device".
    pub address: u32,
    /// `0..=3` for `INTA..INTD`.
    pub pin: u8,
    pub source: PrtSource,
    pub source_index: u32,
}

impl PrtEntry {
    /// The GSI this entry routes to, if it's known without consulting a link device.
    pub fn hardwired_gsi(&self) -> Option<u32> {
        match self.source {
            PrtSource::Hardwired => Some(self.source_index),
            PrtSource::LinkDevice => None,
        }
    }
}

/// Evaluates `\<device>._PRT` and decodes the resulting package.
pub fn evaluate_prt(context: &mut AmlContext, device: &crate::AmlName) -> Result<Vec<PrtEntry>, AmlError> {
    let prt_name = crate::AmlName::from_parts(false, 0, &[crate::name_object::NameSeg::from_bytes(*b"_PRT")?])
        .resolve(device)?;
    let value = context.invoke_method(&prt_name, crate::value::Args::EMPTY)?;
    decode_prt_package(&value, context)
}

/// Decodes an already-evaluated `_PRT` value (a `Package` of 4-element packages) into typed
/// entries, without re-invoking the method - useful for tests and for callers that cached the
/// package themselves.
pub fn decode_prt_package(value: &AmlValue, context: &AmlContext) -> Result<Vec<PrtEntry>, AmlError> {
    let outer = match value {
        AmlValue::Package(pkg) => pkg.lock(),
        other => {
            return Err(AmlError::IncompatibleValueConversion {
                current: other.type_of(),
                target: crate::value::AmlType::Package,
            })
        }
    };

    let mut entries = Vec::with_capacity(outer.len());
    for element in outer.iter() {
        entries.push(decode_prt_entry(element, context)?);
    }
    Ok(entries)
}

fn decode_prt_entry(entry: &AmlValue, context: &AmlContext) -> Result<PrtEntry, AmlError> {
    let fields = match entry {
        AmlValue::Package(pkg) => pkg.lock(),
        other => {
            return Err(AmlError::IncompatibleValueConversion {
                current: other.type_of(),
                target: crate::value::AmlType::Package,
            })
        }
    };

    if fields.len() != 4 {
        return Err(AmlError::PrtInvalidAddress);
    }

    let address = fields[0].as_integer(context)? as u32;
    let pin = fields[1].as_integer(context)?;
    if pin > 3 {
        return Err(AmlError::PrtInvalidPin);
    }

    let (source, source_index) = match &fields[2] {
        AmlValue::Integer(0) => {
            let index = fields[3].as_integer(context)?;
            (PrtSource::Hardwired, index as u32)
        }
        AmlValue::Integer(_) => return Err(AmlError::PrtInvalidSource),
        _device_value => {
            // A resolved Link Device object - see module docs for why we can't recover its path.
            let index = fields[3].as_integer(context)?;
            (PrtSource::LinkDevice, index as u32)
        }
    };

    if source == PrtSource::Hardwired && source_index > u32::from(u16::MAX) {
        return Err(AmlError::PrtInvalidGsi);
    }

    Ok(PrtEntry { address, pin: pin as u8, source, source_index })
}

/// Finds the entry routing `(device, function)`'s `pin` within a decoded `_PRT`. Per the ACPI
/// specification, an entry whose address has function `0xffff` matches any function on that
/// device; an exact `(device, function)` match takes priority over a wildcard one.
pub fn route_pin(entries: &[PrtEntry], device: u16, function: u16, pin: u8) -> Result<&PrtEntry, AmlError> {
    let exact_address = (u32::from(device) << 16) | u32::from(function);
    let wildcard_address = (u32::from(device) << 16) | 0xffff;

    entries
        .iter()
        .find(|e| e.address == exact_address && e.pin == pin)
        .or_else(|| entries.iter().find(|e| e.address == wildcard_address && e.pin == pin))
        .ok_or(AmlError::PrtNoEntry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{owner::OwnerId, test_utils::test_handler, value::Args, AmlName, DebugVerbosity};
    use alloc::{boxed::Box, string::ToString, sync::Arc, vec};
    use core::str::FromStr;
    use spin::Mutex as SpinMutex;

    fn hardwired_entry(address: u32, pin: u64, gsi: u64) -> AmlValue {
        AmlValue::Package(Arc::new(SpinMutex::new(vec![
            AmlValue::Integer(address as u64),
            AmlValue::Integer(pin),
            AmlValue::Integer(0),
            AmlValue::Integer(gsi),
        ])))
    }

    #[test]
    fn decodes_hardwired_prt_and_routes_exact_match() {
        let context = AmlContext::new(Box::new(test_handler()), DebugVerbosity::None);
        let prt = AmlValue::Package(Arc::new(SpinMutex::new(vec![
            hardwired_entry(0x0001_ffff, 0, 16),
            hardwired_entry(0x0002_0000, 1, 17),
        ])));

        let entries = decode_prt_package(&prt, &context).unwrap();
        assert_eq!(entries.len(), 2);

        let wildcard_match = route_pin(&entries, 1, 5, 0).unwrap();
        assert_eq!(wildcard_match.hardwired_gsi(), Some(16));

        let exact_match = route_pin(&entries, 2, 0, 1).unwrap();
        assert_eq!(exact_match.hardwired_gsi(), Some(17));

        assert_eq!(route_pin(&entries, 9, 0, 0), Err(AmlError::PrtNoEntry));
    }

    #[test]
    fn evaluate_prt_invokes_method_and_decodes_result() {
        let mut context = AmlContext::new(Box::new(test_handler()), DebugVerbosity::None);
        context.namespace.add_level(AmlName::from_str("\\PCI0").unwrap(), crate::LevelType::Device, OwnerId::PREDEFINED).unwrap();

        let prt = AmlValue::Package(Arc::new(SpinMutex::new(vec![hardwired_entry(0x0000_ffff, 0, 10)])));
        context
            .namespace
            .add_value(
                AmlName::from_str("\\PCI0._PRT").unwrap(),
                OwnerId::PREDEFINED,
                AmlValue::Method {
                    flags: crate::value::MethodFlags::from_bits_truncate(0),
                    code: crate::value::MethodCode::Native(Arc::new(move |_| Ok(prt.clone()))),
                    concurrency: None,
                },
            )
            .unwrap();

        let entries = evaluate_prt(&mut context, &AmlName::from_str("\\PCI0").unwrap()).unwrap();
        assert_eq!(entries, alloc::vec![PrtEntry { address: 0xffff, pin: 0, source: PrtSource::Hardwired, source_index: 10 }]);
        let _ = Args::EMPTY;
        let _ = "unused".to_string();
    }
}
