//! The opcode table: a static map from an AML opcode (one byte, or two bytes when prefixed by the
//! extended-opcode lead byte `0x5b`) to an info record describing its name, execute-type class,
//! and argument count (spec.md §2 "Opcode table", §4.4).
//!
//! This mirrors the dispatch shape of `original_source/drivers/acpi/dispatcher/dswexec.c`, which
//! switches on exactly these classes to route an op to its execute routine. The teacher crate
//! instead encodes dispatch as which parser combinator matched (`expression.rs`/`statement.rs`);
//! we keep that shape for parsing (§4.1) but add this table for the *interpreter's* classification
//! of an already-parsed op, since SPEC_FULL.md's walk-state machine needs to answer "what kind of
//! thing is this opcode" independent of which combinator happened to parse it.

#![allow(dead_code)]

/// The dispatch class spec.md §4.4 groups ops into.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpClass {
    Control,
    NamedObject,
    Monadic1,
    Monadic2,
    Monadic2R,
    Dyadic1,
    Dyadic2,
    Dyadic2R,
    Dyadic2S,
    CreateField,
    Index,
    Match,
    Fatal,
    Reconfiguration,
    MethodCall,
}

#[derive(Clone, Copy, Debug)]
pub struct OpInfo {
    pub name: &'static str,
    pub class: OpClass,
    /// Number of operands the class expects, per spec.md §4.4 ("explicit operand counts
    /// 3/3/6/3/1-2" for CreateField/Index/Match/Fatal/Reconfiguration).
    pub operand_count: u8,
}

macro_rules! op {
    ($name:expr, $class:expr, $operands:expr) => {
        Some(OpInfo { name: $name, class: $class, operand_count: $operands })
    };
}

/// Looks up the info record for a one-byte opcode.
pub fn one_byte(byte: u8) -> Option<OpInfo> {
    use OpClass::*;
    match byte {
        0x10 => op!("Scope", NamedObject, 0),
        0x14 => op!("Method", NamedObject, 0),
        0x5b => None, // extended-opcode lead byte, handled by `extended`
        0x06 => op!("Alias", NamedObject, 0),
        0x08 => op!("Name", NamedObject, 0),
        0x72 => op!("Add", Dyadic2, 2),
        0x74 => op!("Subtract", Dyadic2, 2),
        0x77 => op!("Multiply", Dyadic2, 2),
        0x79 => op!("ShiftLeft", Dyadic2, 2),
        0x7a => op!("ShiftRight", Dyadic2, 2),
        0x7b => op!("And", Dyadic2, 2),
        0x7d => op!("Or", Dyadic2, 2),
        0x7f => op!("Xor", Dyadic2, 2),
        0x70 => op!("Store", Dyadic1, 2),
        0x75 => op!("Increment", Monadic1, 1),
        0x76 => op!("Decrement", Monadic1, 1),
        0x80 => op!("CreateDWordField", CreateField, 3),
        0x8a => op!("CreateBitField", CreateField, 3),
        0x8b => op!("CreateByteField", CreateField, 3),
        0x8c => op!("CreateWordField", CreateField, 3),
        0x8d => op!("CreateQWordField", CreateField, 3),
        0x86 => op!("Notify", Dyadic1, 2),
        0x87 => op!("SizeOf", Monadic2, 1),
        0x88 => op!("Index", Index, 3),
        0x89 => op!("Match", Match, 6),
        0x90 => op!("LAnd", Dyadic2, 2),
        0x91 => op!("LOr", Dyadic2, 2),
        0x92 => op!("LNot", Monadic2, 1),
        0x93 => op!("LEqual", Dyadic2, 2),
        0x94 => op!("LGreater", Dyadic2, 2),
        0x95 => op!("LLess", Dyadic2, 2),
        0xa0 => op!("If", Control, 1),
        0xa1 => op!("Else", Control, 0),
        0xa2 => op!("While", Control, 1),
        0xa3 => op!("Noop", Control, 0),
        0xa4 => op!("Return", Control, 1),
        0xa5 => op!("Break", Control, 0),
        0x5c => None, // root prefix, not an opcode
        0x5e => None, // parent prefix
        _ => None,
    }
}

/// Looks up the info record for an extended (`0x5b`-prefixed) opcode.
pub fn extended(byte: u8) -> Option<OpInfo> {
    use OpClass::*;
    match byte {
        0x01 => op!("Mutex", NamedObject, 0),
        0x02 => op!("Event", NamedObject, 0),
        0x80 => op!("OpRegion", NamedObject, 0),
        0x81 => op!("Field", NamedObject, 0),
        0x82 => op!("Device", NamedObject, 0),
        0x83 => op!("Processor", NamedObject, 0),
        0x84 => op!("PowerRes", NamedObject, 0),
        0x85 => op!("ThermalZone", NamedObject, 0),
        0x86 => op!("IndexField", NamedObject, 0),
        0x87 => op!("BankField", NamedObject, 0),
        0x21 => op!("Stall", Monadic1, 1),
        0x22 => op!("Sleep", Monadic1, 1),
        0x23 => op!("Acquire", Dyadic2S, 2),
        0x24 => op!("Signal", Dyadic2S, 1),
        0x25 => op!("Wait", Dyadic2S, 2),
        0x26 => op!("Reset", Dyadic2S, 1),
        0x27 => op!("Release", Dyadic2S, 1),
        0x28 => op!("ToBCD", Dyadic2R, 2),
        0x29 => op!("FromBCD", Dyadic2R, 2),
        0x33 => op!("Revision", Monadic2, 0),
        _ => None,
    }
}

/// `Fatal`/`Reconfiguration` (Load/Unload/Reset) classes, broken out because their operand counts
/// vary by specific opcode rather than being uniform across the class (spec.md §4.4: "1-2").
pub fn reconfiguration_operand_count(name: &str) -> u8 {
    match name {
        "Load" => 2,
        "Unload" => 1,
        "Reset" => 0,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_class_covers_if_else_while() {
        assert_eq!(one_byte(0xa0).unwrap().class, OpClass::Control);
        assert_eq!(one_byte(0xa1).unwrap().class, OpClass::Control);
        assert_eq!(one_byte(0xa2).unwrap().class, OpClass::Control);
    }

    #[test]
    fn unknown_opcode_is_none_not_a_panic() {
        assert!(one_byte(0xff).is_none());
    }

    #[test]
    fn create_field_operand_counts_match_spec() {
        assert_eq!(one_byte(0x8a).unwrap().operand_count, 3);
        assert_eq!(one_byte(0x88).unwrap().operand_count, 3); // Index
        assert_eq!(one_byte(0x89).unwrap().operand_count, 6); // Match
    }
}
