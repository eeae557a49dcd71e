//! `NamedObj`: the opcodes that bind a new entry into the namespace as a side effect of parsing -
//! `Scope`, `Device`, `Processor`, `PowerResource`, `ThermalZone`, `Method`, `Name`, `Alias`, the
//! field-group ops (`Field`/`IndexField`/`BankField`), `Mutex`, `Event`, `OpRegion`, and the
//! `CreateXField` buffer-field shorthands.
//!
//! Grounded on spec.md §4.1 ("Named ops ... trigger a namespace lookup in LOAD-PASS-1 ... at
//! parse time") and `original_source/drivers/acpi/dispatcher/dswload.c`'s per-opcode namespace
//! entry creation. `Method`/`OpRegion` bodies are deferred exactly as §4.1 describes: a method's
//! `TermList` is sliced out and stored unparsed, to be parsed lazily on first invocation
//! (`AmlContext::invoke_method`); a region's address/length `TermArg`s are evaluated eagerly here
//! since, unlike a method body, they aren't a further nested `TermList`.

use crate::{
    choice,
    expression::term_arg,
    name_object::{name_seg, name_string, NameSeg},
    namespace::{AmlName, LevelType},
    opregion::RegionSpace,
    parser::{extended_opcode, opcode, take, take_n, ParseResult, Parser, Propagate},
    pkg_length::{decode_pkg_length, pkg_length, PkgLength},
    sync::SyncLevel,
    term_object::term_list,
    value::{EventState, FieldContainer, FieldFlags, MethodCode, MethodFlags, MutexState},
    AmlContext, AmlError, AmlValue,
};
use alloc::sync::Arc;
use spin::Mutex as SpinMutex;

pub fn named_obj<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    choice!(
        alias_op(),
        name_op(),
        scope_op(),
        method_op(),
        mutex_op(),
        event_op(),
        op_region_op(),
        field_op(),
        device_op(),
        processor_op(),
        power_res_op(),
        thermal_zone_op(),
        index_field_op(),
        bank_field_op(),
        create_field_op(),
        create_bit_field_op(),
        create_byte_field_op(),
        create_word_field_op(),
        create_dword_field_op(),
        create_qword_field_op()
    )
}

/// Runs `term_list(length)` with `context.current_scope` temporarily set to `scope`, restoring
/// the caller's scope on every exit path - this is what lets a `Device`/`Processor`/... body
/// resolve its own children's relative names against itself rather than its parent.
fn scoped_term_list<'a, 'c>(
    scope: AmlName,
    length: PkgLength,
    input: &'a [u8],
    context: &'c mut AmlContext,
) -> ParseResult<'a, 'c, ()> {
    let previous_scope = core::mem::replace(&mut context.current_scope, scope);
    match term_list(length).parse(input, context) {
        Ok((input, context, ())) => {
            context.current_scope = previous_scope;
            Ok((input, context, ()))
        }
        Err((input, context, err)) => {
            context.current_scope = previous_scope;
            Err((input, context, err))
        }
    }
}

fn alias_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x06).parse(input, context)?;
        let (input, context, source) = name_string().parse(input, context)?;
        let (input, context, alias) = name_string().parse(input, context)?;

        let value = match context.namespace.get(&source) {
            Ok(value) => value.clone(),
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let owner = context.current_owner();
        match context.namespace.add_value(alias, owner, value) {
            Ok(()) => Ok((input, context, ())),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn name_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x08).parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;
        let (input, context, value) = term_arg().parse(input, context)?;
        let owner = context.current_owner();
        match context.namespace.add_value(name, owner, value) {
            Ok(()) => Ok((input, context, ())),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn scope_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x10).parse(input, context)?;
        let (input, context, length) = pkg_length().parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;
        let owner = context.current_owner();
        if let Err(err) = context.namespace.add_level(name.clone(), LevelType::Scope, owner) {
            return Err((input, context, Propagate::Err(err)));
        }
        scoped_term_list(name, length, input, context)
    }
}

fn method_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x14).parse(input, context)?;
        let (input, context, length) = pkg_length().parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;
        let (input, context, flags_byte) = take().parse(input, context)?;

        let flags = MethodFlags::from_bits_truncate(flags_byte);
        let concurrency = if flags.contains(MethodFlags::SERIALIZED) { Some(1) } else { None };

        let body_len = length.bytes_left(input);
        if body_len > input.len() {
            return Err((input, context, Propagate::Err(AmlError::InvalidPkgLength)));
        }
        let body: Arc<[u8]> = Arc::from(&input[..body_len]);
        let owner = context.current_owner();
        let value = AmlValue::Method { flags, code: MethodCode::Aml(body), concurrency };
        match context.namespace.add_value(name, owner, value) {
            Ok(()) => Ok((&input[body_len..], context, ())),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn mutex_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = extended_opcode(0x01).parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;
        let (input, context, sync_flags) = take().parse(input, context)?;

        let semaphore = match context.handler().create_semaphore(1, 1) {
            Ok(handle) => handle,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let value = AmlValue::Mutex(Arc::new(MutexState {
            sync_level: SyncLevel(sync_flags & 0xf),
            semaphore,
            held_by: SpinMutex::new(None),
        }));
        let owner = context.current_owner();
        match context.namespace.add_value(name, owner, value) {
            Ok(()) => Ok((input, context, ())),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn event_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = extended_opcode(0x02).parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;

        let value = AmlValue::Event(Arc::new(EventState { counter: crate::walk::EventCounter::new() }));
        let owner = context.current_owner();
        match context.namespace.add_value(name, owner, value) {
            Ok(()) => Ok((input, context, ())),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn op_region_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = extended_opcode(0x80).parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;
        let (input, context, space_byte) = take().parse(input, context)?;
        let (input, context, offset) = term_arg().parse(input, context)?;
        let (input, context, length) = term_arg().parse(input, context)?;

        let value = AmlValue::OpRegion {
            space: RegionSpace::from_byte(space_byte),
            offset: alloc::boxed::Box::new(offset),
            length: alloc::boxed::Box::new(length),
            parent_device: None,
        };
        let owner = context.current_owner();
        match context.namespace.add_value(name, owner, value) {
            Ok(()) => Ok((input, context, ())),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn device_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = extended_opcode(0x82).parse(input, context)?;
        let (input, context, length) = pkg_length().parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;
        let owner = context.current_owner();
        if let Err(err) = context.namespace.add_level(name.clone(), LevelType::Device, owner) {
            return Err((input, context, Propagate::Err(err)));
        }
        if let Err(err) = context.namespace.add_value(name.clone(), owner, AmlValue::Device) {
            return Err((input, context, Propagate::Err(err)));
        }
        scoped_term_list(name, length, input, context)
    }
}

fn processor_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = extended_opcode(0x83).parse(input, context)?;
        let (input, context, length) = pkg_length().parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;
        let (input, context, proc_id) = take().parse(input, context)?;
        let (input, context, pblk_bytes) = take_n(4).parse(input, context)?;
        let pblk_address = u32::from_le_bytes([pblk_bytes[0], pblk_bytes[1], pblk_bytes[2], pblk_bytes[3]]);
        let (input, context, pblk_length) = take().parse(input, context)?;

        let owner = context.current_owner();
        if let Err(err) = context.namespace.add_level(name.clone(), LevelType::Processor, owner) {
            return Err((input, context, Propagate::Err(err)));
        }
        let value = AmlValue::Processor { proc_id, pblk_address, pblk_length };
        if let Err(err) = context.namespace.add_value(name.clone(), owner, value) {
            return Err((input, context, Propagate::Err(err)));
        }
        scoped_term_list(name, length, input, context)
    }
}

fn power_res_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = extended_opcode(0x84).parse(input, context)?;
        let (input, context, length) = pkg_length().parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;
        let (input, context, system_level) = take().parse(input, context)?;
        let (input, context, order_bytes) = take_n(2).parse(input, context)?;
        let resource_order = u16::from_le_bytes([order_bytes[0], order_bytes[1]]);

        let owner = context.current_owner();
        if let Err(err) = context.namespace.add_level(name.clone(), LevelType::PowerResource, owner) {
            return Err((input, context, Propagate::Err(err)));
        }
        let value = AmlValue::PowerResource { system_level, resource_order };
        if let Err(err) = context.namespace.add_value(name.clone(), owner, value) {
            return Err((input, context, Propagate::Err(err)));
        }
        scoped_term_list(name, length, input, context)
    }
}

fn thermal_zone_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = extended_opcode(0x85).parse(input, context)?;
        let (input, context, length) = pkg_length().parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;

        let owner = context.current_owner();
        if let Err(err) = context.namespace.add_level(name.clone(), LevelType::ThermalZone, owner) {
            return Err((input, context, Propagate::Err(err)));
        }
        if let Err(err) = context.namespace.add_value(name.clone(), owner, AmlValue::ThermalZone) {
            return Err((input, context, Propagate::Err(err)));
        }
        scoped_term_list(name, length, input, context)
    }
}

fn field_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = extended_opcode(0x81).parse(input, context)?;
        let (input, context, length) = pkg_length().parse(input, context)?;
        let (input, context, region) = name_string().parse(input, context)?;
        field_list(length, FieldContainer::Region(region)).parse(input, context)
    }
}

fn index_field_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = extended_opcode(0x86).parse(input, context)?;
        let (input, context, length) = pkg_length().parse(input, context)?;
        let (input, context, index) = name_string().parse(input, context)?;
        let (input, context, data) = name_string().parse(input, context)?;
        field_list(length, FieldContainer::Index { index, data }).parse(input, context)
    }
}

fn bank_field_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = extended_opcode(0x87).parse(input, context)?;
        let (input, context, length) = pkg_length().parse(input, context)?;
        let (input, context, region) = name_string().parse(input, context)?;
        let (input, context, bank_select) = name_string().parse(input, context)?;
        let (input, context, bank_value) = term_arg().parse(input, context)?;
        let bank_value = match bank_value.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        field_list(length, FieldContainer::Bank { region, bank_select, bank_value }).parse(input, context)
    }
}

/// `FieldList`: a `FieldFlags` byte followed by a run of `NamedField`/`ReservedField`/
/// `AccessField` entries packed end to end, each contributing to a running bit cursor. A named
/// field's own length uses the same variable-length integer encoding as a `PkgLength`, but here
/// it's a plain bit count rather than a "bytes remaining" marker, so it's decoded with
/// [`decode_pkg_length`] directly rather than through the `PkgLength` parser.
fn field_list<'a, 'c>(length: PkgLength, container: FieldContainer) -> impl Parser<'a, 'c, ()> {
    move |input: &'a [u8], context: &'c mut AmlContext| {
        let (mut input, mut context, flags_byte) = take().parse(input, context)?;
        let mut current_flags = FieldFlags::from_bits_truncate(flags_byte);
        let mut bit_cursor: u64 = 0;

        while length.still_parsing(input) {
            match input.first() {
                Some(0x00) => {
                    let (bit_len, consumed) = match decode_pkg_length(&input[1..]) {
                        Ok(v) => v,
                        Err(err) => return Err((input, context, Propagate::Err(err))),
                    };
                    input = &input[1 + consumed..];
                    bit_cursor += bit_len as u64;
                }
                Some(0x01) => {
                    if input.len() < 3 {
                        return Err((input, context, Propagate::Err(AmlError::UnexpectedEndOfStream)));
                    }
                    let access_type = input[1];
                    current_flags =
                        FieldFlags::from_bits_truncate((current_flags.bits() & !0x0f) | (access_type & 0x0f));
                    input = &input[3..];
                }
                Some(_) => {
                    let (new_input, new_context, seg): (&[u8], &mut AmlContext, NameSeg) =
                        name_seg().parse(input, context)?;
                    let (bit_len, consumed) = match decode_pkg_length(new_input) {
                        Ok(v) => v,
                        Err(err) => return Err((new_input, new_context, Propagate::Err(err))),
                    };
                    let path = AmlName::from_parts(false, 0, &[seg]).resolve(&new_context.current_scope);
                    let path = match path {
                        Ok(p) => p,
                        Err(err) => return Err((new_input, new_context, Propagate::Err(err))),
                    };
                    let value = AmlValue::Field {
                        container: container.clone(),
                        flags: current_flags,
                        bit_index: bit_cursor,
                        bit_length: bit_len as u64,
                    };
                    let owner = new_context.current_owner();
                    if let Err(err) = new_context.namespace.add_value(path, owner, value) {
                        return Err((new_input, new_context, Propagate::Err(err)));
                    }
                    bit_cursor += bit_len as u64;
                    input = &new_input[consumed..];
                    context = new_context;
                }
                None => break,
            }
        }
        Ok((input, context, ()))
    }
}

fn create_field_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = extended_opcode(0x13).parse(input, context)?;
        let (input, context, buffer) = name_string().parse(input, context)?;
        let (input, context, bit_index) = term_arg().parse(input, context)?;
        let (input, context, num_bits) = term_arg().parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;

        let bit_index = match bit_index.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let bit_length = match num_bits.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let value = AmlValue::BufferField { buffer, bit_index, bit_length };
        let owner = context.current_owner();
        match context.namespace.add_value(name, owner, value) {
            Ok(()) => Ok((input, context, ())),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn create_fixed_width_field<'a, 'c>(op: u8, bit_length: u64, index_is_in_bytes: bool) -> impl Parser<'a, 'c, ()> {
    move |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(op).parse(input, context)?;
        let (input, context, buffer) = name_string().parse(input, context)?;
        let (input, context, index) = term_arg().parse(input, context)?;
        let (input, context, name) = name_string().parse(input, context)?;

        let index = match index.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let bit_index = if index_is_in_bytes { index * 8 } else { index };
        let value = AmlValue::BufferField { buffer, bit_index, bit_length };
        let owner = context.current_owner();
        match context.namespace.add_value(name, owner, value) {
            Ok(()) => Ok((input, context, ())),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn create_bit_field_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    create_fixed_width_field(0x8d, 1, false)
}

fn create_byte_field_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    create_fixed_width_field(0x8c, 8, true)
}

fn create_word_field_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    create_fixed_width_field(0x8b, 16, true)
}

fn create_dword_field_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    create_fixed_width_field(0x8a, 32, true)
}

fn create_qword_field_op<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    create_fixed_width_field(0x8f, 64, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::test_handler, DebugVerbosity};
    use alloc::boxed::Box;
    use core::str::FromStr;

    fn fresh_context() -> AmlContext {
        AmlContext::new(Box::new(test_handler()), DebugVerbosity::None)
    }

    #[test]
    fn name_op_binds_integer_under_root() {
        let mut context = fresh_context();
        // Name(FOO, 0x2A)
        let body: &[u8] = &[0x08, b'F', b'O', b'O', b'_', 0x0a, 0x2a];
        let (rest, _, ()) = named_obj().parse(body, &mut context).unwrap();
        assert!(rest.is_empty());
        let value = context.namespace.get(&AmlName::from_str("\\FOO").unwrap()).unwrap();
        assert_eq!(*value, AmlValue::Integer(0x2a));
    }

    #[test]
    fn device_op_opens_scope_and_binds_device_value() {
        let mut context = fresh_context();
        // Device(DEV_) { Name(BAR_, 7) }
        let device_body: &[u8] = &[b'D', b'E', b'V', b'_', 0x08, b'B', b'A', b'R', b'_', 0x0a, 0x07];
        let mut full = alloc::vec![0x5b, 0x82];
        let pkg = crate::pkg_length::encode_pkg_length(device_body.len() as u32);
        full.extend_from_slice(pkg.as_slice());
        full.extend_from_slice(device_body);

        let (rest, _, ()) = named_obj().parse(&full, &mut context).unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            *context.namespace.get(&AmlName::from_str("\\DEV").unwrap()).unwrap(),
            AmlValue::Device
        );
        assert_eq!(
            *context.namespace.get(&AmlName::from_str("\\DEV.BAR").unwrap()).unwrap(),
            AmlValue::Integer(7)
        );
    }

    #[test]
    fn alias_op_shares_target_value() {
        let mut context = fresh_context();
        context
            .namespace
            .add_value(AmlName::from_str("\\FOO").unwrap(), context.current_owner(), AmlValue::Integer(9))
            .unwrap();
        // Alias(FOO, BAR)
        let body: &[u8] = &[0x06, b'F', b'O', b'O', b'_', b'B', b'A', b'R', b'_'];
        let (rest, _, ()) = named_obj().parse(body, &mut context).unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            *context.namespace.get(&AmlName::from_str("\\BAR").unwrap()).unwrap(),
            AmlValue::Integer(9)
        );
    }
}
