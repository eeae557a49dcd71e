//! `TermArg`/`ExpressionOpcode`: everything that evaluates to a value - literals, arg/local
//! references, a plain name lookup, a method call, and the arithmetic/logical/synchronization
//! operators (spec.md §4.4's `MONADIC*`/`DYADIC*`/`INDEX` classes).
//!
//! Grounded on the teacher's module list (`pub(crate) mod expression`) and
//! `original_source/drivers/acpi/dispatcher/dsopcode.c`/`dsmethod.c` for method-call resolution
//! (look the name up, and if it's a method, consume `arg_count` more `TermArg`s and invoke it)
//! rather than a separate `MethodInvocation` grammar production threaded through from the caller.

use crate::{
    choice,
    misc::{ArgNum, LocalNum},
    name_object::{name_string, Target},
    namespace::AmlName,
    parser::{map, map_with_context, opcode, take, take_n, Parser, Propagate},
    pkg_length::pkg_length,
    value::{Args, MethodCode},
    AmlContext, AmlError, AmlValue,
};
use alloc::{string::String, sync::Arc, vec::Vec};
use core::time::Duration;
use spin::Mutex as SpinMutex;

pub fn term_arg<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    choice!(data_object(), local_obj(), arg_obj(), expression_opcode(), name_or_method_call())
}

pub fn expression_opcode<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    choice!(
        store(),
        dyadic_arith(0x72, |a, b| a.wrapping_add(b)),
        dyadic_arith(0x74, |a, b| a.wrapping_sub(b)),
        dyadic_arith(0x77, |a, b| a.wrapping_mul(b)),
        dyadic_arith(0x7b, |a, b| a & b),
        dyadic_arith(0x7d, |a, b| a | b),
        dyadic_arith(0x7f, |a, b| a ^ b),
        shift_left(),
        shift_right(),
        increment_decrement(0x75, 1),
        increment_decrement(0x76, -1),
        logical_dyadic(0x90, |a, b| a != 0 && b != 0),
        logical_dyadic(0x91, |a, b| a != 0 || b != 0),
        logical_dyadic(0x93, |a, b| a == b),
        logical_dyadic(0x94, |a, b| a > b),
        logical_dyadic(0x95, |a, b| a < b),
        logical_not(),
        size_of(),
        index_op(),
        notify_op(),
        sync_op(0x23, SyncOp::Acquire),
        sync_op(0x24, SyncOp::Signal),
        sync_op(0x25, SyncOp::Wait),
        sync_op(0x26, SyncOp::Reset),
        sync_op(0x27, SyncOp::Release)
    )
}

/// Parses a `NameString`, looks it up, and - if it resolves to a `Method` - consumes the method's
/// declared argument count as further `TermArg`s and invokes it. Otherwise the looked-up value is
/// returned as-is (spec.md §6: "AML can encode methods that don't require computation simply as
/// the value that would otherwise be returned").
fn name_or_method_call<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, name) = name_string().parse(input, context)?;
        let value = match context.namespace.get(&name) {
            Ok(value) => value.clone(),
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };

        match value {
            AmlValue::Method { flags, .. } => {
                let arg_count = flags.arg_count();
                let mut args = Vec::with_capacity(arg_count as usize);
                let mut input = input;
                let mut context = context;
                for _ in 0..arg_count {
                    let (new_input, new_context, arg) = term_arg().parse(input, context)?;
                    args.push(arg);
                    input = new_input;
                    context = new_context;
                }
                match context.invoke_method(&name, Args(args)) {
                    Ok(result) => Ok((input, context, result)),
                    Err(err) => Err((input, context, Propagate::Err(err))),
                }
            }
            other => Ok((input, context, other)),
        }
    }
}

fn data_object<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    choice!(
        map(opcode(0x00), |()| AmlValue::Integer(0)),
        map(opcode(0x01), |()| AmlValue::Integer(1)),
        map(opcode(0xff), |()| AmlValue::ones()),
        byte_const(),
        word_const(),
        dword_const(),
        qword_const(),
        string_const(),
        buffer_obj(),
        package_obj()
    )
}

fn byte_const<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    map(
        crate::parser::and_then(opcode(0x0a), take()),
        |((), byte)| AmlValue::Integer(byte as u64),
    )
}

fn word_const<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    map(crate::parser::and_then(opcode(0x0b), take_n(2)), |((), bytes)| {
        AmlValue::Integer(u16::from_le_bytes([bytes[0], bytes[1]]) as u64)
    })
}

fn dword_const<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    map(crate::parser::and_then(opcode(0x0c), take_n(4)), |((), bytes)| {
        AmlValue::Integer(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64)
    })
}

fn qword_const<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    map(crate::parser::and_then(opcode(0x0e), take_n(8)), |((), bytes)| {
        AmlValue::Integer(u64::from_le_bytes(bytes.try_into().unwrap()))
    })
}

fn string_const<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x0d).parse(input, context)?;
        match input.iter().position(|&b| b == 0) {
            Some(nul) => match core::str::from_utf8(&input[..nul]) {
                Ok(s) => Ok((&input[nul + 1..], context, AmlValue::String(String::from(s)))),
                Err(_) => Err((input, context, Propagate::Err(AmlError::InvalidStringConstant))),
            },
            None => Err((input, context, Propagate::Err(AmlError::UnterminatedStringConstant))),
        }
    }
}

fn buffer_obj<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x11).parse(input, context)?;
        let (input, context, length) = pkg_length().parse(input, context)?;
        let (input, context, size_value) = term_arg().parse(input, context)?;
        let size = match size_value.as_integer(context) {
            Ok(size) => size as usize,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };

        let initializer_len = length.bytes_left(input);
        if initializer_len > input.len() {
            return Err((input, context, Propagate::Err(AmlError::MalformedBuffer)));
        }
        let mut bytes = alloc::vec![0u8; size];
        let copy_len = usize::min(size, initializer_len);
        bytes[..copy_len].copy_from_slice(&input[..copy_len]);

        Ok((&input[initializer_len..], context, AmlValue::Buffer(Arc::new(SpinMutex::new(bytes)))))
    }
}

fn package_obj<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x12).parse(input, context)?;
        let (input, context, length) = pkg_length().parse(input, context)?;
        let (input, context, num_elements) = take().parse(input, context)?;

        let mut elements = Vec::with_capacity(num_elements as usize);
        let mut input = input;
        let mut context = context;
        while length.still_parsing(input) && elements.len() < num_elements as usize {
            let (new_input, new_context, element) = package_element().parse(input, context)?;
            elements.push(element);
            input = new_input;
            context = new_context;
        }
        while (elements.len() as u8) < num_elements {
            elements.push(AmlValue::Uninitialized);
        }

        Ok((input, context, AmlValue::Package(Arc::new(SpinMutex::new(elements)))))
    }
}

fn package_element<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    choice!(data_object(), name_or_method_call())
}

fn local_obj<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| match input.first() {
        Some(&byte) if (0x60..=0x67).contains(&byte) => {
            let local: LocalNum = byte - 0x60;
            match context.local(local) {
                Ok(value) => Ok((&input[1..], context, value.clone())),
                Err(err) => Err((input, context, Propagate::Err(err))),
            }
        }
        _ => Err((input, context, Propagate::Err(AmlError::WrongParser))),
    }
}

fn arg_obj<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| match input.first() {
        Some(&byte) if (0x68..=0x6e).contains(&byte) => {
            let arg: ArgNum = byte - 0x68;
            match context.current_arg(arg) {
                Ok(value) => Ok((&input[1..], context, value.clone())),
                Err(err) => Err((input, context, Propagate::Err(err))),
            }
        }
        _ => Err((input, context, Propagate::Err(AmlError::WrongParser))),
    }
}

/// Parses a `SuperName` target: a plain name, `Local`/`Arg`, or nothing (`0x00`, meaning the
/// result is discarded). This is the common "where do I store the result" tail shared by most
/// dyadic/monadic operators.
fn target<'a, 'c>() -> impl Parser<'a, 'c, Target> {
    choice!(
        map(opcode(0x00), |()| Target::Null),
        map_with_context(name_string(), |name, _| Ok(Target::Name(name))),
        |input: &'a [u8], context: &'c mut AmlContext| match input.first() {
            Some(&byte) if (0x60..=0x67).contains(&byte) => {
                Ok((&input[1..], context, Target::Local(byte - 0x60)))
            }
            Some(&byte) if (0x68..=0x6e).contains(&byte) => {
                Ok((&input[1..], context, Target::Arg(byte - 0x68)))
            }
            _ => Err((input, context, Propagate::Err(AmlError::WrongParser))),
        }
    )
}

fn store<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x70).parse(input, context)?;
        let (input, context, value) = term_arg().parse(input, context)?;
        let (input, context, dest) = target().parse(input, context)?;
        match context.store(dest, value) {
            Ok(result) => Ok((input, context, result)),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn dyadic_arith<'a, 'c>(op: u8, f: impl Fn(u64, u64) -> u64 + Copy) -> impl Parser<'a, 'c, AmlValue> {
    move |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(op).parse(input, context)?;
        let (input, context, a) = term_arg().parse(input, context)?;
        let (input, context, b) = term_arg().parse(input, context)?;
        let (input, context, dest) = target().parse(input, context)?;

        let a = match a.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let b = match b.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let result = AmlValue::Integer(f(a, b));
        match context.store(dest, result) {
            Ok(stored) => Ok((input, context, stored)),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn shift_left<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x79).parse(input, context)?;
        let (input, context, a) = term_arg().parse(input, context)?;
        let (input, context, shift) = term_arg().parse(input, context)?;
        let (input, context, dest) = target().parse(input, context)?;
        let a = match a.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let shift = match shift.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        if shift >= 64 {
            return Err((input, context, Propagate::Err(AmlError::InvalidShiftLeft)));
        }
        match context.store(dest, AmlValue::Integer(a << shift)) {
            Ok(stored) => Ok((input, context, stored)),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn shift_right<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x7a).parse(input, context)?;
        let (input, context, a) = term_arg().parse(input, context)?;
        let (input, context, shift) = term_arg().parse(input, context)?;
        let (input, context, dest) = target().parse(input, context)?;
        let a = match a.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let shift = match shift.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        if shift >= 64 {
            return Err((input, context, Propagate::Err(AmlError::InvalidShiftRight)));
        }
        match context.store(dest, AmlValue::Integer(a >> shift)) {
            Ok(stored) => Ok((input, context, stored)),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn increment_decrement<'a, 'c>(op: u8, delta: i64) -> impl Parser<'a, 'c, AmlValue> {
    move |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(op).parse(input, context)?;
        let (input, context, dest) = target().parse(input, context)?;
        let current = match context.read_target(&dest) {
            Ok(value) => value.clone(),
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let current = match current.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let updated = (current as i64).wrapping_add(delta) as u64;
        match context.store(dest, AmlValue::Integer(updated)) {
            Ok(stored) => Ok((input, context, stored)),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

fn logical_dyadic<'a, 'c>(op: u8, f: impl Fn(u64, u64) -> bool + Copy) -> impl Parser<'a, 'c, AmlValue> {
    move |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(op).parse(input, context)?;
        let (input, context, a) = term_arg().parse(input, context)?;
        let (input, context, b) = term_arg().parse(input, context)?;
        let a = match a.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let b = match b.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let result = if f(a, b) { AmlValue::ones() } else { AmlValue::zero() };
        Ok((input, context, result))
    }
}

fn logical_not<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x92).parse(input, context)?;
        let (input, context, a) = term_arg().parse(input, context)?;
        let a = match a.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        let result = if a == 0 { AmlValue::ones() } else { AmlValue::zero() };
        Ok((input, context, result))
    }
}

fn size_of<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x87).parse(input, context)?;
        let (input, context, value) = term_arg().parse(input, context)?;
        let size = match &value {
            AmlValue::Buffer(buf) => buf.lock().len() as u64,
            AmlValue::String(s) => s.len() as u64,
            AmlValue::Package(pkg) => pkg.lock().len() as u64,
            other => return Err((input, context, Propagate::Err(AmlError::InvalidSizeOfApplication(other.type_of())))),
        };
        Ok((input, context, AmlValue::Integer(size)))
    }
}

/// `Index(source, index, target)`. Simplified to return a copy of the indexed element (rather
/// than a live `ObjectReference` that could be used to write back through) - see SPEC_FULL.md's
/// open-question note on the region-handler refcount link for the same style of deliberate
/// simplification.
fn index_op<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x88).parse(input, context)?;
        let (input, context, source) = term_arg().parse(input, context)?;
        let (input, context, index) = term_arg().parse(input, context)?;
        let (input, context, dest) = target().parse(input, context)?;

        let index = match index.as_integer(context) {
            Ok(v) => v as usize,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };

        let element = match &source {
            AmlValue::Package(pkg) => pkg.lock().get(index).cloned().ok_or(AmlError::BufferFieldIndexesOutOfBounds),
            AmlValue::Buffer(buf) => buf
                .lock()
                .get(index)
                .map(|&b| AmlValue::Integer(b as u64))
                .ok_or(AmlError::BufferFieldIndexesOutOfBounds),
            other => Err(AmlError::TypeCannotBeSliced(other.type_of())),
        };
        let element = match element {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };

        match context.store(dest, element) {
            Ok(stored) => Ok((input, context, stored)),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

/// `Notify(object, value)`. Dispatches to `object`'s registered system/driver handlers, if any are
/// installed (spec.md §4.6: "`notify` dispatches to both if present"). Installing the handlers
/// themselves is the host's job (`AmlContext::install_system_notify_handler`/
/// `install_driver_notify_handler`) - that's who actually owns the OSPM/driver callback, not the
/// interpreter. `Notify` itself produces no AML-visible result.
fn notify_op<'a, 'c>() -> impl Parser<'a, 'c, AmlValue> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = opcode(0x86).parse(input, context)?;
        let (input, context, target_name) = name_string().parse(input, context)?;
        let (input, context, value) = term_arg().parse(input, context)?;
        let code = match value.as_integer(context) {
            Ok(v) => v,
            Err(err) => return Err((input, context, Propagate::Err(err))),
        };
        log::info!("Notify({}, {:#x})", target_name, code);
        context.dispatch_notify(&target_name, code);
        Ok((input, context, AmlValue::Uninitialized))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SyncOp {
    Acquire,
    Release,
    Wait,
    Signal,
    Reset,
}

fn sync_op<'a, 'c>(op: u8, kind: SyncOp) -> impl Parser<'a, 'c, AmlValue> {
    move |input: &'a [u8], context: &'c mut AmlContext| {
        let (input, context, ()) = crate::parser::extended_opcode(op).parse(input, context)?;
        let (input, context, object) = term_arg().parse(input, context)?;

        let (input, context, timeout_or_units) = match kind {
            SyncOp::Acquire | SyncOp::Wait => {
                let (input, context, bytes) = take_n(2).parse(input, context)?;
                (input, context, Some(u16::from_le_bytes([bytes[0], bytes[1]]) as u64))
            }
            SyncOp::Signal | SyncOp::Release | SyncOp::Reset => (input, context, None),
        };

        let result = match (kind, &object) {
            (SyncOp::Acquire, AmlValue::Mutex(mutex)) => {
                let timeout = timeout_or_units.map(Duration::from_millis);
                match crate::walk::mutex_acquire(
                    &mutex.held_by,
                    mutex.semaphore,
                    context.handler(),
                    crate::walk::ThreadId(0),
                    timeout,
                ) {
                    Ok(()) => Ok(AmlValue::zero()),
                    Err(AmlError::Timeout) => Ok(AmlValue::ones()),
                    Err(err) => Err(err),
                }
            }
            (SyncOp::Release, AmlValue::Mutex(mutex)) => {
                crate::walk::mutex_release(&mutex.held_by, mutex.semaphore, context.handler(), crate::walk::ThreadId(0))
                    .map(|()| AmlValue::Uninitialized)
            }
            (SyncOp::Wait, AmlValue::Event(event)) => match event.counter.wait(context.handler(), timeout_or_units) {
                Ok(()) => Ok(AmlValue::zero()),
                Err(AmlError::Timeout) => Ok(AmlValue::ones()),
                Err(err) => Err(err),
            },
            (SyncOp::Signal, AmlValue::Event(event)) => {
                event.counter.signal();
                Ok(AmlValue::Uninitialized)
            }
            (SyncOp::Reset, AmlValue::Event(event)) => {
                event.counter.reset();
                Ok(AmlValue::Uninitialized)
            }
            _ => Err(AmlError::IncompatibleValueConversion { current: object.type_of(), target: crate::value::AmlType::Mutex }),
        };

        match result {
            Ok(value) => Ok((input, context, value)),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::test_handler, value::Args, DebugVerbosity};
    use alloc::boxed::Box;
    use core::str::FromStr;

    #[test]
    fn s2_evaluate_numeric_method_returns_dword() {
        // spec.md S2: Method(_FOO, 0) { Return(0x12345678) } under \DEV.
        let mut context = AmlContext::new(Box::new(test_handler()), DebugVerbosity::None);
        context
            .namespace
            .add_level(AmlName::from_str("\\DEV").unwrap(), crate::namespace::LevelType::Device, crate::owner::OwnerId::PREDEFINED)
            .unwrap();

        // DefMethod(_FOO, 0 args) { Return(DWordConst(0x12345678)) }
        let method_body: &[u8] = &[0xa4, 0x0c, 0x78, 0x56, 0x34, 0x12];
        context
            .namespace
            .add_value(
                AmlName::from_str("\\DEV._FOO").unwrap(),
                crate::owner::OwnerId::PREDEFINED,
                AmlValue::Method {
                    flags: crate::value::MethodFlags::empty(),
                    code: MethodCode::Aml(Arc::from(method_body)),
                    concurrency: None,
                },
            )
            .unwrap();

        let result = context.invoke_method(&AmlName::from_str("\\DEV._FOO").unwrap(), Args::EMPTY).unwrap();
        assert_eq!(result, AmlValue::Integer(0x12345678));
    }
}
