//! `StatementOpcode`: the `Control` class (spec.md §4.4) - `If`/`Else`, `While`, `Return`,
//! `Break`, `Continue`, `Noop`. These are the only opcodes that can produce a [`Propagate`] other
//! than `Err`, which is how they unwind out of a `TermList` without the interpreter needing a
//! separate preemptible outer loop (see SPEC_FULL.md's design note on `CTRL_PENDING`).
//!
//! Grounded on `original_source/drivers/acpi/parser/psloop.c`'s handling of `AML_IF_OP`/
//! `AML_WHILE_OP`/`AML_RETURN_OP` - skip the untaken branch by package length rather than parsing
//! and discarding it, and let `Break`/`Continue` unwind through the normal error-propagation path.

use crate::{
    expression::term_arg,
    parser::{opcode, ParseResult, Parser, Propagate},
    pkg_length::pkg_length,
    term_object::term_list,
    AmlContext, AmlError,
};

pub fn statement_opcode<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        match opcode(0xa0).parse(input, context) {
            Ok((input, context, ())) => return if_else(input, context),
            Err((_, c, Propagate::Err(AmlError::WrongParser))) => context = c,
            Err(other) => return Err(other),
        }

        match opcode(0xa2).parse(input, context) {
            Ok((input, context, ())) => return while_loop(input, context),
            Err((_, c, Propagate::Err(AmlError::WrongParser))) => context = c,
            Err(other) => return Err(other),
        }

        match opcode(0xa3).parse(input, context) {
            Ok(result) => return Ok(result),
            Err((_, c, Propagate::Err(AmlError::WrongParser))) => context = c,
            Err(other) => return Err(other),
        }

        match opcode(0xa4).parse(input, context) {
            Ok((input, context, ())) => {
                let (input, context, value) = term_arg().parse(input, context)?;
                return Err((input, context, Propagate::Return(value)));
            }
            Err((_, c, Propagate::Err(AmlError::WrongParser))) => context = c,
            Err(other) => return Err(other),
        }

        match opcode(0xa5).parse(input, context) {
            Ok((input, context, ())) => return Err((input, context, Propagate::Break)),
            Err((_, c, Propagate::Err(AmlError::WrongParser))) => context = c,
            Err(other) => return Err(other),
        }

        // `DefContinue`: not in `opcode.rs`'s table since the grammar dispatches on raw bytes
        // directly, same as every other opcode here.
        match opcode(0x9f).parse(input, context) {
            Ok((input, context, ())) => Err((input, context, Propagate::Continue)),
            Err(other) => Err(other),
        }
    }
}

fn if_else<'a, 'c>(input: &'a [u8], context: &'c mut AmlContext) -> ParseResult<'a, 'c, ()> {
    let (input, context, length) = pkg_length().parse(input, context)?;
    let (input, context, predicate) = term_arg().parse(input, context)?;

    let taken = match predicate.as_integer(context) {
        Ok(value) => value != 0,
        Err(err) => return Err((input, context, Propagate::Err(err))),
    };

    if taken {
        // Run the `If` body, then skip any following `Else` clause without executing it.
        let (input, context, ()) = term_list(length).parse(input, context)?;
        match opcode(0xa1).parse(input, context) {
            Ok((input, context, ())) => {
                let (input, context, else_length) = pkg_length().parse(input, context)?;
                let remaining = else_length.bytes_left(input);
                if remaining > input.len() {
                    return Err((input, context, Propagate::Err(AmlError::InvalidPkgLength)));
                }
                Ok((&input[remaining..], context, ()))
            }
            Err((input, context, Propagate::Err(AmlError::WrongParser))) => Ok((input, context, ())),
            Err(other) => Err(other),
        }
    } else {
        // Skip straight past the `If` body, then run any following `Else` clause.
        let remaining = length.bytes_left(input);
        if remaining > input.len() {
            return Err((input, context, Propagate::Err(AmlError::InvalidPkgLength)));
        }
        let input = &input[remaining..];

        match opcode(0xa1).parse(input, context) {
            Ok((input, context, ())) => {
                let (input, context, else_length) = pkg_length().parse(input, context)?;
                term_list(else_length).parse(input, context)
            }
            Err((input, context, Propagate::Err(AmlError::WrongParser))) => Ok((input, context, ())),
            Err(other) => Err(other),
        }
    }
}

fn while_loop<'a, 'c>(input: &'a [u8], context: &'c mut AmlContext) -> ParseResult<'a, 'c, ()> {
    let (body_start, context, length) = pkg_length().parse(input, context)?;
    let mut context = context;

    loop {
        let (after_predicate, new_context, predicate) = term_arg().parse(body_start, context)?;
        context = new_context;

        let condition = match predicate.as_integer(context) {
            Ok(value) => value != 0,
            Err(err) => return Err((after_predicate, context, Propagate::Err(err))),
        };
        if !condition {
            break;
        }

        match term_list(length).parse(after_predicate, context) {
            Ok((_, new_context, ())) => context = new_context,
            Err((_, new_context, Propagate::Break)) => {
                context = new_context;
                break;
            }
            Err((_, new_context, Propagate::Continue)) => context = new_context,
            Err(other) => return Err(other),
        }
    }

    let body_end = length.bytes_left(body_start);
    if body_end > body_start.len() {
        return Err((body_start, context, Propagate::Err(AmlError::InvalidPkgLength)));
    }
    Ok((&body_start[body_end..], context, ()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        namespace::{AmlName, LevelType},
        owner::OwnerId,
        test_utils::test_handler,
        value::{Args, MethodCode},
        AmlValue, DebugVerbosity,
    };
    use alloc::{boxed::Box, sync::Arc};
    use core::str::FromStr;

    fn context_with_device() -> AmlContext {
        let mut context = AmlContext::new(Box::new(test_handler()), DebugVerbosity::None);
        context.namespace.add_level(AmlName::from_str("\\DEV").unwrap(), LevelType::Device, OwnerId::PREDEFINED).unwrap();
        context
    }

    fn method(body: &[u8]) -> AmlValue {
        AmlValue::Method {
            flags: crate::value::MethodFlags::empty(),
            code: MethodCode::Aml(Arc::from(body)),
            concurrency: None,
        }
    }

    #[test]
    fn if_true_branch_runs_and_else_is_skipped() {
        let mut context = context_with_device();
        // If(One) { Return(0xAA) } Else { Return(0xBB) }
        let body: &[u8] = &[
            0xa0, 0x06, 0x01, 0xa4, 0x0a, 0xaa, // If(One) { Return(0xAA) }
            0xa1, 0x04, 0xa4, 0x0a, 0xbb, // Else { Return(0xBB) }
        ];
        context.namespace.add_value(AmlName::from_str("\\DEV._TST").unwrap(), OwnerId::PREDEFINED, method(body)).unwrap();
        let result = context.invoke_method(&AmlName::from_str("\\DEV._TST").unwrap(), Args::EMPTY).unwrap();
        assert_eq!(result, AmlValue::Integer(0xaa));
    }

    #[test]
    fn if_false_branch_runs_else() {
        let mut context = context_with_device();
        let body: &[u8] = &[
            0xa0, 0x06, 0x00, 0xa4, 0x0a, 0xaa, // If(Zero) { Return(0xAA) }
            0xa1, 0x04, 0xa4, 0x0a, 0xbb, // Else { Return(0xBB) }
        ];
        context.namespace.add_value(AmlName::from_str("\\DEV._TST").unwrap(), OwnerId::PREDEFINED, method(body)).unwrap();
        let result = context.invoke_method(&AmlName::from_str("\\DEV._TST").unwrap(), Args::EMPTY).unwrap();
        assert_eq!(result, AmlValue::Integer(0xbb));
    }

    #[test]
    fn while_loop_increments_local_until_break() {
        let mut context = context_with_device();
        // Local0 = 0
        // While (LLess(Local0, Three)) { Increment(Local0) }
        // Return (Local0)
        let body: &[u8] = &[
            0x70, 0x00, 0x60, // Store(Zero, Local0)
            0xa2, 0x08, 0x95, 0x60, 0x0a, 0x03, // While (LLess(Local0, 3))
            0x75, 0x60, // Increment(Local0)
            0xa4, 0x60, // Return(Local0)
        ];
        context.namespace.add_value(AmlName::from_str("\\DEV._TST").unwrap(), OwnerId::PREDEFINED, method(body)).unwrap();
        let result = context.invoke_method(&AmlName::from_str("\\DEV._TST").unwrap(), Args::EMPTY).unwrap();
        assert_eq!(result, AmlValue::Integer(3));
    }
}
