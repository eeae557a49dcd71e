//! `TermList`/`TermObj`: the top-level grammar production that both `AmlContext::parse_table` and
//! `AmlContext::invoke_method` drive. A `TermObj` is either a named object definition, a
//! statement opcode (control flow), or an expression opcode evaluated for its side effects (its
//! result, if any, is discarded - unlike `expression_opcode`, which is called from contexts that
//! want the value).
//!
//! Grounded on the teacher's module list (`pub(crate) mod term_object`) and
//! `original_source/drivers/acpi/parser/psparse.c`'s per-opcode dispatch loop. Parsing and
//! evaluation happen in the same pass, exactly as in the teacher: by the time `term_obj` returns,
//! any named object it introduced is already bound in the namespace and any expression is already
//! evaluated.

use crate::{
    expression::expression_opcode,
    parser::{Parser, Propagate},
    pkg_length::PkgLength,
    statement::statement_opcode,
    term_object::named_obj::named_obj,
    AmlContext, AmlError,
};

pub mod named_obj;

pub fn term_list<'a, 'c>(length: PkgLength) -> impl Parser<'a, 'c, ()> {
    move |input: &'a [u8], context: &'c mut AmlContext| {
        let mut input = input;
        let mut context = context;
        while length.still_parsing(input) {
            let (new_input, new_context, ()) = term_obj().parse(input, context)?;
            input = new_input;
            context = new_context;
        }
        Ok((input, context, ()))
    }
}

fn term_obj<'a, 'c>() -> impl Parser<'a, 'c, ()> {
    |input: &'a [u8], context: &'c mut AmlContext| {
        if input.is_empty() {
            return Err((input, context, Propagate::Err(AmlError::UnexpectedEndOfStream)));
        }

        match named_obj().parse(input, context) {
            Ok(result) => return Ok(result),
            Err((_, c, Propagate::Err(AmlError::WrongParser))) => context = c,
            Err(other) => return Err(other),
        }

        match statement_opcode().parse(input, context) {
            Ok(result) => return Ok(result),
            Err((_, c, Propagate::Err(AmlError::WrongParser))) => context = c,
            Err(other) => return Err(other),
        }

        // An expression opcode used as a statement: evaluate it and discard the result
        // (spec.md's `MONADIC1`/`DYADIC1` "0 external results" ops - e.g. `Notify`, `Store`).
        match expression_opcode().parse(input, context) {
            Ok((input, context, _value)) => Ok((input, context, ())),
            Err((input, context, Propagate::Err(AmlError::WrongParser))) => {
                // Unknown opcode: per spec.md §4.1/§7, skip one byte and continue rather than
                // aborting the whole table/method.
                log::warn!("Skipping unrecognised AML opcode byte {:#x}", input[0]);
                Ok((&input[1..], context, ()))
            }
            Err(other) => Err(other),
        }
    }
}
