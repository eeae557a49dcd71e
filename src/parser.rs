//! A small set of parser combinators used to build the AML grammar out of composable pieces,
//! following Bodil Stordalen Hansen's
//! ["Learning Parser Combinators With Rust"](https://bodil.lol/parser-combinators/).
//!
//! Every parser threads an `&'c mut AmlContext` alongside the input slice, because some parses
//! (e.g. a `NameString` being resolved to a namespace entry during pass 1) need to mutate the
//! namespace as a side effect of parsing. `Propagate` is the "error" type for parsers - it
//! doubles as the channel used to carry `Return`/`Break`/`Continue` out of a method body, because
//! those are, from the parser's point of view, early exits exactly like a parse error.

use crate::{AmlContext, AmlError, AmlValue};
use alloc::boxed::Box;

pub type ParseResult<'a, 'c, R> =
    Result<(&'a [u8], &'c mut AmlContext, R), (&'a [u8], &'c mut AmlContext, Propagate)>;

/// Either a genuine parse/interpretation error, or interpreter control-flow escaping out of the
/// term list currently being parsed. `term_object::term_list` catches `Return`/`Break`/`Continue`
/// at the appropriate scope boundaries; anything that escapes the whole table is turned back into
/// an `AmlError` by `AmlContext::parse_table` / `invoke_method`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Propagate {
    Err(AmlError),
    Return(AmlValue),
    Break,
    Continue,
}

impl From<AmlError> for Propagate {
    fn from(err: AmlError) -> Propagate {
        Propagate::Err(err)
    }
}

pub trait Parser<'a, 'c, R> {
    fn parse(&self, input: &'a [u8], context: &'c mut AmlContext) -> ParseResult<'a, 'c, R>;
}

impl<'a, 'c, R, F> Parser<'a, 'c, R> for F
where
    F: Fn(&'a [u8], &'c mut AmlContext) -> ParseResult<'a, 'c, R>,
{
    fn parse(&self, input: &'a [u8], context: &'c mut AmlContext) -> ParseResult<'a, 'c, R> {
        self(input, context)
    }
}

/// Type-erased parser, used at recursive grammar positions (e.g. `term_list` refers to itself
/// through `term_obj`) where `impl Parser<...>` would require infinite type expansion.
pub struct BoxedParser<'a, 'c, R> {
    inner: Box<dyn for<'b> Fn(&'a [u8], &'c mut AmlContext) -> ParseResult<'a, 'c, R> + 'c>,
}

impl<'a, 'c, R> Parser<'a, 'c, R> for BoxedParser<'a, 'c, R> {
    fn parse(&self, input: &'a [u8], context: &'c mut AmlContext) -> ParseResult<'a, 'c, R> {
        (self.inner)(input, context)
    }
}

/// Consumes a single byte.
pub fn take<'a, 'c>() -> impl Parser<'a, 'c, u8> {
    |input: &'a [u8], context: &'c mut AmlContext| match input.first() {
        Some(&byte) => Ok((&input[1..], context, byte)),
        None => Err((input, context, Propagate::Err(AmlError::UnexpectedEndOfStream))),
    }
}

/// Consumes `n` bytes as a slice.
pub fn take_n<'a, 'c>(n: u32) -> impl Parser<'a, 'c, &'a [u8]> {
    move |input: &'a [u8], context: &'c mut AmlContext| {
        if (input.len() as u32) < n {
            return Err((input, context, Propagate::Err(AmlError::UnexpectedEndOfStream)));
        }
        let (taken, rest) = input.split_at(n as usize);
        Ok((rest, context, taken))
    }
}

/// Succeeds only if the next byte equals `opcode`, without consuming it from the *public* view -
/// i.e. this is used where a caller has already peeked the byte and wants to consume-and-check in
/// one step.
pub fn opcode<'a, 'c>(opcode: u8) -> impl Parser<'a, 'c, ()> {
    move |input: &'a [u8], context: &'c mut AmlContext| match input.first() {
        Some(&byte) if byte == opcode => Ok((&input[1..], context, ())),
        _ => Err((input, context, Propagate::Err(AmlError::WrongParser))),
    }
}

pub fn extended_opcode<'a, 'c>(opcode: u8) -> impl Parser<'a, 'c, ()> {
    move |input: &'a [u8], context: &'c mut AmlContext| match input {
        [0x5b, byte, ..] if *byte == opcode => Ok((&input[2..], context, ())),
        _ => Err((input, context, Propagate::Err(AmlError::WrongParser))),
    }
}

pub fn map<'a, 'c, P, F, A, B>(parser: P, f: F) -> impl Parser<'a, 'c, B>
where
    P: Parser<'a, 'c, A>,
    F: Fn(A) -> B,
{
    move |input, context| {
        parser.parse(input, context).map(|(input, context, result)| (input, context, f(result)))
    }
}

pub fn map_with_context<'a, 'c, P, F, A, B>(parser: P, f: F) -> impl Parser<'a, 'c, B>
where
    P: Parser<'a, 'c, A>,
    F: Fn(A, &mut AmlContext) -> Result<B, AmlError>,
{
    move |input, context: &'c mut AmlContext| {
        let (input, context, result) = parser.parse(input, context)?;
        match f(result, context) {
            Ok(mapped) => Ok((input, context, mapped)),
            Err(err) => Err((input, context, Propagate::Err(err))),
        }
    }
}

/// Runs `first`; if it fails with `Propagate::Err(WrongParser)` (meaning it's clear from the
/// opcode alone that this isn't the right production), tries `second` against the *original*
/// input instead. Any other `Propagate` variant aborts immediately.
pub fn or<'a, 'c, R>(
    first: impl Parser<'a, 'c, R>,
    second: impl Parser<'a, 'c, R>,
) -> impl Parser<'a, 'c, R> {
    move |input: &'a [u8], context: &'c mut AmlContext| match first.parse(input, context) {
        Ok(result) => Ok(result),
        Err((_, context, Propagate::Err(AmlError::WrongParser))) => second.parse(input, context),
        Err(other) => Err(other),
    }
}

/// Tries each parser in turn, left to right, falling through on `WrongParser` exactly like [`or`].
#[macro_export]
macro_rules! choice {
    ($first:expr) => { $first };
    ($first:expr, $($rest:expr),+ $(,)?) => {
        $crate::parser::or($first, $crate::choice!($($rest),+))
    };
}

pub fn and_then<'a, 'c, P, Q, A, B>(parser: P, next: Q) -> impl Parser<'a, 'c, (A, B)>
where
    P: Parser<'a, 'c, A>,
    Q: Parser<'a, 'c, B>,
{
    move |input, context| {
        let (input, context, a) = parser.parse(input, context)?;
        let (input, context, b) = next.parse(input, context)?;
        Ok((input, context, (a, b)))
    }
}

/// Like [`and_then`] but the second parser is built from the first result, so it can depend on it
/// (e.g. reading `n` followed by `n` further bytes).
pub fn then_with<'a, 'c, P, F, Q, A, B>(parser: P, f: F) -> impl Parser<'a, 'c, B>
where
    P: Parser<'a, 'c, A>,
    F: Fn(A) -> Q,
    Q: Parser<'a, 'c, B>,
{
    move |input, context| {
        let (input, context, a) = parser.parse(input, context)?;
        f(a).parse(input, context)
    }
}

/// Tries `parser`; on `WrongParser` returns `None` without consuming input, otherwise succeeds
/// with `Some(result)`.
pub fn opt<'a, 'c, P, R>(parser: P) -> impl Parser<'a, 'c, Option<R>>
where
    P: Parser<'a, 'c, R>,
{
    move |input: &'a [u8], context: &'c mut AmlContext| match parser.parse(input, context) {
        Ok((input, context, result)) => Ok((input, context, Some(result))),
        Err((input, context, Propagate::Err(AmlError::WrongParser))) => Ok((input, context, None)),
        Err(other) => Err(other),
    }
}

/// Lifts a plain `Result<T, AmlError>` (as returned by most `AmlValue`/`AmlContext` methods) back
/// into a `ParseResult`, at the point a combinator needs to call one of those and propagate its
/// error with `?`.
pub fn lift<'a, 'c, T>(
    input: &'a [u8],
    context: &'c mut AmlContext,
    result: Result<T, AmlError>,
) -> ParseResult<'a, 'c, T> {
    match result {
        Ok(value) => Ok((input, context, value)),
        Err(err) => Err((input, context, Propagate::Err(err))),
    }
}

/// Boxes a parser, erasing its concrete combinator type. Used at the points in the grammar that
/// recurse (`TermList` contains `TermObj`s which can themselves contain `TermList`s).
pub fn boxed<'a, 'c, P, R>(parser: P) -> BoxedParser<'a, 'c, R>
where
    P: Parser<'a, 'c, R> + 'c,
    R: 'c,
{
    BoxedParser { inner: Box::new(move |input, context| parser.parse(input, context)) }
}
