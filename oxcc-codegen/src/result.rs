//! Result and error types representing the outcome of compiling a
//! translation unit.

use failure_derive::Fail;

/// A fatal error detected while emitting machine code.
///
/// Front-end errors (bad source text) never reach this type; they are
/// reported through the front end's diagnostics sink. A `CodegenError`
/// indicates that the unit cannot be completed: either the input asked for
/// something the back end does not support, or an internal limit was hit.
#[derive(Fail, Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// A label was referenced by a relocation record but never bound to an
    /// emission point before the final patch pass.
    #[fail(display = "unresolved label: {}", _0)]
    UnresolvedLabel(String),

    /// The requested target triple has no backing implementation.
    #[fail(display = "unsupported target: {}", _0)]
    Unsupported(String),

    /// A PC-relative reference does not fit in its encoded displacement.
    #[fail(display = "displacement out of range at offset {:#x}", _0)]
    OutOfRange(u32),

    /// An IR construct reached the encoder that it cannot express. This is a
    /// compiler bug, not a user error.
    #[fail(display = "unimplemented encoding: {}", _0)]
    Unimplemented(&'static str),
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error
/// type.
pub type CodegenResult<T> = Result<T, CodegenError>;
