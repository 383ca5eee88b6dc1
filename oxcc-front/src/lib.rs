//! oxcc C front end.
//!
//! Turns one preprocessed C translation unit into IR compiled through an
//! [`oxcc_codegen::Context`]: lexing, recursive-descent parsing with type
//! checking and constant folding, lexical scopes with struct/enum tag
//! namespaces, initializer flattening, and AST → IR lowering.
//!
//! The public entry point is [`compile`]. Errors never panic across this
//! boundary: everything the unit has to say lands in the returned
//! [`diag::Diagnostics`], and a unit with errors simply must not be
//! `finish`ed into an image.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod ast;
pub mod diag;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod scope;
pub mod types;

use oxcc_codegen::Context;

/// Front-end configuration.
pub struct FrontOptions {
    /// Source file name used in diagnostics.
    pub filename: String,
    /// Disable floating-point: literals, `float`/`double` types and XMM
    /// code paths; uses of them become diagnostics.
    pub no_flonum: bool,
}

impl Default for FrontOptions {
    fn default() -> Self {
        Self { filename: "<input>".to_string(), no_flonum: false }
    }
}

/// Compile one preprocessed translation unit into `ctx`.
///
/// Returns the accumulated diagnostics; the caller must not write output
/// when [`diag::Diagnostics::is_ok`] is false.
pub fn compile(source: &str, options: &FrontOptions, ctx: &mut Context) -> diag::Diagnostics {
    let mut types = types::Types::new();
    let mut scopes = scope::Scopes::new();
    let mut diags = diag::Diagnostics::new(&options.filename);

    let (decls, statics) =
        parser::parse_unit(source, &mut types, &mut scopes, &mut diags, options.no_flonum);
    log::debug!(
        "{}: {} top-level declarations, {} diagnostics after parse",
        options.filename,
        decls.len(),
        diags.error_count()
    );

    lower::lower_unit(&mut types, &mut scopes, &mut diags, ctx, &decls, &statics);
    diags
}
