//! oxcc code generation library.
//!
//! This crate owns the target-independent half of the compiler back end: a
//! basic-block intermediate representation with virtual registers, a linear
//! scan register allocator, and binary emission of x86-64 machine code with
//! label relocation and flat-image assembly.
//!
//! The expected flow is: a front end builds one [`ir::Function`] per C
//! function through [`ir::FunctionBuilder`], hands it to a [`Context`] which
//! runs register allocation and byte emission, and finally calls
//! [`Context::finish`] to lay out read-only data, initialized data and BSS,
//! patch every recorded label reference, and obtain the final image.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use crate::context::Context;
pub use crate::result::{CodegenError, CodegenResult};

pub use cranelift_entity as entity;

pub mod binemit;
pub mod ir;
pub mod isa;
pub mod regalloc;

mod context;
mod result;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
