//! Lance - an expression-oriented, dynamically-tagged functional language
//! with first-class closures, compiled to 32-bit x86.
//!
//! This crate is the compiler back end. The front end (lexer, parser, scope
//! checker, A-normalizer) hands us a tag-annotated ANF tree; we hand the
//! assembler an abstract instruction stream. Everything in between - value
//! tagging, the frame calling convention, heap layout for tuples and
//! closures, dynamic type checks, closure conversion - lives here.

pub mod ast;
pub mod codegen;

pub use ast::{Expr, Prim1, Prim2, Span, Tag};
pub use codegen::{compile, wrap, CompileError};
