//! # Source tree
//!
//! This module defines the abstract syntax tree handed to the compiler.
//! The tree is produced by an external parser (the CLI reads it as JSON)
//! and is never mutated by compilation.
//!
//! ## Documentation conventions
//!
//! - Stack effects are written as `( before -- after )`.
//! - Source snippets use the surface syntax of the language, e.g.
//!   `a, b = 1, 2` or `x ||= 3`.

#[cfg(test)]
pub mod build;
pub mod node;
pub mod value;
