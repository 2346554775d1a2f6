//! Bytecode compiler for a small dynamic, object-oriented language.
//!
//! [`lang`] holds the source tree handed in by a parser, [`bytecode`] turns
//! it into finalized instruction sequences.

pub mod bytecode;
pub mod lang;
