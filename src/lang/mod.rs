//! # Cinder syntax tree and runtime values
//!
//! `node` is produced by the parser and consumed by the bytecode compiler.
//! `value` is shared by the constant pool, the VM stack and the globals.

pub mod node;
pub mod value;
