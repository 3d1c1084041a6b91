//! Low-level wire protocol.
//!
//! Types and routines for the framed message exchange between clients and
//! the server: the packed on-wire structs and opcode space ([`abi`]) and the
//! stream codec that reads and writes whole frames ([`codec`]).

pub mod abi;
pub mod codec;
