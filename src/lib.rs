//! CRC forging
//!
//! CRCs detect accidental corruption; they do nothing against a deliberate
//! editor. Because a CRC is linear over GF(2), the effect of flipping any
//! set of message bits is the XOR of their individual effects, and picking a
//! subset of allowed bits that moves the checksum to a chosen value is just
//! solving a small linear system.
//!
//! This crate does exactly that, for any CRC parameterized as
//! (width, poly, init, xor_out, reflect_in, reflect_out):
//!
//! - [`bigint::Bigint`] is the W-bit register and matrix-row type,
//! - [`crc::Crc`] evaluates and incrementally extends checksums,
//! - [`sparse::SparseCrc`] answers "checksum with bit p flipped" queries in
//!   O(w^2) independent of the message length,
//! - [`forge::forge`] solves for the bits to flip,
//! - [`expr`] parses the slice expressions the CLI selects bits with.
//!
//! Bit positions are canonical throughout: bit b of a message is bit b mod 8
//! (counting from the least significant) of byte b/8.

/// Fixed-width big integers
pub mod bigint;
pub use bigint::Bigint;

/// Parameterized CRC engine
pub mod crc;
pub use crc::Crc;

/// Bit-row pools and square GF(2) matrices
pub mod matrix;
pub use matrix::RowPool;

/// Sparse CRC differential engine
pub mod sparse;
pub use sparse::SparseCrc;

/// GF(2) linear solver for bit flips
pub mod forge;
pub use forge::{forge, ForgeError};

/// Bit-slice expressions
pub mod expr;
pub use expr::Slice;
