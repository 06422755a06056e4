//! Error types for the key layer

use thiserror::Error;

/// Pattern-to-key derivation failures.
///
/// Fatal to the attempt that produced them, never to the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DerivationError {
    #[error("Pattern is empty")]
    EmptyPattern,

    #[error("Invalid grid size {grid} (allowed {min}..={max})")]
    InvalidGridSize { grid: u8, min: u8, max: u8 },

    #[error("Cell {cell} is outside a {grid}x{grid} grid")]
    CellOutOfRange { cell: u16, grid: u8 },

    #[error("Not a cell index: {0:?}")]
    UnparsableCell(String),

    #[error("Key derivation failed: {0}")]
    Kdf(String),
}

/// Failures using a key handle.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    #[error("Vault key was revoked - vault is locked")]
    Revoked,
}
