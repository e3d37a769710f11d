// SPDX-FileCopyrightText: Copyright (c) 2026 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use thiserror::Error;

/// Result type of the gateway.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type of the gateway.
///
/// Configuration variants are raised once at startup, before any
/// listener is bound. Transport errors surface while serving.
#[derive(Debug, Error)]
pub enum Error {
    /// Encryption is enabled but the key or IV is missing.
    #[error("missing encryption {0}")]
    MissingKeyMaterial(&'static str),

    /// The key or IV length does not match the selected cipher.
    #[error("invalid encryption {name}: expected {expected} bytes, got {actual}")]
    InvalidKeyMaterial {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The DTU registration code pattern is not a valid regex.
    #[error("invalid DTU code pattern: {0}")]
    InvalidCodePattern(#[from] regex::Error),

    /// A listen address could not be resolved.
    #[error("invalid listen address: {addr}")]
    InvalidListenAddr { addr: String },

    /// Transport-level I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
