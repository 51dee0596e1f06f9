// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types for the Sprint Lens data model.

use thiserror::Error;

/// Errors raised while building or encoding trace records.
#[derive(Debug, Error)]
pub enum Error {
    /// A required field was missing or a value was out of range.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create an [`Error::InvalidInput`] from any message.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}

/// Result type for data model operations.
pub type Result<T> = std::result::Result<T, Error>;
