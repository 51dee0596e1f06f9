// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Caller-visible errors.
//!
//! Only setup mistakes surface here. Failures inside traced code are recorded
//! on spans, and delivery failures stay inside the exporter.

use thiserror::Error;

/// Errors returned by client construction and the global registry.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// Configuration was loaded but is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A global helper was used before `global::configure`.
    #[error("No Sprint Lens client configured; call sprintlens::global::configure first")]
    NotConfigured,

    /// Data model error.
    #[error(transparent)]
    Core(#[from] sprintlens_core::Error),

    /// The exporter thread or its runtime could not be started.
    #[error("Failed to start exporter: {0}")]
    Runtime(#[from] std::io::Error),

    /// The HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }
}

/// Result type for SDK setup operations.
pub type Result<T> = std::result::Result<T, Error>;
