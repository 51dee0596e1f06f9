// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Optional process-wide client.
//!
//! A convenience for scripts and small binaries. Applications should build a
//! [`Client`] in their composition root and pass it where it is needed.

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::track::Track;
use once_cell::sync::Lazy;
use std::sync::{PoisonError, RwLock};
use tracing::info;

static GLOBAL: Lazy<RwLock<Option<Client>>> = Lazy::new(|| RwLock::new(None));

/// Build a client from `config` and install it globally.
pub fn configure(config: ClientConfig) -> Result<Client> {
    let client = Client::new(config)?;
    set_client(client.clone());
    Ok(client)
}

/// Install `client` globally, returning the one it replaces.
pub fn set_client(client: Client) -> Option<Client> {
    info!(project = %client.config().project_name, "Installed global Sprint Lens client");
    GLOBAL
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(client)
}

/// The global client, or [`Error::NotConfigured`].
pub fn client() -> Result<Client> {
    try_client().ok_or(Error::NotConfigured)
}

pub fn try_client() -> Option<Client> {
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Uninstall the global client.
pub fn reset() -> Option<Client> {
    GLOBAL.write().unwrap_or_else(PoisonError::into_inner).take()
}

/// Track one call with the global client.
///
/// Fails only when no client is configured.
pub fn track(name: impl Into<String>) -> Result<Track> {
    Ok(client()?.track(name))
}
