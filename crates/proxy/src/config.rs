//! Proxy configuration.
//!
//! Plain structured input, loaded from a JSON file; every field has a default
//! so a minimal config only names the account and the remote host.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::net::session::{Identity, offline_uuid};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub account: AccountConfig,
    /// Usernames allowed to connect. Empty list = open server.
    pub whitelist: Vec<String>,
    /// When true, link authorization compares UUIDs; otherwise usernames.
    pub online_mode: bool,
    /// Reconnect automatically after a remote kick/error.
    pub auto_restart: bool,
    /// Flat delay before an automatic reconnect, in seconds.
    pub restart_delay_secs: u64,
    /// Chat prefix that marks a proxy command.
    pub command_prefix: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LocalConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AccountConfig {
    pub username: String,
    /// Fixed account UUID; derived offline-style from the username when absent.
    pub uuid: Option<Uuid>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            local: LocalConfig::default(),
            account: AccountConfig::default(),
            whitelist: Vec::new(),
            online_mode: false,
            auto_restart: true,
            restart_delay_secs: 30,
            command_prefix: "/".into(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 25565,
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 25566,
        }
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            username: "ghostlink".into(),
            uuid: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// The identity the upstream session authenticates as.
    pub fn account_identity(&self) -> Identity {
        let uuid = self
            .account
            .uuid
            .unwrap_or_else(|| offline_uuid(&self.account.username));
        Identity::new(self.account.username.clone(), uuid)
    }

    /// Whitelist predicate: empty list admits everyone.
    pub fn whitelisted(&self, username: &str) -> bool {
        self.whitelist.is_empty()
            || self
                .whitelist
                .iter()
                .any(|entry| entry.eq_ignore_ascii_case(username))
    }
}
