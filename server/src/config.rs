// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a directory
//! authority server configuration

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dirauth_common::pki::IdentityPublicKey;
use dropshot::ConfigLogging;
use serde::{Deserialize, Serialize};
use slog_error_chain::SlogInlineError;
use std::collections::BTreeSet;
use std::net::SocketAddrV6;
use thiserror::Error;

/// Configuration for a directory authority server
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Process-level settings: data directory, listen addresses, topology
    /// shape.
    pub server: ServerConfig,
    /// Mixing parameters copied verbatim into every published document.
    pub parameters: Parameters,
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    /// Partial configuration for our dropshot servers.
    pub dropshot: PartialDropshotConfig,
    /// Identity keys of the mixes allowed to upload descriptors.
    #[serde(default)]
    pub mixes: Vec<MixConfig>,
    /// Identity keys and registered names of the authorized providers.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// The other authorities we exchange document signatures with.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Directory holding the identity key and persisted epoch state.
    pub data_dir: Utf8PathBuf,
    /// Addresses to listen on for descriptor uploads and document fetches.
    pub addresses: Vec<SocketAddrV6>,
    /// Number of mix layers to spread descriptors across when building a
    /// document.
    pub layers: usize,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Parameters {
    /// Poisson mix rate parameter.
    pub lambda: f64,
    /// Poisson rate parameter for client cover traffic.
    pub lambda_prime: f64,
    /// Maximum per-hop delay in milliseconds.
    pub max_delay: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MixConfig {
    pub identity_key: IdentityPublicKey,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// The name the provider must declare in its descriptors.
    pub name: String,
    pub identity_key: IdentityPublicKey,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub name: String,
    pub identity_key: IdentityPublicKey,
    /// Where to reach the peer for vote and signature exchange, e.g.
    /// `http://[fd00::5]:31555`.
    pub base_url: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PartialDropshotConfig {
    pub request_body_max_bytes: usize,
}

impl Config {
    /// Load a `Config` from the given TOML file
    ///
    /// This config object can then be used to create a new authority
    /// server.
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }

    /// Check the cross-field constraints a parsed config must satisfy,
    /// collecting every violation rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();

        if self.server.addresses.is_empty() {
            reasons.push("server.addresses is empty".to_string());
        }
        if self.server.layers == 0 {
            reasons.push("server.layers must be at least 1".to_string());
        }
        for (name, value) in [
            ("lambda", self.parameters.lambda),
            ("lambda_prime", self.parameters.lambda_prime),
        ] {
            if !value.is_finite() || value <= 0.0 {
                reasons.push(format!(
                    "parameters.{name} must be positive and finite \
                     (got {value})"
                ));
            }
        }
        if self.parameters.max_delay == 0 {
            reasons.push("parameters.max_delay must be nonzero".to_string());
        }

        let mut identities = BTreeSet::new();
        let mut duplicate = |key: &IdentityPublicKey| {
            if !identities.insert(*key) {
                Some(format!("identity key {key} is listed more than once"))
            } else {
                None
            }
        };
        for mix in &self.mixes {
            reasons.extend(duplicate(&mix.identity_key));
        }
        let mut provider_names = BTreeSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                reasons.push(format!(
                    "provider {} has an empty name",
                    provider.identity_key
                ));
            } else if !provider_names.insert(provider.name.as_str()) {
                reasons.push(format!(
                    "provider name {:?} is registered more than once",
                    provider.name
                ));
            }
            reasons.extend(duplicate(&provider.identity_key));
        }
        for peer in &self.peers {
            if peer.name.is_empty() {
                reasons.push(format!(
                    "peer {} has an empty name",
                    peer.identity_key
                ));
            }
            match peer.base_url.parse::<hyper::Uri>() {
                Ok(uri)
                    if uri.scheme().is_some()
                        && uri.authority().is_some() => {}
                _ => reasons.push(format!(
                    "peer {:?} base_url {:?} is not an absolute URL",
                    peer.name, peer.base_url
                )),
            }
            reasons.extend(duplicate(&peer.identity_key));
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::InvalidConfig { reasons })
        }
    }
}

#[derive(Debug, Error, SlogInlineError)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration file: {}", .reasons.join(", "))]
    InvalidConfig { reasons: Vec<String> },
}
