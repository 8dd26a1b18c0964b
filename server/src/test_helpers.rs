// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for unit tests: a discarding logger, a clock that
//! tests can move by hand, and builders for configs and signed
//! descriptors.

use dirauth_common::epochtime::{Epoch, EpochClock, EpochPosition, EPOCH_PERIOD};
use dirauth_common::pki::{
    IdentityKeypair, LinkPublicKey, MixDescriptor, MixKey,
};
use dirauth_common::wire;
use dropshot::{ConfigLogging, ConfigLoggingLevel};
use slog::{o, Logger};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{
    Config, MixConfig, Parameters, PartialDropshotConfig, PeerConfig,
    ProviderConfig, ServerConfig,
};

pub(crate) fn test_log() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// An `EpochClock` pinned to wherever the test last `set` it.
pub(crate) struct SettableClock {
    position: Mutex<EpochPosition>,
}

impl SettableClock {
    pub(crate) fn at(epoch: Epoch, elapsed: Duration) -> SettableClock {
        SettableClock { position: Mutex::new(Self::position(epoch, elapsed)) }
    }

    pub(crate) fn set(&self, epoch: Epoch, elapsed: Duration) {
        *self.position.lock().unwrap() = Self::position(epoch, elapsed);
    }

    fn position(epoch: Epoch, elapsed: Duration) -> EpochPosition {
        EpochPosition { epoch, elapsed, remaining: EPOCH_PERIOD - elapsed }
    }
}

impl EpochClock for SettableClock {
    fn now(&self) -> EpochPosition {
        *self.position.lock().unwrap()
    }
}

/// A descriptor for `epoch` (with mix keys for `epoch` and the next one),
/// signed into its upload envelope.
pub(crate) fn signed_descriptor(
    keypair: &IdentityKeypair,
    name: &str,
    epoch: Epoch,
    layer: u8,
) -> Vec<u8> {
    let mut mix_keys = BTreeMap::new();
    mix_keys.insert(epoch, MixKey::from_bytes([7; 32]));
    mix_keys.insert(epoch.next(), MixKey::from_bytes([8; 32]));
    let descriptor = MixDescriptor {
        name: name.to_string(),
        identity_key: keypair.public(),
        link_key: LinkPublicKey::from_bytes([9; 32]),
        mix_keys,
        addresses: vec![format!("tcp://{name}.example.net:31337")],
        layer,
    };
    wire::sign_descriptor(keypair, &descriptor).unwrap()
}

/// A config authorizing the given keys, with one provider registered as
/// "provider1" and peers named "auth1", "auth2", ...
pub(crate) fn test_config(
    mixes: &[IdentityKeypair],
    provider: &IdentityKeypair,
    peers: &[&IdentityKeypair],
) -> Config {
    Config {
        server: ServerConfig {
            data_dir: "/nonexistent".into(),
            addresses: vec!["[::1]:0".parse().unwrap()],
            layers: 3,
        },
        parameters: Parameters {
            lambda: 0.00025,
            lambda_prime: 0.00025,
            max_delay: 90_000,
        },
        log: ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Error },
        dropshot: PartialDropshotConfig { request_body_max_bytes: 1048576 },
        mixes: mixes
            .iter()
            .map(|keypair| MixConfig { identity_key: keypair.public() })
            .collect(),
        providers: vec![ProviderConfig {
            name: "provider1".to_string(),
            identity_key: provider.public(),
        }],
        peers: peers
            .iter()
            .enumerate()
            .map(|(i, keypair)| PeerConfig {
                name: format!("auth{}", i + 1),
                identity_key: keypair.public(),
                base_url: format!("http://[::1]:{}", 20000 + i),
            })
            .collect(),
    }
}
