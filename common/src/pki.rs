// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PKI data model: keys, mix descriptors, and directory documents.
//!
//! Identity keys are Ed25519 and do double duty as node identifiers: the
//! authority's authorization tables, the descriptor maps, and the
//! signature sets are all keyed by [`IdentityPublicKey`]. Link and
//! per-epoch mix keys are X25519 public keys, but the authority never
//! performs key agreement with them, so they are carried as validated
//! opaque bytes.

use camino::{Utf8Path, Utf8PathBuf};
use ed25519_dalek::{
    Signature, SignatureError, Signer, SigningKey, VerifyingKey,
    PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use crate::b64;
use crate::epochtime::Epoch;

/// The `layer` value that marks a descriptor as a provider rather than an
/// ordinary mix.
pub const LAYER_PROVIDER: u8 = 255;

macro_rules! opaque_key {
    ($name:ident, $len:expr) => {
        impl $name {
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&b64::encode(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                b64::serialize(&self.0, serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                b64::deserialize_array(deserializer).map(Self)
            }
        }
    };
}

/// A node's long-term Ed25519 identity, by public key.
///
/// Ordered so it can key `BTreeMap`s; displayed and serialized as base64.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityPublicKey([u8; PUBLIC_KEY_LENGTH]);

opaque_key!(IdentityPublicKey, PUBLIC_KEY_LENGTH);

impl IdentityPublicKey {
    /// Verifies `signature` over `msg` under this key.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), PkiError> {
        let signature = Signature::try_from(signature)
            .map_err(PkiError::MalformedSignature)?;
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(PkiError::InvalidPublicKey)?;
        key.verify_strict(msg, &signature).map_err(PkiError::BadSignature)
    }
}

/// An X25519 link-layer public key. Opaque to the authority.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkPublicKey([u8; 32]);

opaque_key!(LinkPublicKey, 32);

/// A per-epoch X25519 Sphinx key. Opaque to the authority.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MixKey([u8; 32]);

opaque_key!(MixKey, 32);

/// The authority's (or a node's) Ed25519 signing identity.
///
/// Key material is zeroized when the keypair is dropped.
pub struct IdentityKeypair(SigningKey);

impl IdentityKeypair {
    /// Generates a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self(SigningKey::generate(&mut OsRng))
    }

    /// Loads the keypair stored at `path`, or generates one and persists
    /// it there (mode 0600) if the file does not exist.
    pub fn load_or_generate(path: &Utf8Path) -> Result<Self, PkiError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_base64(path, contents.trim()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Self::generate();
                keypair.persist(path)?;
                Ok(keypair)
            }
            Err(err) => Err(PkiError::KeyIo { path: path.into(), err }),
        }
    }

    fn from_base64(path: &Utf8Path, encoded: &str) -> Result<Self, PkiError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|err| PkiError::KeyMalformed {
                path: path.into(),
                reason: err.to_string(),
            })?;
        let seed: [u8; SECRET_KEY_LENGTH] =
            bytes.try_into().map_err(|bytes: Vec<u8>| {
                PkiError::KeyMalformed {
                    path: path.into(),
                    reason: format!(
                        "expected {} bytes, got {}",
                        SECRET_KEY_LENGTH,
                        bytes.len()
                    ),
                }
            })?;
        Ok(Self(SigningKey::from_bytes(&seed)))
    }

    /// Writes the keypair seed to `path` (mode 0600).
    ///
    /// Fails if the file already exists; an existing key is never
    /// overwritten.
    pub fn persist(&self, path: &Utf8Path) -> Result<(), PkiError> {
        let io = |err| PkiError::KeyIo { path: path.into(), err };
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(io)?;
        file.write_all(b64::encode(&self.0.to_bytes()).as_bytes())
            .map_err(io)?;
        file.write_all(b"\n").map_err(io)
    }

    pub fn public(&self) -> IdentityPublicKey {
        IdentityPublicKey(self.0.verifying_key().to_bytes())
    }

    /// Signs `msg`, returning the detached signature bytes.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.0.sign(msg).to_bytes()
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKeypair({})", self.public())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("invalid public key")]
    InvalidPublicKey(#[source] SignatureError),
    #[error("malformed signature")]
    MalformedSignature(#[source] SignatureError),
    #[error("signature verification failed")]
    BadSignature(#[source] SignatureError),
    #[error("error reading identity key {path}")]
    KeyIo {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("malformed identity key {path}: {reason}")]
    KeyMalformed { path: Utf8PathBuf, reason: String },
}

/// A mix node's self-description, as uploaded to the authority once per
/// epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MixDescriptor {
    /// Node identifier. Authoritative for providers, informational for
    /// mixes.
    pub name: String,
    /// Long-term signing identity; must match the key the descriptor
    /// envelope is signed with.
    pub identity_key: IdentityPublicKey,
    /// Link-layer key used by peers to dial this node.
    pub link_key: LinkPublicKey,
    /// Per-epoch Sphinx keys. A descriptor for epoch `e` must carry a key
    /// for `e`.
    pub mix_keys: BTreeMap<Epoch, MixKey>,
    /// Dialable addresses.
    pub addresses: Vec<String>,
    /// 0 for an ordinary mix, [`LAYER_PROVIDER`] for a provider. Within a
    /// published document, topology entries instead carry their layer
    /// index.
    pub layer: u8,
}

impl MixDescriptor {
    /// Checks the fields a descriptor must get right before the authority
    /// will consider it for `epoch` at all.
    pub fn validate(&self, epoch: Epoch) -> Result<(), DescriptorError> {
        if self.name.is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        if self.addresses.is_empty() {
            return Err(DescriptorError::NoAddresses);
        }
        if self.layer != 0 && self.layer != LAYER_PROVIDER {
            return Err(DescriptorError::InvalidLayer(self.layer));
        }
        if !self.mix_keys.contains_key(&epoch) {
            return Err(DescriptorError::MissingMixKey(epoch));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor name is empty")]
    EmptyName,
    #[error("descriptor lists no addresses")]
    NoAddresses,
    #[error("descriptor layer {0} is neither a mix nor a provider")]
    InvalidLayer(u8),
    #[error("descriptor has no mix key for epoch {0}")]
    MissingMixKey(Epoch),
}

/// A directory document in parsed form: the network view for one epoch,
/// with every descriptor individually verified.
///
/// This is what clients consume. The on-the-wire form, in which
/// descriptors appear as the raw signed envelopes their nodes uploaded,
/// lives in [`crate::wire`].
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub epoch: Epoch,
    /// Poisson mix rate parameter.
    pub lambda: f64,
    /// Poisson rate parameter for client cover traffic.
    pub lambda_prime: f64,
    /// Maximum per-hop delay in milliseconds.
    pub max_delay: u64,
    /// Mix layers, in routing order. Each descriptor's `layer` field holds
    /// its index here.
    pub topology: Vec<Vec<MixDescriptor>>,
    pub providers: Vec<MixDescriptor>,
}

impl Document {
    /// Checks the structural invariants that make a document usable for
    /// routing.
    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.topology.is_empty() {
            return Err(DocumentError::EmptyTopology);
        }
        let mut seen = BTreeSet::new();
        for (layer, nodes) in self.topology.iter().enumerate() {
            if nodes.is_empty() {
                return Err(DocumentError::EmptyLayer(layer));
            }
            for desc in nodes {
                if !seen.insert(desc.identity_key) {
                    return Err(DocumentError::DuplicateIdentity(
                        desc.identity_key,
                    ));
                }
            }
        }
        if self.providers.is_empty() {
            return Err(DocumentError::NoProviders);
        }
        for desc in &self.providers {
            if !seen.insert(desc.identity_key) {
                return Err(DocumentError::DuplicateIdentity(
                    desc.identity_key,
                ));
            }
            if desc.layer != LAYER_PROVIDER {
                return Err(DocumentError::ProviderLayer {
                    identity: desc.identity_key,
                    layer: desc.layer,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document contains no topology")]
    EmptyTopology,
    #[error("topology layer {0} contains no nodes")]
    EmptyLayer(usize),
    #[error("document contains no providers")]
    NoProviders,
    #[error("multiple document entries for identity {0}")]
    DuplicateIdentity(IdentityPublicKey),
    #[error("{identity} is listed as a provider but carries layer {layer}")]
    ProviderLayer { identity: IdentityPublicKey, layer: u8 },
}
