// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing envelope and canonical serialization for descriptors and
//! directory documents.
//!
//! Everything that crosses the wire is a JSON [`Envelope`]: opaque payload
//! bytes plus one or more detached Ed25519 signatures, each carrying the
//! signer's public key. A verifier recovers the claimed key from the
//! envelope itself and then holds the payload to account against it; for
//! descriptors the payload must additionally embed the same identity key
//! it was signed with.
//!
//! Serialization is canonical by construction: structs serialize their
//! fields in declaration order and every map is a `BTreeMap`, so equal
//! values always produce identical bytes. Peer authorities rely on this:
//! a document assembled independently from the same descriptor set
//! serializes to the same payload, and detached signatures over it can be
//! exchanged and combined without re-serialization ambiguity.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::b64;
use crate::epochtime::Epoch;
use crate::pki::{
    self, DescriptorError, DocumentError, IdentityKeypair, IdentityPublicKey,
    MixDescriptor, PkiError,
};

/// Version tag carried in descriptor payloads.
const DESCRIPTOR_VERSION: &str = "descriptor-v0";

/// Version tag carried in document payloads.
const DOCUMENT_VERSION: &str = "document-v0";

/// The only signature algorithm envelopes may carry.
pub const SIGNATURE_ALG_ED25519: &str = "ed25519";

/// Opaque bytes, base64 on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

impl Serialize for Blob {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        b64::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        b64::deserialize_vec(deserializer).map(Self)
    }
}

/// One signer's detached signature within an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvelopeSignature {
    /// Signature algorithm label; must be [`SIGNATURE_ALG_ED25519`].
    pub alg: String,
    /// The public key the signer claims to have signed with.
    pub signer: IdentityPublicKey,
    /// Detached signature over the envelope payload.
    pub signature: Blob,
}

impl EnvelopeSignature {
    /// Signs `payload` with `keypair`, producing one envelope signature
    /// entry.
    pub fn new(keypair: &IdentityKeypair, payload: &[u8]) -> EnvelopeSignature {
        EnvelopeSignature {
            alg: SIGNATURE_ALG_ED25519.to_string(),
            signer: keypair.public(),
            signature: Blob(keypair.sign(payload).to_vec()),
        }
    }
}

/// The outer signed container for descriptors and documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub payload: Blob,
    pub signatures: Vec<EnvelopeSignature>,
}

impl Envelope {
    pub fn from_bytes(raw: &[u8]) -> Result<Envelope, WireError> {
        serde_json::from_slice(raw).map_err(WireError::MalformedEnvelope)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }
}

/// Signatures collected from peer authorities, keyed by signer.
pub type PeerSignatures = BTreeMap<IdentityPublicKey, EnvelopeSignature>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorPayload {
    version: String,
    descriptor: MixDescriptor,
}

/// On-the-wire form of a directory document.
///
/// Descriptors appear as the raw signed envelopes their nodes uploaded,
/// layered in routing order; parsing a document re-verifies every one of
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    pub version: String,
    pub epoch: Epoch,
    pub lambda: f64,
    pub lambda_prime: f64,
    pub max_delay: u64,
    pub topology: Vec<Vec<Blob>>,
    pub providers: Vec<Blob>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed envelope")]
    MalformedEnvelope(#[source] serde_json::Error),
    #[error("malformed payload")]
    MalformedPayload(#[source] serde_json::Error),
    #[error("serialization failed")]
    Encode(#[source] serde_json::Error),
    #[error("unexpected signature count {0}")]
    SignatureCount(usize),
    #[error("unsupported signature algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    #[error("signature verification failed")]
    BadSignature(#[source] PkiError),
    #[error("unsupported version {0:?}")]
    WrongVersion(String),
    #[error("payload identity key does not match the envelope signing key")]
    SigningKeyMismatch,
    #[error("document is not signed by {0}")]
    NotSigned(IdentityPublicKey),
    #[error("document is for epoch {found}, not {expected}")]
    EpochMismatch { expected: Epoch, found: Epoch },
    #[error("invalid descriptor")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("malformed document")]
    MalformedDocument(#[from] DocumentError),
}

/// Checks algorithm and signature bytes for one envelope signature over
/// `payload`.
pub fn verify_envelope_signature(
    payload: &[u8],
    sig: &EnvelopeSignature,
) -> Result<(), WireError> {
    if sig.alg != SIGNATURE_ALG_ED25519 {
        return Err(WireError::UnsupportedAlgorithm(sig.alg.clone()));
    }
    sig.signer
        .verify(payload, &sig.signature.0)
        .map_err(WireError::BadSignature)
}

/// Wraps `desc` in a self-signed envelope.
///
/// The caller is the node itself: the envelope is signed with `keypair`
/// and carries its public key, which must also be the descriptor's
/// identity key for the result to verify.
pub fn sign_descriptor(
    keypair: &IdentityKeypair,
    desc: &MixDescriptor,
) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(&DescriptorPayload {
        version: DESCRIPTOR_VERSION.to_string(),
        descriptor: desc.clone(),
    })
    .map_err(WireError::Encode)?;
    let signature = EnvelopeSignature::new(keypair, &payload);
    Envelope { payload: Blob(payload), signatures: vec![signature] }
        .to_bytes()
}

/// Verifies a descriptor envelope and returns the descriptor.
///
/// Descriptors are self-signed: the envelope must carry exactly one
/// Ed25519 signature, it must verify under the envelope's own signer key,
/// and that key must equal the identity key embedded in the payload.
pub fn verify_and_parse_descriptor(
    raw: &[u8],
) -> Result<MixDescriptor, WireError> {
    let envelope = Envelope::from_bytes(raw)?;
    if envelope.signatures.len() != 1 {
        return Err(WireError::SignatureCount(envelope.signatures.len()));
    }
    let sig = &envelope.signatures[0];
    verify_envelope_signature(&envelope.payload.0, sig)?;

    let payload: DescriptorPayload =
        serde_json::from_slice(&envelope.payload.0)
            .map_err(WireError::MalformedPayload)?;
    if payload.version != DESCRIPTOR_VERSION {
        return Err(WireError::WrongVersion(payload.version));
    }
    if payload.descriptor.identity_key != sig.signer {
        return Err(WireError::SigningKeyMismatch);
    }
    Ok(payload.descriptor)
}

/// Signs a document, appending any collected peer signatures.
///
/// The authority's own signature always comes first; peer signatures
/// follow in signer-key order. Callers validate the parsed form of the
/// document before serializing it into `doc`.
pub fn sign_document(
    keypair: &IdentityKeypair,
    peer_sigs: &PeerSignatures,
    mut doc: Document,
) -> Result<Vec<u8>, WireError> {
    doc.version = DOCUMENT_VERSION.to_string();
    let payload = serde_json::to_vec(&doc).map_err(WireError::Encode)?;
    let own = EnvelopeSignature::new(keypair, &payload);
    let mut signatures = vec![own];
    signatures.extend(
        peer_sigs
            .values()
            .filter(|sig| sig.signer != keypair.public())
            .cloned(),
    );
    Envelope { payload: Blob(payload), signatures }.to_bytes()
}

/// Verifies a document envelope against one authority's key and parses it
/// into its consumable form.
///
/// Every signature present must be Ed25519, and the one made by
/// `authority` must verify; additional peer signatures are allowed and are
/// not checked here (see [`verify_peer_signatures`]). Each embedded
/// descriptor is then verified individually and validated against the
/// document's epoch, topology descriptors get their `layer` rewritten to
/// their layer index, and the assembled document must be structurally
/// valid.
pub fn verify_and_parse_document(
    raw: &[u8],
    authority: &IdentityPublicKey,
    epoch: Epoch,
) -> Result<pki::Document, WireError> {
    let envelope = Envelope::from_bytes(raw)?;
    if envelope.signatures.is_empty() {
        return Err(WireError::SignatureCount(0));
    }
    for sig in &envelope.signatures {
        if sig.alg != SIGNATURE_ALG_ED25519 {
            return Err(WireError::UnsupportedAlgorithm(sig.alg.clone()));
        }
    }
    let sig = envelope
        .signatures
        .iter()
        .find(|sig| sig.signer == *authority)
        .ok_or(WireError::NotSigned(*authority))?;
    verify_envelope_signature(&envelope.payload.0, sig)?;

    let wire_doc: Document = serde_json::from_slice(&envelope.payload.0)
        .map_err(WireError::MalformedPayload)?;
    if wire_doc.version != DOCUMENT_VERSION {
        return Err(WireError::WrongVersion(wire_doc.version));
    }
    if wire_doc.epoch != epoch {
        return Err(WireError::EpochMismatch {
            expected: epoch,
            found: wire_doc.epoch,
        });
    }

    let mut topology = Vec::with_capacity(wire_doc.topology.len());
    for (layer, blobs) in wire_doc.topology.iter().enumerate() {
        let mut nodes = Vec::with_capacity(blobs.len());
        for blob in blobs {
            let mut desc = verify_and_parse_descriptor(&blob.0)?;
            desc.validate(wire_doc.epoch)?;
            // Nodes sign their descriptors before the authority assigns
            // them a layer, so the embedded value is rewritten to the
            // position the document actually placed them at.
            desc.layer = layer as u8;
            nodes.push(desc);
        }
        topology.push(nodes);
    }
    let mut providers = Vec::with_capacity(wire_doc.providers.len());
    for blob in &wire_doc.providers {
        let desc = verify_and_parse_descriptor(&blob.0)?;
        desc.validate(wire_doc.epoch)?;
        providers.push(desc);
    }

    let doc = pki::Document {
        epoch: wire_doc.epoch,
        lambda: wire_doc.lambda,
        lambda_prime: wire_doc.lambda_prime,
        max_delay: wire_doc.max_delay,
        topology,
        providers,
    };
    doc.validate()?;
    Ok(doc)
}

/// Collects the signatures in a document envelope that verify under the
/// given peer keys.
///
/// A peer whose signature is absent or fails to verify is silently
/// excluded; its absence from the result is what counts against quorum.
pub fn verify_peer_signatures(
    raw: &[u8],
    peers: &[IdentityPublicKey],
) -> Result<PeerSignatures, WireError> {
    let envelope = Envelope::from_bytes(raw)?;
    let mut collected = PeerSignatures::new();
    for peer in peers {
        for sig in &envelope.signatures {
            if sig.signer != *peer {
                continue;
            }
            if verify_envelope_signature(&envelope.payload.0, sig).is_ok() {
                collected.insert(*peer, sig.clone());
                break;
            }
        }
    }
    Ok(collected)
}
