// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-epoch authority state: descriptor acceptance, document
//! availability, and the draft/signature bookkeeping behind consensus.
//!
//! The authorization tables are immutable once constructed; everything
//! per-epoch lives behind one `RwLock`. Uploads and signature submissions
//! take the write half briefly to mutate in-memory tables; document and
//! vote lookups take the read half. Signature verification and descriptor
//! parsing are done before any lock is taken, and persistence happens
//! after the lock is dropped.

use dirauth_common::epochtime::{Epoch, EpochClock};
use dirauth_common::pki::{DescriptorError, IdentityPublicKey, MixDescriptor};
use dirauth_common::wire::{
    self, EnvelopeSignature, PeerSignatures, WireError,
};
use slog::{debug, error, info, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};

use crate::config::Config;
use crate::storage::{StorageError, Store};

/// How much of an epoch must remain for a next-epoch document to still be
/// worth generating. A fetch for the next epoch inside this tail reports
/// "gone" rather than "not yet".
pub const GENERATION_DEADLINE: Duration = Duration::from_secs(45 * 60);

/// One accepted upload: the parsed descriptor plus the exact bytes the
/// node signed, kept for idempotence comparison and for embedding in
/// documents.
#[derive(Debug, Clone)]
pub struct DescriptorRecord {
    pub raw: Vec<u8>,
    pub descriptor: MixDescriptor,
}

/// A drafted document awaiting peer signatures.
#[derive(Debug)]
pub struct PendingDocument {
    /// The wire form, re-signed at finalization with the collected
    /// signatures appended.
    pub doc: wire::Document,
    /// Canonical payload bytes; peer signatures must verify over exactly
    /// these.
    pub payload: Vec<u8>,
    /// The self-signed envelope served to peers as our vote.
    pub draft: Vec<u8>,
    pub signatures: PeerSignatures,
}

#[derive(Debug, Default)]
struct StateInner {
    bootstrap_epoch: Option<Epoch>,
    descriptors: BTreeMap<Epoch, BTreeMap<IdentityPublicKey, DescriptorRecord>>,
    documents: BTreeMap<Epoch, Vec<u8>>,
    pending: BTreeMap<Epoch, PendingDocument>,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("malformed descriptor envelope: {0}")]
    Malformed(#[from] WireError),
    #[error("invalid descriptor: {0}")]
    Invalid(#[from] DescriptorError),
    #[error("{0} is not an authorized node")]
    Unauthorized(IdentityPublicKey),
    #[error("epoch {requested} is outside the upload window around {now}")]
    OutsideWindow { requested: Epoch, now: Epoch },
    #[error("a different descriptor was already accepted for epoch {0}")]
    Conflict(Epoch),
    #[error("the document for epoch {0} has already been published")]
    LateUpload(Epoch),
    #[error("failed to persist descriptor")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("document for epoch {0} is not yet available")]
    NotYet(Epoch),
    #[error("document for epoch {0} is no longer obtainable")]
    Gone(Epoch),
    #[error("epoch {0} is too far ahead to request a document for")]
    TooFarAhead(Epoch),
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("malformed signature submission: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("{0} is not a configured peer authority")]
    Unauthorized(IdentityPublicKey),
    #[error("no pending document for epoch {0}")]
    NoPendingDocument(Epoch),
    #[error("signature does not verify over the pending document: {0}")]
    BadSignature(#[source] WireError),
}

pub struct State {
    log: Logger,
    clock: Arc<dyn EpochClock>,
    store: Arc<dyn Store>,
    authorized_mixes: BTreeSet<IdentityPublicKey>,
    authorized_providers: BTreeMap<IdentityPublicKey, String>,
    peers: BTreeSet<IdentityPublicKey>,
    /// Wakes the worker whenever epoch state changes in a way that could
    /// unblock drafting or finalization.
    pub(crate) notify: Notify,
    inner: RwLock<StateInner>,
}

impl State {
    pub fn new(
        config: &Config,
        clock: Arc<dyn EpochClock>,
        store: Arc<dyn Store>,
        log: &Logger,
    ) -> State {
        State {
            log: log.new(slog::o!("component" => "state")),
            clock,
            store,
            authorized_mixes: config
                .mixes
                .iter()
                .map(|mix| mix.identity_key)
                .collect(),
            authorized_providers: config
                .providers
                .iter()
                .map(|provider| {
                    (provider.identity_key, provider.name.clone())
                })
                .collect(),
            peers: config.peers.iter().map(|peer| peer.identity_key).collect(),
            notify: Notify::new(),
            inner: RwLock::new(StateInner::default()),
        }
    }

    /// Reloads persisted epoch state and, if no document exists for the
    /// current epoch, arms bootstrap generation for it.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        let now = self.clock.now().epoch;
        let mut candidates = BTreeSet::new();
        candidates.insert(Epoch(now.0.saturating_sub(1)));
        candidates.insert(now);
        candidates.insert(now.next());

        let mut loaded = StateInner::default();
        for &epoch in &candidates {
            if let Some(raw) = self.store.get_document(epoch).await? {
                debug!(
                    self.log, "reloaded persisted document";
                    "epoch" => %epoch,
                );
                loaded.documents.insert(epoch, raw);
            }
            for raw in self.store.list_descriptors(epoch).await? {
                match wire::verify_and_parse_descriptor(&raw) {
                    Ok(descriptor)
                        if self.is_authorized(&descriptor)
                            && descriptor.validate(epoch).is_ok() =>
                    {
                        loaded.descriptors.entry(epoch).or_default().insert(
                            descriptor.identity_key,
                            DescriptorRecord { raw, descriptor },
                        );
                    }
                    Ok(descriptor) => {
                        warn!(
                            self.log,
                            "dropping persisted descriptor that is no \
                             longer acceptable";
                            "epoch" => %epoch,
                            "identity" => %descriptor.identity_key,
                        );
                    }
                    Err(err) => {
                        warn!(
                            self.log, "dropping unparseable persisted \
                             descriptor";
                            "epoch" => %epoch,
                            "error" => %err,
                        );
                    }
                }
            }
        }

        if !loaded.documents.contains_key(&now) {
            info!(
                self.log,
                "no document for the current epoch; bootstrap generation \
                 armed";
                "epoch" => %now,
            );
            loaded.bootstrap_epoch = Some(now);
        }
        *self.inner.write().await = loaded;
        Ok(())
    }

    /// Checks `descriptor` against the static authorization tables: a mix
    /// by identity key, a provider by identity key and registered name.
    pub fn is_authorized(&self, descriptor: &MixDescriptor) -> bool {
        if descriptor.layer == 0 {
            self.authorized_mixes.contains(&descriptor.identity_key)
        } else if descriptor.layer == dirauth_common::pki::LAYER_PROVIDER {
            self.authorized_providers
                .get(&descriptor.identity_key)
                .is_some_and(|name| *name == descriptor.name)
        } else {
            false
        }
    }

    /// Accepts (or rejects) one descriptor upload for `epoch`.
    ///
    /// Re-submitting bytes that were already accepted is a harmless no-op;
    /// submitting different bytes for an identity that already has a
    /// record is a conflict, and nothing new is accepted for an epoch
    /// whose document is already published.
    pub async fn handle_upload(
        &self,
        epoch: Epoch,
        raw: &[u8],
    ) -> Result<(), UploadError> {
        let descriptor = wire::verify_and_parse_descriptor(raw)?;
        descriptor.validate(epoch)?;
        if !self.is_authorized(&descriptor) {
            return Err(UploadError::Unauthorized(descriptor.identity_key));
        }
        let now = self.clock.now().epoch;
        if now.0.abs_diff(epoch.0) > 1 {
            return Err(UploadError::OutsideWindow { requested: epoch, now });
        }

        let identity = descriptor.identity_key;
        {
            let mut inner = self.inner.write().await;
            let records = inner.descriptors.entry(epoch).or_default();
            if let Some(existing) = records.get(&identity) {
                if existing.raw == raw {
                    debug!(
                        self.log, "ignoring idempotent descriptor resubmission";
                        "epoch" => %epoch,
                        "identity" => %identity,
                    );
                    return Ok(());
                }
                return Err(UploadError::Conflict(epoch));
            }
            if inner.documents.contains_key(&epoch) {
                return Err(UploadError::LateUpload(epoch));
            }
            inner.descriptors.entry(epoch).or_default().insert(
                identity,
                DescriptorRecord { raw: raw.to_vec(), descriptor },
            );
        }

        // An upload the node got a success for must survive a restart, so
        // a persistence failure fails the request. The in-memory record is
        // rolled back so a retry is not misread as a conflict.
        if let Err(err) =
            self.store.put_descriptor(epoch, &identity, raw).await
        {
            error!(
                self.log, "failed to persist descriptor";
                "epoch" => %epoch,
                "identity" => %identity,
                "error" => %err,
            );
            let mut inner = self.inner.write().await;
            if let Some(records) = inner.descriptors.get_mut(&epoch) {
                records.remove(&identity);
            }
            return Err(UploadError::Storage(err));
        }
        info!(
            self.log, "accepted descriptor";
            "epoch" => %epoch,
            "identity" => %identity,
        );
        self.notify.notify_one();
        Ok(())
    }

    /// Returns the published document for `epoch`, or classifies why none
    /// is available: not yet ready (retry later), gone (never retry), or
    /// too far ahead to ask about.
    pub async fn document_for_epoch(
        &self,
        epoch: Epoch,
    ) -> Result<Vec<u8>, FetchError> {
        let inner = self.inner.read().await;
        if let Some(raw) = inner.documents.get(&epoch) {
            return Ok(raw.clone());
        }
        let position = self.clock.now();
        let now = position.epoch;
        if epoch == now {
            if inner.bootstrap_epoch == Some(now) {
                Err(FetchError::NotYet(epoch))
            } else {
                Err(FetchError::Gone(epoch))
            }
        } else if epoch == now.next() {
            if position.remaining >= GENERATION_DEADLINE {
                Err(FetchError::NotYet(epoch))
            } else {
                Err(FetchError::Gone(epoch))
            }
        } else if epoch < now {
            Err(FetchError::Gone(epoch))
        } else {
            Err(FetchError::TooFarAhead(epoch))
        }
    }

    /// The self-signed draft served to peers during the exchange phase.
    pub async fn vote_for_epoch(&self, epoch: Epoch) -> Option<Vec<u8>> {
        self.inner.read().await.pending.get(&epoch).map(|p| p.draft.clone())
    }

    /// Records one peer's signature over the pending document for `epoch`.
    pub async fn handle_signature(
        &self,
        epoch: Epoch,
        body: &[u8],
    ) -> Result<(), SignatureError> {
        let signature: EnvelopeSignature = serde_json::from_slice(body)
            .map_err(SignatureError::Malformed)?;
        if !self.peers.contains(&signature.signer) {
            return Err(SignatureError::Unauthorized(signature.signer));
        }
        let payload = self
            .inner
            .read()
            .await
            .pending
            .get(&epoch)
            .map(|p| p.payload.clone())
            .ok_or(SignatureError::NoPendingDocument(epoch))?;
        wire::verify_envelope_signature(&payload, &signature)
            .map_err(SignatureError::BadSignature)?;

        let signer = signature.signer;
        {
            let mut inner = self.inner.write().await;
            let pending = inner
                .pending
                .get_mut(&epoch)
                .ok_or(SignatureError::NoPendingDocument(epoch))?;
            pending.signatures.insert(signer, signature);
            info!(
                self.log, "recorded peer signature";
                "epoch" => %epoch,
                "peer" => %signer,
                "collected" => pending.signatures.len(),
            );
        }
        self.notify.notify_one();
        Ok(())
    }

    pub async fn bootstrap_epoch(&self) -> Option<Epoch> {
        self.inner.read().await.bootstrap_epoch
    }

    /// True once every configured mix and provider has a record for
    /// `epoch`. Gates bootstrap generation only; scheduled drafting takes
    /// whatever arrived.
    pub async fn all_expected_present(&self, epoch: Epoch) -> bool {
        let inner = self.inner.read().await;
        let Some(records) = inner.descriptors.get(&epoch) else {
            return self.expected_total() == 0;
        };
        self.authorized_mixes
            .iter()
            .chain(self.authorized_providers.keys())
            .all(|identity| records.contains_key(identity))
    }

    pub fn expected_total(&self) -> usize {
        self.authorized_mixes.len() + self.authorized_providers.len()
    }

    /// Accepted records for `epoch`, in identity-key order.
    pub async fn descriptors_for(&self, epoch: Epoch) -> Vec<DescriptorRecord> {
        self.inner
            .read()
            .await
            .descriptors
            .get(&epoch)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn has_document(&self, epoch: Epoch) -> bool {
        self.inner.read().await.documents.contains_key(&epoch)
    }

    pub async fn has_pending(&self, epoch: Epoch) -> bool {
        self.inner.read().await.pending.contains_key(&epoch)
    }

    pub async fn record_draft(&self, epoch: Epoch, pending: PendingDocument) {
        let mut inner = self.inner.write().await;
        inner.pending.insert(epoch, pending);
    }

    /// Signatures collected so far for the pending document, counting our
    /// own implicit one.
    pub async fn signature_count(&self, epoch: Epoch) -> Option<usize> {
        self.inner
            .read()
            .await
            .pending
            .get(&epoch)
            .map(|p| p.signatures.len() + 1)
    }

    pub async fn take_pending(&self, epoch: Epoch) -> Option<PendingDocument> {
        self.inner.write().await.pending.remove(&epoch)
    }

    /// Publishes the finalized document for `epoch`: it becomes fetchable,
    /// any pending draft is dropped, and a completed bootstrap is
    /// disarmed.
    pub async fn publish(&self, epoch: Epoch, raw: Vec<u8>) {
        let bytes = raw.len();
        {
            let mut inner = self.inner.write().await;
            inner.documents.insert(epoch, raw.clone());
            inner.pending.remove(&epoch);
            if inner.bootstrap_epoch == Some(epoch) {
                inner.bootstrap_epoch = None;
            }
        }
        info!(
            self.log, "document published";
            "epoch" => %epoch,
            "bytes" => bytes,
        );
        if let Err(err) = self.store.put_document(epoch, &raw).await {
            error!(
                self.log, "failed to persist document";
                "epoch" => %epoch,
                "error" => %err,
            );
        }
    }

    /// Drops state for epochs that can no longer matter: descriptors and
    /// drafts older than the current epoch, documents older than the
    /// previous one.
    pub async fn prune(&self, now: Epoch) {
        let mut inner = self.inner.write().await;
        let keep_documents = Epoch(now.0.saturating_sub(1));
        inner.documents.retain(|&epoch, _| epoch >= keep_documents);
        inner.descriptors.retain(|&epoch, _| epoch >= now);
        let stale: Vec<Epoch> = inner
            .pending
            .range(..now)
            .map(|(&epoch, _)| epoch)
            .collect();
        for epoch in stale {
            inner.pending.remove(&epoch);
            warn!(
                self.log, "discarding draft never finalized";
                "epoch" => %epoch,
            );
        }
        if inner.bootstrap_epoch.is_some_and(|epoch| epoch < now) {
            debug!(self.log, "bootstrap window expired unused");
            inner.bootstrap_epoch = None;
        }
    }
}
