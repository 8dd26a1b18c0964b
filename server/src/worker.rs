// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The consensus worker: a single task that drafts directory documents,
//! exchanges signatures with peer authorities, and publishes finalized
//! documents.
//!
//! The worker owns the authority's signing key. It is driven from three
//! directions: phase transitions arrive as [`WorkerCommand`]s from the
//! scheduler's hooks, descriptor uploads and peer signatures nudge it
//! through the state's notifier (which is how bootstrap generation makes
//! progress), and a watch channel tells it to stop.

use dirauth_client::{Client, ClientError};
use dirauth_common::epochtime::{Epoch, EpochClock};
use dirauth_common::pki::{
    self, DocumentError, IdentityKeypair, IdentityPublicKey, LAYER_PROVIDER,
};
use dirauth_common::wire::{
    self, Blob, Envelope, EnvelopeSignature, PeerSignatures,
};
use slog::{debug, error, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::config::{Config, Parameters};
use crate::state::{DescriptorRecord, PendingDocument, State};

/// How long to wait before re-asking a peer that has not drafted its vote
/// yet (or has not come up yet).
const EXCHANGE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Network calls we are willing to spend on a single peer during one
/// exchange before giving up on it.
const EXCHANGE_ATTEMPTS: usize = 24;

/// Phase transitions, as delivered by the scheduler's hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// The exchange phase began: draft a document for the next epoch and
    /// trade signatures with the peers.
    DraftVote,
    /// The tabulate phase began: publish the next epoch's document if
    /// enough signatures came back.
    Finalize,
}

#[derive(Debug, Error)]
enum BuildError {
    #[error("no mix descriptors to build a topology from")]
    NoMixes,
    #[error("no provider descriptors")]
    NoProviders,
    #[error("assembled document is not routable")]
    Invalid(#[from] DocumentError),
}

struct Peer {
    name: String,
    identity_key: IdentityPublicKey,
    client: Client,
}

pub struct Worker {
    state: Arc<State>,
    clock: Arc<dyn EpochClock>,
    keypair: IdentityKeypair,
    peers: Vec<Peer>,
    parameters: Parameters,
    layers: usize,
    log: Logger,
    rx: mpsc::UnboundedReceiver<WorkerCommand>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        state: Arc<State>,
        clock: Arc<dyn EpochClock>,
        keypair: IdentityKeypair,
        config: &Config,
        rx: mpsc::UnboundedReceiver<WorkerCommand>,
        shutdown: watch::Receiver<bool>,
        log: &Logger,
    ) -> Result<Worker, ClientError> {
        let log = log.new(o!("component" => "worker"));
        let mut peers = Vec::new();
        for peer in &config.peers {
            peers.push(Peer {
                name: peer.name.clone(),
                identity_key: peer.identity_key,
                client: Client::new(&peer.base_url, &log)?,
            });
        }
        Ok(Worker {
            state,
            clock,
            keypair,
            peers,
            parameters: config.parameters.clone(),
            layers: config.server.layers,
            log,
            rx,
            shutdown,
        })
    }

    pub async fn run(mut self) {
        debug!(self.log, "worker running");
        loop {
            tokio::select! {
                // Discard the `watch::Ref` inside the future so its borrow of
                // `self.shutdown` doesn't outlive this branch.
                _ = async { let _ = self.shutdown.wait_for(|stop| *stop).await; } => {
                    debug!(self.log, "worker shutting down");
                    return;
                }
                command = self.rx.recv() => match command {
                    Some(WorkerCommand::DraftVote) => self.draft_vote().await,
                    Some(WorkerCommand::Finalize) => {
                        self.finalize_next().await
                    }
                    None => return,
                },
                _ = self.state.notify.notified() => {
                    self.poll_bootstrap().await
                }
            }
        }
    }

    /// Scheduled entry into the exchange phase: clean out stale epochs and
    /// draft the next epoch's document from whatever descriptors arrived.
    async fn draft_vote(&self) {
        let now = self.clock.now().epoch;
        self.state.prune(now).await;
        let epoch = now.next();
        if self.state.has_document(epoch).await
            || self.state.has_pending(epoch).await
        {
            return;
        }
        self.generate(epoch).await;
    }

    /// Scheduled entry into the tabulate phase.
    async fn finalize_next(&self) {
        let epoch = self.clock.now().epoch.next();
        self.finalize_epoch(epoch).await;
    }

    /// Runs whenever epoch state changed. During bootstrap this is what
    /// drives generation: draft once every expected descriptor is in, and
    /// finalize as soon as quorum is reached rather than waiting out the
    /// phase schedule.
    async fn poll_bootstrap(&self) {
        let Some(epoch) = self.state.bootstrap_epoch().await else {
            return;
        };
        if self.state.has_pending(epoch).await {
            let have = self.state.signature_count(epoch).await.unwrap_or(0);
            if have >= self.quorum_threshold() {
                info!(self.log, "bootstrap quorum reached"; "epoch" => %epoch);
                self.finalize_epoch(epoch).await;
            }
        } else if self.state.all_expected_present(epoch).await {
            info!(
                self.log, "all expected descriptors present; generating \
                 bootstrap document";
                "epoch" => %epoch,
            );
            self.generate(epoch).await;
        }
    }

    /// Builds and self-signs a document for `epoch`. With no peers
    /// configured our own signature is the whole quorum and the document
    /// publishes immediately; otherwise the draft is recorded and the
    /// signature exchange begins.
    async fn generate(&self, epoch: Epoch) {
        let records = self.state.descriptors_for(epoch).await;
        let doc = match build_document(
            epoch,
            &records,
            &self.parameters,
            self.layers,
        ) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(
                    self.log, "cannot build document";
                    "epoch" => %epoch,
                    "descriptors" => records.len(),
                    "error" => InlineErrorChain::new(&err),
                );
                return;
            }
        };
        let draft = match wire::sign_document(
            &self.keypair,
            &PeerSignatures::new(),
            doc.clone(),
        ) {
            Ok(draft) => draft,
            Err(err) => {
                error!(
                    self.log, "failed to sign drafted document";
                    "epoch" => %epoch,
                    "error" => InlineErrorChain::new(&err),
                );
                return;
            }
        };
        let payload = match Envelope::from_bytes(&draft) {
            Ok(envelope) => envelope.payload.0,
            Err(err) => {
                error!(
                    self.log, "drafted document does not parse back";
                    "epoch" => %epoch,
                    "error" => InlineErrorChain::new(&err),
                );
                return;
            }
        };
        info!(
            self.log, "drafted document";
            "epoch" => %epoch,
            "descriptors" => records.len(),
            "layers" => doc.topology.len(),
        );

        if self.peers.is_empty() {
            self.state.publish(epoch, draft).await;
            return;
        }
        self.state
            .record_draft(
                epoch,
                PendingDocument {
                    doc,
                    payload: payload.clone(),
                    draft,
                    signatures: PeerSignatures::new(),
                },
            )
            .await;
        self.exchange(epoch, &payload).await;
    }

    /// Fetches every peer's vote for `epoch` and, where it agrees with
    /// ours byte for byte, submits our signature over it.
    async fn exchange(&self, epoch: Epoch, payload: &[u8]) {
        for peer in &self.peers {
            if self.exchange_with_peer(peer, epoch, payload).await {
                break;
            }
        }
    }

    /// Runs the exchange against one peer, retrying while the peer is
    /// unreachable or has not drafted yet. Returns true if interrupted by
    /// shutdown.
    async fn exchange_with_peer(
        &self,
        peer: &Peer,
        epoch: Epoch,
        payload: &[u8],
    ) -> bool {
        let log = self.log.new(o!("peer" => peer.name.clone()));
        let mut shutdown = self.shutdown.clone();
        let mut attempts = 0;

        let vote = loop {
            attempts += 1;
            match peer.client.get_vote(epoch).await {
                Ok(vote) => break vote,
                Err(err) if retryable(&err) && attempts < EXCHANGE_ATTEMPTS => {
                    debug!(
                        log, "peer vote not available yet";
                        "epoch" => %epoch,
                        "error" => InlineErrorChain::new(&err),
                    );
                    if self.pause_or_shutdown(&mut shutdown).await {
                        return true;
                    }
                }
                Err(err) => {
                    warn!(
                        log, "giving up fetching peer vote";
                        "epoch" => %epoch,
                        "attempts" => attempts,
                        "error" => InlineErrorChain::new(&err),
                    );
                    return false;
                }
            }
        };

        let envelope = match Envelope::from_bytes(&vote) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    log, "peer vote is malformed";
                    "epoch" => %epoch,
                    "error" => InlineErrorChain::new(&err),
                );
                return false;
            }
        };
        let Some(peer_sig) = envelope
            .signatures
            .iter()
            .find(|sig| sig.signer == peer.identity_key)
        else {
            warn!(
                log, "peer vote is not signed by the peer's identity";
                "epoch" => %epoch,
            );
            return false;
        };
        if let Err(err) =
            wire::verify_envelope_signature(&envelope.payload.0, peer_sig)
        {
            warn!(
                log, "peer vote signature does not verify";
                "epoch" => %epoch,
                "error" => InlineErrorChain::new(&err),
            );
            return false;
        }
        if envelope.payload.0 != payload {
            warn!(
                log, "peer document disagrees with ours; withholding \
                 signature";
                "epoch" => %epoch,
            );
            return false;
        }

        let signature = EnvelopeSignature::new(&self.keypair, payload);
        loop {
            attempts += 1;
            match peer.client.post_signature(epoch, &signature).await {
                Ok(()) => {
                    info!(log, "signed peer document"; "epoch" => %epoch);
                    return false;
                }
                Err(err) if retryable(&err) && attempts < EXCHANGE_ATTEMPTS => {
                    debug!(
                        log, "could not deliver signature";
                        "epoch" => %epoch,
                        "error" => InlineErrorChain::new(&err),
                    );
                    if self.pause_or_shutdown(&mut shutdown).await {
                        return true;
                    }
                }
                Err(err) => {
                    warn!(
                        log, "failed to submit signature to peer";
                        "epoch" => %epoch,
                        "attempts" => attempts,
                        "error" => InlineErrorChain::new(&err),
                    );
                    return false;
                }
            }
        }
    }

    // Returns true if shutdown was signaled while waiting.
    async fn pause_or_shutdown(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        tokio::select! {
            _ = time::sleep(EXCHANGE_RETRY_INTERVAL) => false,
            _ = shutdown.wait_for(|stop| *stop) => true,
        }
    }

    /// Publishes the pending document for `epoch` if enough signatures
    /// were collected; otherwise the draft is discarded.
    async fn finalize_epoch(&self, epoch: Epoch) {
        let Some(pending) = self.state.take_pending(epoch).await else {
            debug!(self.log, "nothing to finalize"; "epoch" => %epoch);
            return;
        };
        let have = pending.signatures.len() + 1;
        let needed = self.quorum_threshold();
        if have < needed {
            warn!(
                self.log,
                "insufficient signatures to finalize; dropping draft";
                "epoch" => %epoch,
                "have" => have,
                "needed" => needed,
            );
            return;
        }
        match wire::sign_document(
            &self.keypair,
            &pending.signatures,
            pending.doc,
        ) {
            Ok(raw) => self.state.publish(epoch, raw).await,
            Err(err) => {
                error!(
                    self.log, "failed to sign finalized document";
                    "epoch" => %epoch,
                    "error" => InlineErrorChain::new(&err),
                );
            }
        }
    }

    /// A strict majority of all authorities, ourselves included.
    fn quorum_threshold(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }
}

fn retryable(err: &ClientError) -> bool {
    match err {
        ClientError::NoVote(_) => true,
        ClientError::Request(err) => err.is_connect() || err.is_timeout(),
        _ => false,
    }
}

/// Assembles the wire form of a document for `epoch` from the accepted
/// records, round-robining mixes across the topology layers.
///
/// Every authority assembles from the same records in the same
/// identity-key order, so agreeing authorities produce byte-identical
/// documents.
fn build_document(
    epoch: Epoch,
    records: &[DescriptorRecord],
    parameters: &Parameters,
    layers: usize,
) -> Result<wire::Document, BuildError> {
    let (providers, mixes): (Vec<&DescriptorRecord>, Vec<&DescriptorRecord>) =
        records
            .iter()
            .partition(|record| record.descriptor.layer == LAYER_PROVIDER);
    if mixes.is_empty() {
        return Err(BuildError::NoMixes);
    }
    if providers.is_empty() {
        return Err(BuildError::NoProviders);
    }

    let layer_count = layers.min(mixes.len()).max(1);
    let mut parsed_topology = vec![Vec::new(); layer_count];
    let mut raw_topology = vec![Vec::new(); layer_count];
    for (i, record) in mixes.iter().enumerate() {
        parsed_topology[i % layer_count].push(record.descriptor.clone());
        raw_topology[i % layer_count].push(Blob(record.raw.clone()));
    }

    let parsed = pki::Document {
        epoch,
        lambda: parameters.lambda,
        lambda_prime: parameters.lambda_prime,
        max_delay: parameters.max_delay,
        topology: parsed_topology,
        providers: providers
            .iter()
            .map(|record| record.descriptor.clone())
            .collect(),
    };
    parsed.validate()?;

    Ok(wire::Document {
        version: String::new(),
        epoch,
        lambda: parameters.lambda,
        lambda_prime: parameters.lambda_prime,
        max_delay: parameters.max_delay,
        topology: raw_topology,
        providers: providers
            .iter()
            .map(|record| Blob(record.raw.clone()))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsStore;
    use crate::test_helpers::{
        signed_descriptor, test_config, test_log, SettableClock,
    };
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    const NOW: Epoch = Epoch(100);

    fn params() -> Parameters {
        Parameters { lambda: 0.00025, lambda_prime: 0.00025, max_delay: 90_000 }
    }

    fn record(
        keypair: &IdentityKeypair,
        name: &str,
        epoch: Epoch,
        layer: u8,
    ) -> DescriptorRecord {
        let raw = signed_descriptor(keypair, name, epoch, layer);
        let descriptor = wire::verify_and_parse_descriptor(&raw).unwrap();
        DescriptorRecord { raw, descriptor }
    }

    fn records_for(epoch: Epoch, mixes: usize) -> Vec<DescriptorRecord> {
        let mut records: Vec<DescriptorRecord> = (0..mixes)
            .map(|i| {
                record(
                    &IdentityKeypair::generate(),
                    &format!("mix{}", i + 1),
                    epoch,
                    0,
                )
            })
            .collect();
        records.push(record(
            &IdentityKeypair::generate(),
            "provider1",
            epoch,
            LAYER_PROVIDER,
        ));
        records.sort_by_key(|record| record.descriptor.identity_key);
        records
    }

    #[test]
    fn round_robin_layers_and_deterministic_bytes() {
        let epoch = Epoch(9);
        let records = records_for(epoch, 5);
        let params = params();
        let first = build_document(epoch, &records, &params, 3).unwrap();
        let second = build_document(epoch, &records, &params, 3).unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );

        let sizes: Vec<usize> = first.topology.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(first.providers.len(), 1);
    }

    #[test]
    fn layer_count_is_capped_by_mix_count() {
        let epoch = Epoch(9);
        let doc =
            build_document(epoch, &records_for(epoch, 2), &params(), 5)
                .unwrap();
        assert_eq!(doc.topology.len(), 2);
    }

    #[test]
    fn build_requires_mixes_and_providers() {
        let epoch = Epoch(9);
        let only_provider = vec![record(
            &IdentityKeypair::generate(),
            "provider1",
            epoch,
            LAYER_PROVIDER,
        )];
        assert!(matches!(
            build_document(epoch, &only_provider, &params(), 3),
            Err(BuildError::NoMixes)
        ));

        let only_mix =
            vec![record(&IdentityKeypair::generate(), "mix1", epoch, 0)];
        assert!(matches!(
            build_document(epoch, &only_mix, &params(), 3),
            Err(BuildError::NoProviders)
        ));
    }

    #[test]
    fn parameters_flow_into_the_document() {
        let epoch = Epoch(9);
        let doc = build_document(epoch, &records_for(epoch, 1), &params(), 3)
            .unwrap();
        assert_eq!(doc.epoch, epoch);
        assert_eq!(doc.lambda, 0.00025);
        assert_eq!(doc.lambda_prime, 0.00025);
        assert_eq!(doc.max_delay, 90_000);
        // The version tag is applied at signing time.
        assert!(doc.version.is_empty());
    }

    struct Harness {
        worker: Worker,
        state: Arc<State>,
        authority: IdentityPublicKey,
        mixes: Vec<IdentityKeypair>,
        provider: IdentityKeypair,
        peer: IdentityKeypair,
        _tx: mpsc::UnboundedSender<WorkerCommand>,
        _shutdown: watch::Sender<bool>,
        _dir: TempDir,
    }

    async fn harness(with_peer: bool, clock: Arc<SettableClock>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root =
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let log = test_log();
        let mixes =
            vec![IdentityKeypair::generate(), IdentityKeypair::generate()];
        let provider = IdentityKeypair::generate();
        let peer = IdentityKeypair::generate();
        let peer_refs: Vec<&IdentityKeypair> =
            if with_peer { vec![&peer] } else { Vec::new() };
        let config = test_config(&mixes, &provider, &peer_refs);

        let store = Arc::new(FsStore::new(&root, &log).unwrap());
        let state_clock: Arc<dyn EpochClock> = clock.clone();
        let state =
            Arc::new(State::new(&config, state_clock, store, &log));
        state.initialize().await.unwrap();

        let keypair = IdentityKeypair::generate();
        let authority = keypair.public();
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_clock: Arc<dyn EpochClock> = clock;
        let worker = Worker::new(
            Arc::clone(&state),
            worker_clock,
            keypair,
            &config,
            rx,
            shutdown_rx,
            &log,
        )
        .unwrap();
        Harness {
            worker,
            state,
            authority,
            mixes,
            provider,
            peer,
            _tx: tx,
            _shutdown: shutdown_tx,
            _dir: dir,
        }
    }

    async fn upload_all(h: &Harness, epoch: Epoch) {
        for (i, mix) in h.mixes.iter().enumerate() {
            let raw =
                signed_descriptor(mix, &format!("mix{}", i + 1), epoch, 0);
            h.state.handle_upload(epoch, &raw).await.unwrap();
        }
        let raw = signed_descriptor(
            &h.provider,
            "provider1",
            epoch,
            LAYER_PROVIDER,
        );
        h.state.handle_upload(epoch, &raw).await.unwrap();
    }

    // Plants a self-signed pending document the way `generate` would,
    // without going through the network exchange.
    async fn record_pending(h: &Harness, epoch: Epoch) -> Vec<u8> {
        let records = vec![
            record(&h.mixes[0], "mix1", epoch, 0),
            record(&h.provider, "provider1", epoch, LAYER_PROVIDER),
        ];
        let doc = build_document(epoch, &records, &params(), 3).unwrap();
        let draft = wire::sign_document(
            &h.worker.keypair,
            &PeerSignatures::new(),
            doc.clone(),
        )
        .unwrap();
        let payload = Envelope::from_bytes(&draft).unwrap().payload.0;
        h.state
            .record_draft(
                epoch,
                PendingDocument {
                    doc,
                    payload: payload.clone(),
                    draft,
                    signatures: PeerSignatures::new(),
                },
            )
            .await;
        payload
    }

    #[tokio::test]
    async fn sole_authority_publishes_at_bootstrap() {
        let clock = Arc::new(SettableClock::at(NOW, Duration::ZERO));
        let h = harness(false, clock).await;
        upload_all(&h, NOW).await;

        h.worker.poll_bootstrap().await;

        assert_eq!(h.state.bootstrap_epoch().await, None);
        let published = h.state.document_for_epoch(NOW).await.unwrap();
        let doc =
            wire::verify_and_parse_document(&published, &h.authority, NOW)
                .unwrap();
        assert_eq!(doc.topology.iter().map(Vec::len).sum::<usize>(), 2);
        assert_eq!(doc.providers.len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_waits_for_every_expected_descriptor() {
        let clock = Arc::new(SettableClock::at(NOW, Duration::ZERO));
        let h = harness(false, clock).await;
        let raw = signed_descriptor(&h.mixes[0], "mix1", NOW, 0);
        h.state.handle_upload(NOW, &raw).await.unwrap();

        h.worker.poll_bootstrap().await;

        assert_eq!(h.state.bootstrap_epoch().await, Some(NOW));
        assert!(h.state.document_for_epoch(NOW).await.is_err());
    }

    #[tokio::test]
    async fn scheduled_draft_takes_whatever_arrived() {
        let clock = Arc::new(SettableClock::at(
            NOW,
            Duration::from_secs(120 * 60),
        ));
        let h = harness(false, clock).await;
        let next = NOW.next();
        let raw = signed_descriptor(&h.mixes[0], "mix1", next, 0);
        h.state.handle_upload(next, &raw).await.unwrap();
        let raw = signed_descriptor(
            &h.provider,
            "provider1",
            next,
            LAYER_PROVIDER,
        );
        h.state.handle_upload(next, &raw).await.unwrap();

        h.worker.draft_vote().await;

        let published = h.state.document_for_epoch(next).await.unwrap();
        let doc =
            wire::verify_and_parse_document(&published, &h.authority, next)
                .unwrap();
        assert_eq!(doc.topology.iter().map(Vec::len).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn finalize_without_quorum_drops_the_draft() {
        let clock = Arc::new(SettableClock::at(
            NOW,
            Duration::from_secs(150 * 60),
        ));
        let h = harness(true, clock).await;
        let next = NOW.next();
        record_pending(&h, next).await;

        h.worker.finalize_next().await;

        assert!(!h.state.has_pending(next).await);
        assert!(h.state.document_for_epoch(next).await.is_err());
    }

    #[tokio::test]
    async fn finalize_with_quorum_publishes_combined_document() {
        let clock = Arc::new(SettableClock::at(
            NOW,
            Duration::from_secs(150 * 60),
        ));
        let h = harness(true, clock).await;
        let next = NOW.next();
        let payload = record_pending(&h, next).await;
        let signature = EnvelopeSignature::new(&h.peer, &payload);
        h.state
            .handle_signature(next, &serde_json::to_vec(&signature).unwrap())
            .await
            .unwrap();

        h.worker.finalize_next().await;

        let published = h.state.document_for_epoch(next).await.unwrap();
        // The combined document verifies under either authority.
        wire::verify_and_parse_document(&published, &h.authority, next)
            .unwrap();
        wire::verify_and_parse_document(&published, &h.peer.public(), next)
            .unwrap();
        let sigs =
            wire::verify_peer_signatures(&published, &[h.peer.public()])
                .unwrap();
        assert_eq!(sigs.len(), 1);
    }
}
