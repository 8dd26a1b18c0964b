// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable storage for descriptors and published documents.
//!
//! Epoch state is written out as it is accepted so that a restarted
//! authority can pick up mid-epoch instead of re-entering bootstrap. A
//! descriptor that cannot be persisted fails the upload that carried it;
//! a document that cannot be persisted is still served from memory, since
//! refusing to publish it would be strictly worse.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use dirauth_common::epochtime::Epoch;
use dirauth_common::pki::IdentityPublicKey;
use slog::{warn, Logger};
use slog_error_chain::SlogInlineError;
use std::io::ErrorKind;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error, SlogInlineError)]
pub enum StorageError {
    #[error("I/O error on \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Persistence consumed by the authority state: raw descriptor envelopes
/// and finalized document envelopes, keyed by epoch.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_descriptor(
        &self,
        epoch: Epoch,
        identity: &IdentityPublicKey,
        raw: &[u8],
    ) -> Result<(), StorageError>;

    /// Returns every stored descriptor envelope for `epoch`, in no
    /// particular order. An epoch nothing was stored for yields an empty
    /// list.
    async fn list_descriptors(
        &self,
        epoch: Epoch,
    ) -> Result<Vec<Vec<u8>>, StorageError>;

    async fn put_document(
        &self,
        epoch: Epoch,
        raw: &[u8],
    ) -> Result<(), StorageError>;

    async fn get_document(
        &self,
        epoch: Epoch,
    ) -> Result<Option<Vec<u8>>, StorageError>;
}

/// File-backed [`Store`]: one file per document under `documents/`, one
/// file per descriptor under `descriptors/<epoch>/`.
pub struct FsStore {
    documents_dir: Utf8PathBuf,
    descriptors_dir: Utf8PathBuf,
    log: Logger,
}

impl FsStore {
    pub fn new(data_dir: &Utf8Path, log: &Logger) -> Result<Self, StorageError> {
        let documents_dir = data_dir.join("documents");
        let descriptors_dir = data_dir.join("descriptors");
        for dir in [&documents_dir, &descriptors_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|err| StorageError::Io { path: dir.clone(), err })?;
        }
        Ok(Self {
            documents_dir,
            descriptors_dir,
            log: log.new(slog::o!("component" => "fs-store")),
        })
    }

    fn document_path(&self, epoch: Epoch) -> Utf8PathBuf {
        self.documents_dir.join(epoch.to_string())
    }

    fn descriptor_dir(&self, epoch: Epoch) -> Utf8PathBuf {
        self.descriptors_dir.join(epoch.to_string())
    }

    /// Write via a temp file and rename, so a crash mid-write never leaves
    /// a truncated file under the final name.
    async fn write_atomic(
        &self,
        path: &Utf8Path,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)
            .await
            .map_err(|err| StorageError::Io { path: tmp.clone(), err })?;
        fs::rename(&tmp, path)
            .await
            .map_err(|err| StorageError::Io { path: path.into(), err })
    }
}

#[async_trait]
impl Store for FsStore {
    async fn put_descriptor(
        &self,
        epoch: Epoch,
        identity: &IdentityPublicKey,
        raw: &[u8],
    ) -> Result<(), StorageError> {
        let dir = self.descriptor_dir(epoch);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StorageError::Io { path: dir.clone(), err })?;
        let path = dir.join(hex::encode(identity.as_bytes()));
        self.write_atomic(&path, raw).await
    }

    async fn list_descriptors(
        &self,
        epoch: Epoch,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        let dir = self.descriptor_dir(epoch);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(StorageError::Io { path: dir.clone(), err });
            }
        };
        let mut raws = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|err| StorageError::Io { path: dir.clone(), err })?;
            let Some(entry) = entry else { break };
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                warn!(
                    self.log, "ignoring non-UTF-8 file in descriptor dir";
                    "dir" => %dir,
                );
                continue;
            };
            // Leftovers from a crash between write and rename.
            if name.ends_with(".tmp") {
                continue;
            }
            let path = dir.join(name);
            let raw = fs::read(&path)
                .await
                .map_err(|err| StorageError::Io { path, err })?;
            raws.push(raw);
        }
        Ok(raws)
    }

    async fn put_document(
        &self,
        epoch: Epoch,
        raw: &[u8],
    ) -> Result<(), StorageError> {
        self.write_atomic(&self.document_path(epoch), raw).await
    }

    async fn get_document(
        &self,
        epoch: Epoch,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.document_path(epoch);
        match fs::read(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io { path, err }),
        }
    }
}
