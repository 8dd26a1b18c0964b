// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the directory authority HTTP API.
//!
//! Nodes use [`Client::post_descriptor`] and [`Client::get_document`];
//! authorities additionally use [`Client::get_vote`] and
//! [`Client::post_signature`] against each other during the exchange
//! phase. "Not yet" and "gone" document outcomes surface as their own
//! error variants so callers can tell retry-later from give-up.

use dirauth_common::epochtime::Epoch;
use dirauth_common::pki::{self, IdentityPublicKey};
use dirauth_common::wire::{self, EnvelopeSignature, WireError};
use reqwest::StatusCode;
use slog::{debug, o, Logger};
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to construct HTTP client")]
    BuildFailed(#[source] reqwest::Error),
    #[error("request failed")]
    Request(#[from] reqwest::Error),
    #[error("failed to serialize request body")]
    Serialize(#[source] serde_json::Error),
    #[error("document for epoch {0} is not yet available")]
    NotYet(Epoch),
    #[error("document for epoch {0} is no longer obtainable")]
    Gone(Epoch),
    #[error("no vote published for epoch {0}")]
    NoVote(Epoch),
    #[error("unexpected response status {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("document failed verification")]
    InvalidDocument(#[from] WireError),
}

pub struct Client {
    base_url: String,
    client: reqwest::Client,
    log: Logger,
}

impl Client {
    pub fn new(base_url: &str, log: &Logger) -> Result<Client, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ClientError::BuildFailed)?;
        Ok(Client {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            log: log.new(o!(
                "component" => "DirauthClient",
                "base_url" => base_url.to_string(),
            )),
        })
    }

    /// Uploads a signed descriptor envelope for `epoch`.
    pub async fn post_descriptor(
        &self,
        epoch: Epoch,
        raw: &[u8],
    ) -> Result<(), ClientError> {
        debug!(self.log, "uploading descriptor"; "epoch" => %epoch);
        let url = format!("{}/v0/descriptors/{}", self.base_url, epoch);
        let response = self.client.post(url).body(raw.to_vec()).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }

    /// Fetches the raw signed document for `epoch` without verifying it.
    pub async fn get_document_raw(
        &self,
        epoch: Epoch,
    ) -> Result<Vec<u8>, ClientError> {
        debug!(self.log, "fetching document"; "epoch" => %epoch);
        let url = format!("{}/v0/documents/{}", self.base_url, epoch);
        let response = self.client.get(url).send().await?;
        match response.status() {
            status if status.is_success() => {
                Ok(response.bytes().await?.to_vec())
            }
            StatusCode::SERVICE_UNAVAILABLE => Err(ClientError::NotYet(epoch)),
            StatusCode::GONE => Err(ClientError::Gone(epoch)),
            _ => Err(Self::error_from(response).await),
        }
    }

    /// Fetches the document for `epoch` and verifies it against
    /// `authority`'s identity before parsing it.
    pub async fn get_document(
        &self,
        epoch: Epoch,
        authority: &IdentityPublicKey,
    ) -> Result<pki::Document, ClientError> {
        let raw = self.get_document_raw(epoch).await?;
        Ok(wire::verify_and_parse_document(&raw, authority, epoch)?)
    }

    /// Fetches the authority's self-signed draft for `epoch`, if it has
    /// drafted one.
    pub async fn get_vote(&self, epoch: Epoch) -> Result<Vec<u8>, ClientError> {
        debug!(self.log, "fetching vote"; "epoch" => %epoch);
        let url = format!("{}/v0/votes/{}", self.base_url, epoch);
        let response = self.client.get(url).send().await?;
        match response.status() {
            status if status.is_success() => {
                Ok(response.bytes().await?.to_vec())
            }
            StatusCode::NOT_FOUND => Err(ClientError::NoVote(epoch)),
            _ => Err(Self::error_from(response).await),
        }
    }

    /// Submits our signature over the authority's pending document for
    /// `epoch`.
    pub async fn post_signature(
        &self,
        epoch: Epoch,
        signature: &EnvelopeSignature,
    ) -> Result<(), ClientError> {
        debug!(self.log, "submitting signature"; "epoch" => %epoch);
        let body =
            serde_json::to_vec(signature).map_err(ClientError::Serialize)?;
        let url = format!("{}/v0/signatures/{}", self.base_url, epoch);
        let response = self.client.post(url).body(body).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }

    // Pulls the "message" field out of an error response body, falling
    // back to the raw body text.
    async fn error_from(response: reqwest::Response) -> ClientError {
        let status = response.status();
        let message = match response.bytes().await {
            Ok(body) => serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|value| {
                    value
                        .get("message")
                        .and_then(|m| m.as_str())
                        .map(String::from)
                })
                .unwrap_or_else(|| {
                    String::from_utf8_lossy(&body).into_owned()
                }),
            Err(_) => String::new(),
        };
        ClientError::Status { status, message }
    }
}
