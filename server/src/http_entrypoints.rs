// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use dirauth_common::epochtime::Epoch;
use dropshot::{
    endpoint, ApiDescription, ApiDescriptionRegisterError, FreeformBody,
    HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, Path,
    RequestContext, UntypedBody,
};
use hyper::{Body, StatusCode};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::context::ServerContext;
use crate::state::{FetchError, SignatureError, UploadError};

type DirauthApiDesc = ApiDescription<ServerContext>;

/// Return a description of the directory authority api for use in
/// generating an OpenAPI spec
pub fn api() -> DirauthApiDesc {
    fn register_endpoints(
        api: &mut DirauthApiDesc,
    ) -> Result<(), ApiDescriptionRegisterError> {
        api.register(put_mix_descriptor)?;
        api.register(get_document)?;
        api.register(get_vote)?;
        api.register(put_signature)?;
        Ok(())
    }

    let mut api = DirauthApiDesc::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EpochPathParams {
    /// The epoch the request applies to.
    epoch: u64,
}

/// Upload a signed mix descriptor for an epoch.
///
/// The body is the node's descriptor envelope, exactly as signed.
/// Resubmitting the same bytes is harmless; submitting different bytes
/// for the same epoch is a conflict.
#[endpoint {
    method = POST,
    path = "/v0/descriptors/{epoch}",
}]
async fn put_mix_descriptor(
    rqctx: RequestContext<ServerContext>,
    path: Path<EpochPathParams>,
    body: UntypedBody,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let epoch = Epoch(path.into_inner().epoch);
    rqctx.context().state.handle_upload(epoch, body.as_bytes()).await?;
    Ok(HttpResponseUpdatedNoContent())
}

/// Fetch the directory document for an epoch.
#[endpoint {
    method = GET,
    path = "/v0/documents/{epoch}",
}]
async fn get_document(
    rqctx: RequestContext<ServerContext>,
    path: Path<EpochPathParams>,
) -> Result<HttpResponseOk<FreeformBody>, HttpError> {
    let epoch = Epoch(path.into_inner().epoch);
    let raw = rqctx.context().state.document_for_epoch(epoch).await?;
    Ok(HttpResponseOk(Body::from(raw).into()))
}

/// Fetch this authority's self-signed draft document for an epoch.
///
/// Peer authorities call this during the exchange phase. There is only
/// something to return between drafting and finalization.
#[endpoint {
    method = GET,
    path = "/v0/votes/{epoch}",
}]
async fn get_vote(
    rqctx: RequestContext<ServerContext>,
    path: Path<EpochPathParams>,
) -> Result<HttpResponseOk<FreeformBody>, HttpError> {
    let epoch = Epoch(path.into_inner().epoch);
    match rqctx.context().state.vote_for_epoch(epoch).await {
        Some(raw) => Ok(HttpResponseOk(Body::from(raw).into())),
        None => Err(HttpError::for_not_found(
            None,
            format!("no vote for epoch {epoch}"),
        )),
    }
}

/// Submit a signature over the pending document for an epoch.
///
/// The body is a single envelope signature from a peer authority, made
/// over this authority's draft payload.
#[endpoint {
    method = POST,
    path = "/v0/signatures/{epoch}",
}]
async fn put_signature(
    rqctx: RequestContext<ServerContext>,
    path: Path<EpochPathParams>,
    body: UntypedBody,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let epoch = Epoch(path.into_inner().epoch);
    rqctx.context().state.handle_signature(epoch, body.as_bytes()).await?;
    Ok(HttpResponseUpdatedNoContent())
}

impl From<UploadError> for HttpError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Malformed(_) | UploadError::Invalid(_) => {
                HttpError::for_bad_request(
                    Some("InvalidDescriptor".to_string()),
                    err.to_string(),
                )
            }
            UploadError::Unauthorized(_) => HttpError::for_client_error(
                Some("UnauthorizedNode".to_string()),
                StatusCode::FORBIDDEN,
                err.to_string(),
            ),
            UploadError::OutsideWindow { .. } => HttpError::for_bad_request(
                Some("OutsideUploadWindow".to_string()),
                err.to_string(),
            ),
            UploadError::Conflict(_) => HttpError::for_client_error(
                Some("ConflictingDescriptor".to_string()),
                StatusCode::CONFLICT,
                err.to_string(),
            ),
            UploadError::LateUpload(_) => HttpError::for_client_error(
                Some("LateUpload".to_string()),
                StatusCode::GONE,
                err.to_string(),
            ),
            UploadError::Storage(_) => {
                HttpError::for_internal_error(err.to_string())
            }
        }
    }
}

impl From<FetchError> for HttpError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NotYet(_) => HttpError::for_unavail(
                Some("DocumentNotReady".to_string()),
                err.to_string(),
            ),
            FetchError::Gone(_) => HttpError::for_client_error(
                Some("DocumentGone".to_string()),
                StatusCode::GONE,
                err.to_string(),
            ),
            FetchError::TooFarAhead(_) => HttpError::for_bad_request(
                Some("EpochTooFarAhead".to_string()),
                err.to_string(),
            ),
        }
    }
}

impl From<SignatureError> for HttpError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::Malformed(_) | SignatureError::BadSignature(_) => {
                HttpError::for_bad_request(
                    Some("InvalidSignature".to_string()),
                    err.to_string(),
                )
            }
            SignatureError::Unauthorized(_) => HttpError::for_client_error(
                Some("UnauthorizedPeer".to_string()),
                StatusCode::FORBIDDEN,
                err.to_string(),
            ),
            SignatureError::NoPendingDocument(_) => {
                HttpError::for_not_found(None, err.to_string())
            }
        }
    }
}
