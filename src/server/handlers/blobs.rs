// src/server/handlers/blobs.rs
//! Blob endpoints - the cache wire surface
//!
//! `GET`/`PUT`/`HEAD` on `/{kind}/{digest}` where kind is `cas`, `ac` or
//! `raw`. Uploads stream the request body straight into the engine with
//! `Content-Length` as the declared size; downloads stream the blob file
//! back. Action cache reads only answer after the referenced CAS blobs
//! have been verified present, so clients never act on a stale result.

use crate::cache::{is_valid_digest, EntryKind};
use crate::error::CacheError;
use crate::server::ServerState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::io::{ReaderStream, StreamReader};

/// GET /{kind}/{digest}
///
/// Serves a blob. Returns:
/// - 200 OK with the blob body and Content-Length
/// - 404 Not Found on a miss (or a stale action result)
/// - 400 Bad Request for a malformed digest
pub async fn get_blob(
    State(state): State<Arc<ServerState>>,
    Path((kind, digest)): Path<(String, String)>,
) -> Response {
    let Ok(kind) = kind.parse::<EntryKind>() else {
        return (StatusCode::NOT_FOUND, "unknown keyspace").into_response();
    };
    if !is_valid_digest(&digest) {
        return (StatusCode::BAD_REQUEST, "invalid digest format").into_response();
    }

    if kind == EntryKind::Ac {
        return get_action_result(&state, &digest).await;
    }

    match state.cache.get(kind, &digest).await {
        Ok(Some((file, size))) => {
            state.metrics.record_hit();
            state.metrics.record_bytes_served(size as u64);
            blob_response(Body::from_stream(ReaderStream::new(file)), size)
        }
        Ok(None) => {
            state.metrics.record_miss();
            (StatusCode::NOT_FOUND, "blob not found").into_response()
        }
        Err(err) => {
            state.metrics.record_miss();
            read_error_response(&kind, &digest, err)
        }
    }
}

/// Serve an action result only if all of its referenced CAS blobs are
/// still present locally.
async fn get_action_result(state: &ServerState, digest: &str) -> Response {
    match state.cache.get_validated_action_result(digest).await {
        Ok(Some((_, payload))) => {
            state.metrics.record_hit();
            state.metrics.record_bytes_served(payload.len() as u64);
            let size = payload.len() as i64;
            blob_response(Body::from(payload), size)
        }
        Ok(None) => {
            state.metrics.record_miss();
            (StatusCode::NOT_FOUND, "action result not found").into_response()
        }
        Err(err) => {
            state.metrics.record_miss();
            read_error_response(&EntryKind::Ac, digest, err)
        }
    }
}

/// PUT /{kind}/{digest}
///
/// Stores a blob. The Content-Length header is the declared size and is
/// required. Returns:
/// - 200 OK once the blob is committed
/// - 400 Bad Request on digest/hash/size errors
/// - 411 Length Required without a Content-Length
/// - 507 Insufficient Storage when the blob exceeds the cache budget
pub async fn put_blob(
    State(state): State<Arc<ServerState>>,
    Path((kind, digest)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Ok(kind) = kind.parse::<EntryKind>() else {
        return (StatusCode::NOT_FOUND, "unknown keyspace").into_response();
    };
    if !is_valid_digest(&digest) {
        return (StatusCode::BAD_REQUEST, "invalid digest format").into_response();
    }
    let Some(size) = content_length(&headers) else {
        return (StatusCode::LENGTH_REQUIRED, "Content-Length required").into_response();
    };

    let reader = StreamReader::new(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed(),
    );
    match state.cache.put(kind, &digest, size, reader).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err @ CacheError::TooBig { .. }) => {
            (StatusCode::INSUFFICIENT_STORAGE, err.to_string()).into_response()
        }
        Err(
            err @ (CacheError::HashMismatch { .. }
            | CacheError::SizeMismatch { .. }
            | CacheError::InvalidDigest { .. }),
        ) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        Err(err) => {
            tracing::error!("failed to store {}/{}: {}", kind, digest, err);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to store blob").into_response()
        }
    }
}

/// HEAD /{kind}/{digest}
///
/// Existence check without transferring data. Reports Content-Length when
/// the size is known.
pub async fn head_blob(
    State(state): State<Arc<ServerState>>,
    Path((kind, digest)): Path<(String, String)>,
) -> Response {
    let Ok(kind) = kind.parse::<EntryKind>() else {
        return (StatusCode::NOT_FOUND, "unknown keyspace").into_response();
    };
    if !is_valid_digest(&digest) {
        return (StatusCode::BAD_REQUEST, "invalid digest format").into_response();
    }

    let (found, size) = state.cache.contains(kind, &digest).await;
    if !found {
        state.metrics.record_miss();
        return (StatusCode::NOT_FOUND, "blob not found").into_response();
    }
    state.metrics.record_hit();

    let mut response = Response::builder().status(StatusCode::OK);
    if size >= 0 {
        response = response.header(header::CONTENT_LENGTH, size);
    }
    response
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::empty())
        .unwrap()
}

fn content_length(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse::<i64>()
        .ok()
        .filter(|len| *len >= 0)
}

fn blob_response(body: Body, size: i64) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .body(body)
        .unwrap()
}

fn read_error_response(kind: &EntryKind, digest: &str, err: CacheError) -> Response {
    match err {
        // The upstream broke, not the client; the blob is simply not
        // servable right now.
        CacheError::Proxy { .. } => {
            tracing::warn!("read-through for {}/{} failed: {}", kind, digest, err);
            (StatusCode::NOT_FOUND, "blob not found").into_response()
        }
        _ => {
            tracing::error!("failed to read {}/{}: {}", kind, digest, err);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to read blob").into_response()
        }
    }
}
