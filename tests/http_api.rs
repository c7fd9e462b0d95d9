// tests/http_api.rs
//! End-to-end tests over the HTTP surface, including a two-server chain
//! exercising the upstream proxy over real sockets.

mod common;

use common::{opaque_digest, sha256_hex};
use granary::server::{create_router, ServerState};
use granary::ServerConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

async fn spawn_server(
    dir: &Path,
    max_size_bytes: i64,
    upstream_url: Option<String>,
) -> (SocketAddr, Arc<ServerState>) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        dir: dir.to_path_buf(),
        max_size_bytes,
        upstream_url,
        upstream_timeout: Duration::from_secs(5),
    };
    let state = Arc::new(ServerState::new(config).unwrap());
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn blob_url(addr: SocketAddr, kind: &str, digest: &str) -> String {
    format!("http://{addr}/{kind}/{digest}")
}

#[tokio::test]
async fn test_put_get_head_round_trip() {
    let dir = tempdir().unwrap();
    let (addr, _state) = spawn_server(dir.path(), 1024, None).await;
    let client = reqwest::Client::new();
    let digest = sha256_hex(b"hello cache");

    let response = client
        .put(blob_url(addr, "cas", &digest))
        .body(&b"hello cache"[..])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = client
        .get(blob_url(addr, "cas", &digest))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.content_length(), Some(11));
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"hello cache");

    let response = client
        .head(blob_url(addr, "cas", &digest))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.content_length(), Some(11));
}

#[tokio::test]
async fn test_missing_blob_is_404() {
    let dir = tempdir().unwrap();
    let (addr, _state) = spawn_server(dir.path(), 1024, None).await;
    let client = reqwest::Client::new();

    let response = client
        .get(blob_url(addr, "cas", &opaque_digest('a')))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = client
        .head(blob_url(addr, "ac", &opaque_digest('b')))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_requests() {
    let dir = tempdir().unwrap();
    let (addr, _state) = spawn_server(dir.path(), 1024, None).await;
    let client = reqwest::Client::new();

    // Bad digest
    let response = client
        .get(blob_url(addr, "cas", "feed"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Unknown keyspace
    let response = client
        .get(blob_url(addr, "chunks", &opaque_digest('c')))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // CAS upload whose bytes do not hash to the key
    let response = client
        .put(blob_url(addr, "cas", &opaque_digest('0')))
        .body(&b"not the preimage"[..])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oversized_upload_is_507() {
    let dir = tempdir().unwrap();
    let (addr, _state) = spawn_server(dir.path(), 8, None).await;
    let client = reqwest::Client::new();
    let digest = sha256_hex(b"far too large");

    let response = client
        .put(blob_url(addr, "cas", &digest))
        .body(&b"far too large"[..])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INSUFFICIENT_STORAGE);
}

#[tokio::test]
async fn test_status_page() {
    let dir = tempdir().unwrap();
    let (addr, _state) = spawn_server(dir.path(), 1024, None).await;
    let client = reqwest::Client::new();
    let digest = sha256_hex(b"counted");

    client
        .put(blob_url(addr, "cas", &digest))
        .body(&b"counted"[..])
        .send()
        .await
        .unwrap();
    client
        .get(blob_url(addr, "cas", &digest))
        .send()
        .await
        .unwrap();
    client
        .get(blob_url(addr, "cas", &opaque_digest('d')))
        .send()
        .await
        .unwrap();

    let status: serde_json::Value = client
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(status["curr_size"], 7);
    assert_eq!(status["max_size"], 1024);
    assert_eq!(status["num_files"], 1);
    assert_eq!(status["disk_cache_hits"], 1);
    assert_eq!(status["disk_cache_misses"], 1);
}

#[tokio::test]
async fn test_stale_action_result_is_suppressed() {
    use granary::cache::proto::{ActionResult, Digest, OutputFile};
    use prost::Message;

    let dir = tempdir().unwrap();
    let (addr, _state) = spawn_server(dir.path(), 4096, None).await;
    let client = reqwest::Client::new();

    let result = ActionResult {
        output_files: vec![OutputFile {
            path: "bazel-out/lib.o".into(),
            digest: Some(Digest {
                hash: sha256_hex(b"object code"),
                size_bytes: 11,
            }),
            ..Default::default()
        }],
        ..Default::default()
    };
    let key = opaque_digest('a');
    let response = client
        .put(blob_url(addr, "ac", &key))
        .body(result.encode_to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // Referenced CAS blob is absent: the result must read as a miss.
    let response = client.get(blob_url(addr, "ac", &key)).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // Upload the referent and the same read succeeds.
    client
        .put(blob_url(addr, "cas", &sha256_hex(b"object code")))
        .body(&b"object code"[..])
        .send()
        .await
        .unwrap();
    let response = client.get(blob_url(addr, "ac", &key)).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.bytes().await.unwrap(),
        result.encode_to_vec()
    );
}

#[tokio::test]
async fn test_chained_servers_read_and_write_through() {
    let upstream_dir = tempdir().unwrap();
    let (upstream_addr, _upstream_state) = spawn_server(upstream_dir.path(), 4096, None).await;

    let local_dir = tempdir().unwrap();
    let (local_addr, _local_state) = spawn_server(
        local_dir.path(),
        4096,
        Some(format!("http://{upstream_addr}")),
    )
    .await;

    let client = reqwest::Client::new();

    // Seed only the upstream.
    let fetched = sha256_hex(b"upstream blob");
    client
        .put(blob_url(upstream_addr, "cas", &fetched))
        .body(&b"upstream blob"[..])
        .send()
        .await
        .unwrap();

    // Read-through: the local server fetches, commits, and serves.
    let response = client
        .get(blob_url(local_addr, "cas", &fetched))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"upstream blob");

    // Write-through: a local upload propagates to the upstream.
    let pushed = sha256_hex(b"local blob");
    client
        .put(blob_url(local_addr, "cas", &pushed))
        .body(&b"local blob"[..])
        .send()
        .await
        .unwrap();

    let mut propagated = false;
    for _ in 0..200 {
        let response = client
            .head(blob_url(upstream_addr, "cas", &pushed))
            .send()
            .await
            .unwrap();
        if response.status() == reqwest::StatusCode::OK {
            propagated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(propagated, "write-through upload never reached the upstream");
}
