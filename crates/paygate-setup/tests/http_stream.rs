//! Full-service tests: the HTTP API wired to an in-memory wallet, consumed
//! by the real stream client over a real socket.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use paygate_core::hashes::random_preimage;
use paygate_core::testing::MemoryWallet;
use paygate_core::WalletCapability;
use paygate_setup::events::ConsoleEmitter;
use paygate_setup::{router, AppState};
use paygate_stream::{SessionStore, StreamClient, StreamConfig};

async fn spawn_service(
    wallet: &MemoryWallet,
    sessions: SessionStore,
    config: StreamConfig,
) -> String {
    let _ = tracing_subscriber::fmt::try_init();
    let state = AppState {
        wallet: Arc::new(wallet.clone()),
        node: None,
        node_alias: "test-node".into(),
        emitter: Arc::new(ConsoleEmitter::new(None)),
        sessions,
        stream_config: config,
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_client_streams_and_pays_to_completion() {
    let wallet = MemoryWallet::new(1000);
    let base = spawn_service(
        &wallet,
        SessionStore::new(Duration::from_secs(60)),
        StreamConfig {
            sats_per_batch: 10,
            tokens_per_batch: 5,
            max_batches: 10,
            payment_timeout: Duration::from_secs(5),
            ..StreamConfig::default()
        },
    )
    .await;

    let text = "the quick brown fox jumps over the lazy dog again and again";
    let client = StreamClient::new(Arc::new(wallet.clone()));
    let mut stream = client.stream(
        &format!("{base}/api/stream"),
        serde_json::json!({ "text": text }),
        100,
    );

    let mut received = String::new();
    while let Some(chunk) = stream.next().await {
        received.push_str(&chunk.unwrap());
    }

    assert_eq!(received.trim_end(), text);
    // 12 tokens at 5 per batch: two gated batches paid, partial third free.
    assert_eq!(wallet.balance_sats().await.unwrap(), 1000 - 20);
}

#[tokio::test]
async fn test_client_over_budget_skips_payment_and_session_pauses() {
    let wallet = MemoryWallet::new(1000);
    let sessions = SessionStore::new(Duration::from_secs(60));
    let base = spawn_service(
        &wallet,
        sessions.clone(),
        StreamConfig {
            sats_per_batch: 20,
            tokens_per_batch: 5,
            max_batches: 10,
            ..StreamConfig::default()
        },
    )
    .await;

    let client = StreamClient::new(Arc::new(wallet.clone()));
    let mut stream = client.stream(
        &format!("{base}/api/stream"),
        serde_json::json!({
            "text": "one two three four five six seven eight nine ten",
            "payment_timeout_ms": 300,
        }),
        10,
    );

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }

    // Only the first batch arrives; the invoice for it was never paid, so
    // the provider paused and the stream ended.
    assert_eq!(chunks.len(), 1);
    assert_eq!(wallet.balance_sats().await.unwrap(), 1000, "nothing spent");

    // The paused session is retained with its gate still pending.
    assert_eq!(sessions.len(), 1);
}

#[tokio::test]
async fn test_proof_endpoint_distinguishes_failures() {
    let wallet = MemoryWallet::new(0);
    let sessions = SessionStore::new(Duration::from_secs(60));
    let base = spawn_service(&wallet, sessions.clone(), StreamConfig::default()).await;
    let http = reqwest::Client::new();

    // Unknown session with a well-formed preimage: 404.
    let resp = http
        .post(format!("{base}/api/stream/proof"))
        .json(&serde_json::json!({
            "session_id": "no-such-session",
            "preimage": hex::encode(random_preimage()),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    // Malformed preimage: 400.
    let resp = http
        .post(format!("{base}/api/stream/proof"))
        .json(&serde_json::json!({
            "session_id": "irrelevant",
            "preimage": "not-hex-at-all",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // Live session with nothing gated: 409.
    let session = sessions.create();
    let session_id = session.lock().unwrap().id.clone();
    let resp = http
        .post(format!("{base}/api/stream/proof"))
        .json(&serde_json::json!({
            "session_id": session_id,
            "preimage": hex::encode(random_preimage()),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_info_and_balance_endpoints() {
    let wallet = MemoryWallet::new(12_345);
    let base = spawn_service(
        &wallet,
        SessionStore::new(Duration::from_secs(60)),
        StreamConfig::default(),
    )
    .await;
    let http = reqwest::Client::new();

    let balance: serde_json::Value = http
        .get(format!("{base}/api/balance"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(balance["balance_sats"], 12_345);

    let info: serde_json::Value = http
        .get(format!("{base}/api/info"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["node_alias"], "test-node");
    assert!(info["node_id"].is_null(), "no embedded node in tests");
    assert_eq!(info["lightning_balance_sats"], 12_345);
    assert_eq!(info["active_sessions"], 0);
}
