//! Provider loop tests: batch gating, the dual confirmation channels,
//! pause-and-resume bookkeeping, and terminal events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use paygate_core::hashes::parse_hash32;
use paygate_core::testing::MemoryWallet;
use paygate_core::WalletCapability;
use paygate_stream::{DoneReason, SessionStore, StreamConfig, StreamEvent, StreamProvider};

fn provider(
    wallet: &MemoryWallet,
    config: StreamConfig,
) -> StreamProvider {
    let _ = tracing_subscriber::fmt::try_init();
    StreamProvider::new(
        Arc::new(wallet.clone()),
        SessionStore::new(Duration::from_secs(60)),
        config,
    )
}

fn words(text: &str) -> impl tokio_stream::Stream<Item = Result<String, anyhow::Error>> + Unpin {
    let tokens: Vec<Result<String, anyhow::Error>> = text
        .split_whitespace()
        .map(|w| Ok(format!("{w} ")))
        .collect();
    tokio_stream::iter(tokens)
}

fn repeated_words(count: usize) -> impl tokio_stream::Stream<Item = Result<String, anyhow::Error>> + Unpin {
    tokio_stream::iter((0..count).map(|i| Ok(format!("w{i} "))).collect::<Vec<_>>())
}

async fn collect_all(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_single_batch_cap_never_asks_for_payment() {
    let wallet = MemoryWallet::new(0);
    let provider = provider(
        &wallet,
        StreamConfig {
            tokens_per_batch: 50,
            max_batches: 1,
            ..StreamConfig::default()
        },
    );

    let events = collect_all(provider.open(repeated_words(200))).await;

    assert!(matches!(events[0], StreamEvent::Session { .. }));
    match &events[1] {
        StreamEvent::Content {
            batch_index,
            token_count,
            ..
        } => {
            assert_eq!(*batch_index, 1);
            assert_eq!(*token_count, 50);
        }
        other => panic!("expected content, got {other:?}"),
    }
    match &events[2] {
        StreamEvent::Done {
            reason,
            total_batches,
            total_sats,
            ..
        } => {
            assert_eq!(*reason, DoneReason::MaxBatches);
            assert_eq!(*total_batches, 1);
            assert_eq!(*total_sats, 0);
        }
        other => panic!("expected done, got {other:?}"),
    }
    assert_eq!(events.len(), 3);
    assert!(
        !events.iter().any(|e| matches!(e, StreamEvent::Invoice { .. })),
        "a capped single batch must never be gated"
    );
}

#[tokio::test]
async fn test_first_batch_free_gates_only_from_batch_two() {
    let wallet = MemoryWallet::new(0);
    let provider = provider(
        &wallet,
        StreamConfig {
            tokens_per_batch: 5,
            max_batches: 10,
            first_batch_free: true,
            sats_per_batch: 10,
            payment_timeout: Duration::from_millis(200),
            ..StreamConfig::default()
        },
    );

    let mut rx = provider.open(repeated_words(20));
    let mut saw_batches_before_invoice = Vec::new();
    let mut saw_invoice = false;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Content { batch_index, .. } => {
                saw_batches_before_invoice.push(batch_index)
            }
            StreamEvent::Invoice { batch_index, .. } => {
                assert!(batch_index >= 2, "no invoice before batch 2");
                saw_invoice = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_invoice, "batch 2 must be gated");
    assert_eq!(saw_batches_before_invoice, vec![1, 2]);
}

#[tokio::test]
async fn test_wallet_settlement_unlocks_batch() {
    let wallet = MemoryWallet::new(0);
    let provider = provider(
        &wallet,
        StreamConfig {
            tokens_per_batch: 5,
            max_batches: 2,
            sats_per_batch: 10,
            payment_timeout: Duration::from_secs(5),
            ..StreamConfig::default()
        },
    );

    let mut rx = provider.open(repeated_words(10));
    let mut contents = 0;
    let mut done = None;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Content { .. } => contents += 1,
            StreamEvent::Invoice { payment_hash, .. } => {
                // Settle directly in the wallet; no proof POST involved.
                let hash = parse_hash32(&payment_hash).unwrap();
                wallet.settle(&hash);
            }
            StreamEvent::Done {
                reason, total_sats, ..
            } => {
                done = Some((reason, total_sats));
            }
            _ => {}
        }
    }

    assert_eq!(contents, 2);
    assert_eq!(done, Some((DoneReason::MaxBatches, 10)));
}

#[tokio::test]
async fn test_proof_submission_unlocks_batch_and_counts_sats_once() {
    let wallet = MemoryWallet::new(0);
    let provider = provider(
        &wallet,
        StreamConfig {
            tokens_per_batch: 5,
            max_batches: 2,
            sats_per_batch: 10,
            payment_timeout: Duration::from_secs(5),
            ..StreamConfig::default()
        },
    );
    let store = provider.store().clone();

    let mut rx = provider.open(repeated_words(10));
    let mut session_id = String::new();
    let mut done_totals = None;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Session { session_id: id } => session_id = id,
            StreamEvent::Invoice { payment_hash, .. } => {
                let hash = parse_hash32(&payment_hash).unwrap();
                let preimage = wallet.issued_preimage(&hash).unwrap();
                // Fire both channels: the proof wins or the wallet does,
                // and the totals must not double-count either way.
                wallet.settle(&hash);
                store
                    .submit_proof(&session_id, &hex::encode(preimage))
                    .unwrap();
            }
            StreamEvent::Done { total_sats, .. } => done_totals = Some(total_sats),
            _ => {}
        }
    }

    assert_eq!(done_totals, Some(10), "one gated batch, counted once");
    let session = store.get(&session_id).expect("inside grace window");
    let session = session.lock().unwrap();
    assert!(session.paid.contains(&1));
    assert!(session.closed);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_pauses_and_late_proof_still_lands() {
    let wallet = MemoryWallet::new(0);
    let store = SessionStore::new(Duration::from_secs(60));
    let provider = StreamProvider::new(
        Arc::new(wallet.clone()),
        store.clone(),
        StreamConfig {
            tokens_per_batch: 5,
            max_batches: 10,
            sats_per_batch: 10,
            payment_timeout: Duration::from_secs(2),
            ..StreamConfig::default()
        },
    );

    let mut rx = provider.open(repeated_words(20));
    let mut session_id = String::new();
    let mut invoice_hash = None;
    let mut paused = None;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Session { session_id: id } => session_id = id,
            StreamEvent::Invoice { payment_hash, .. } => {
                invoice_hash = Some(parse_hash32(&payment_hash).unwrap());
            }
            StreamEvent::Content { .. } => {}
            StreamEvent::Paused {
                reason,
                batch_index,
                total_sats,
                ..
            } => {
                paused = Some((reason, batch_index, total_sats));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(paused, Some(("payment_timeout".to_string(), 1, 0)));

    // The session is paused, not closed, so a late proof is accepted.
    let session = store.get(&session_id).expect("session retained");
    assert!(!session.lock().unwrap().closed);

    let hash = invoice_hash.unwrap();
    let preimage = wallet.issued_preimage(&hash).unwrap();
    let batch = store.submit_proof(&session_id, &hex::encode(preimage)).unwrap();
    assert_eq!(batch, 1);
    assert!(session.lock().unwrap().paid.contains(&1));

    // After the grace window the session is gone and the proof bounces.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(store.get(&session_id).is_none());
    assert!(store
        .submit_proof(&session_id, &hex::encode(preimage))
        .is_err());
}

#[tokio::test]
async fn test_producer_exhaustion_flushes_partial_batch() {
    let wallet = MemoryWallet::new(0);
    let provider = provider(
        &wallet,
        StreamConfig {
            tokens_per_batch: 50,
            max_batches: 10,
            first_batch_free: true,
            ..StreamConfig::default()
        },
    );

    let events = collect_all(provider.open(repeated_words(70))).await;

    let contents: Vec<(u32, u32)> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Content {
                batch_index,
                token_count,
                ..
            } => Some((*batch_index, *token_count)),
            _ => None,
        })
        .collect();
    assert_eq!(contents, vec![(1, 50), (2, 20)]);

    match events.last().unwrap() {
        StreamEvent::Done {
            reason,
            total_batches,
            total_tokens,
            ..
        } => {
            assert_eq!(*reason, DoneReason::Complete);
            assert_eq!(*total_batches, 2);
            assert_eq!(*total_tokens, 70);
        }
        other => panic!("expected done, got {other:?}"),
    }
}

#[tokio::test]
async fn test_producer_error_ends_stream_with_error_event() {
    let wallet = MemoryWallet::new(0);
    let provider = provider(
        &wallet,
        StreamConfig {
            tokens_per_batch: 5,
            first_batch_free: true,
            ..StreamConfig::default()
        },
    );

    let tokens: Vec<Result<String, anyhow::Error>> = vec![
        Ok("one ".into()),
        Err(anyhow::anyhow!("upstream generator crashed")),
    ];
    let events = collect_all(provider.open(tokio_stream::iter(tokens))).await;

    match events.last().unwrap() {
        StreamEvent::Error { message } => {
            assert!(message.contains("upstream generator crashed"));
        }
        other => panic!("expected error event, got {other:?}"),
    }
    // The partial buffer is dropped on error; only terminal events follow.
    assert!(
        !events.iter().any(|e| matches!(e, StreamEvent::Done { .. })),
        "an errored stream must not also report success"
    );
}

#[tokio::test]
async fn test_session_text_tokenization_round_trip() {
    let wallet = MemoryWallet::new(0);
    let provider = provider(
        &wallet,
        StreamConfig {
            tokens_per_batch: 3,
            max_batches: 1,
            ..StreamConfig::default()
        },
    );

    let mut rx = provider.open(words("alpha beta gamma delta"));
    let mut text = String::new();
    while let Some(event) = rx.recv().await {
        if let StreamEvent::Content { tokens, .. } = event {
            text.push_str(&tokens);
        }
    }
    assert_eq!(text.trim_end(), "alpha beta gamma");
}
