//! Client-side tests against a canned provider: budget enforcement has to
//! hold even when the server misbehaves.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;

use paygate_core::testing::MemoryWallet;
use paygate_core::WalletCapability;
use paygate_stream::{StreamClient, StreamEvent};

fn sse_frame(event: &StreamEvent) -> String {
    format!("data: {}\n\n", serde_json::to_string(event).unwrap())
}

/// Serve one canned SSE response on a loopback socket. The first
/// connection gets the frames; any later connection (proof submissions)
/// gets an empty 200.
async fn serve_canned(frames: String) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut first = true;
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            // Drain the request head before answering.
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let Ok(n) = sock.read(&mut buf).await else {
                    break;
                };
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let response = if first {
                first = false;
                format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{frames}"
                )
            } else {
                "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}".to_string()
            };
            let _ = sock.write_all(response.as_bytes()).await;
        }
    });
    addr
}

#[tokio::test]
async fn test_absurd_invoice_amount_is_skipped_not_paid() {
    let _ = tracing_subscriber::fmt::try_init();
    let wallet = MemoryWallet::new(100);

    // Two invoices the wallet could genuinely pay. The second is
    // advertised at an absurd price; the client must go by the advertised
    // amount and never touch it, even though the sum `6 + u64::MAX`
    // overflows a u64.
    let honest = wallet.create_invoice(6, "batch 1", 600).await.unwrap();
    let inflated = wallet.create_invoice(5, "batch 2", 600).await.unwrap();

    let frames: String = [
        StreamEvent::Session {
            session_id: "canned".into(),
        },
        StreamEvent::Content {
            tokens: "alpha ".into(),
            batch_index: 1,
            token_count: 1,
        },
        StreamEvent::Invoice {
            invoice: honest.bolt11.clone(),
            payment_hash: hex::encode(honest.payment_hash),
            batch_index: 1,
            sats: 6,
        },
        StreamEvent::Content {
            tokens: "beta ".into(),
            batch_index: 2,
            token_count: 1,
        },
        StreamEvent::Invoice {
            invoice: inflated.bolt11.clone(),
            payment_hash: hex::encode(inflated.payment_hash),
            batch_index: 2,
            sats: u64::MAX,
        },
        StreamEvent::Content {
            tokens: "gamma ".into(),
            batch_index: 3,
            token_count: 1,
        },
        StreamEvent::Done {
            reason: paygate_stream::DoneReason::Complete,
            total_batches: 3,
            total_sats: 6,
            total_tokens: 3,
        },
    ]
    .iter()
    .map(sse_frame)
    .collect();

    let addr = serve_canned(frames).await;
    let client = StreamClient::new(Arc::new(wallet.clone()));
    let mut stream = client.stream(
        &format!("http://{addr}/api/stream"),
        serde_json::json!({}),
        50,
    );

    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk.unwrap());
    }

    // The stream survives the over-priced invoice and only the honest one
    // was paid.
    assert_eq!(text, "alpha beta gamma ");
    assert_eq!(wallet.balance_sats().await.unwrap(), 94);
}
