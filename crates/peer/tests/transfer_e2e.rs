//! End-to-end transfer tests.
//!
//! Two [`TransferEngine`]s talk over an in-memory channel pair standing in
//! for the WebRTC data channel. A tap on the sender-to-receiver direction
//! can drop messages or take the link down to simulate failures.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peer::network::DataChannel;
use peer::{EngineSettings, OutgoingFile, Transfer, TransferEngine, TransferStatus};
use protocol::error::{ProtocolError, Result};
use protocol::ControlMessage;
use tempfile::TempDir;
use tokio::sync::mpsc;

const A: &str = "aaa";
const B: &str = "bbb";

// =============================================================================
// In-memory channel pair
// =============================================================================

struct MemoryChannel {
    open: Arc<AtomicBool>,
    outbox: mpsc::UnboundedSender<String>,
}

impl DataChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text<'a>(
        &'a self,
        text: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(ProtocolError::ConnectionClosed("link down".to_string()));
            }
            self.outbox
                .send(text)
                .map_err(|_| ProtocolError::ConnectionClosed("link down".to_string()))
        })
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        self.open.store(false, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// What the tap does with a message travelling from A to B.
#[derive(Debug, Clone, Copy, PartialEq)]
enum TapAction {
    Forward,
    Drop,
    /// Drop the message and take the link down.
    Disconnect,
}

type Tap = Box<dyn Fn(&ControlMessage) -> TapAction + Send + Sync>;

struct Pair {
    a: TransferEngine,
    b: TransferEngine,
    a_to_b: Arc<dyn DataChannel>,
    open: Arc<AtomicBool>,
}

fn connect(settings_a: EngineSettings, settings_b: EngineSettings, tap: Option<Tap>) -> Pair {
    let a = TransferEngine::new(settings_a);
    let b = TransferEngine::new(settings_b);
    let open = Arc::new(AtomicBool::new(true));

    let (a_tx, mut a_rx) = mpsc::unbounded_channel::<String>();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel::<String>();
    let a_to_b: Arc<dyn DataChannel> = Arc::new(MemoryChannel {
        open: open.clone(),
        outbox: a_tx,
    });
    let b_to_a: Arc<dyn DataChannel> = Arc::new(MemoryChannel {
        open: open.clone(),
        outbox: b_tx,
    });

    {
        let b = b.clone();
        let b_to_a = b_to_a.clone();
        let open = open.clone();
        tokio::spawn(async move {
            while let Some(text) = a_rx.recv().await {
                if let (Some(tap), Ok(message)) = (&tap, ControlMessage::from_json(&text)) {
                    match tap(&message) {
                        TapAction::Forward => {}
                        TapAction::Drop => continue,
                        TapAction::Disconnect => {
                            open.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
                b.handle_message(A, b_to_a.clone(), &text).await;
            }
        });
    }
    {
        let a = a.clone();
        let a_to_b = a_to_b.clone();
        tokio::spawn(async move {
            while let Some(text) = b_rx.recv().await {
                a.handle_message(B, a_to_b.clone(), &text).await;
            }
        });
    }

    Pair { a, b, a_to_b, open }
}

fn is_chunk(message: &ControlMessage, index: u32) -> bool {
    matches!(message, ControlMessage::FileChunk(c) if c.chunk_index == index)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Waits until the transfer `id` satisfies `pred`.
async fn wait_for(
    engine: &TransferEngine,
    id: &str,
    pred: impl Fn(&Transfer) -> bool,
) -> Transfer {
    let mut snapshots = engine.subscribe();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let found = snapshots
                .borrow_and_update()
                .iter()
                .find(|t| t.id == id && pred(t))
                .cloned();
            if let Some(transfer) = found {
                return transfer;
            }
            snapshots.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("transfer {} never reached the expected state", id))
}

fn small_chunks() -> EngineSettings {
    EngineSettings {
        chunk_size: 1024,
        ack_window: 1,
        ..EngineSettings::default()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_three_chunk_file_completes_on_both_sides() {
    let pair = connect(EngineSettings::default(), EngineSettings::default(), None);
    let data = pattern(150_000);

    let id = pair.a.send_file(
        B,
        pair.a_to_b.clone(),
        OutgoingFile::from_bytes("photo.jpg", "image/jpeg", data.clone()),
    );

    let sent = wait_for(&pair.a, &id, |t| t.status == TransferStatus::Completed).await;
    assert_eq!(sent.total_chunks, 3);
    assert_eq!(sent.progress, 1.0);

    let received = wait_for(&pair.b, &id, |t| t.status == TransferStatus::Completed).await;
    assert_eq!(received.total_chunks, 3);
    assert_eq!(received.chunks_done, 3);
    assert_eq!(received.progress, 1.0);
    assert_eq!(received.peer_id, A);
    assert_eq!(received.file_type, "image/jpeg");

    let dir = TempDir::new().unwrap();
    let path = pair.b.save_completed(&id, dir.path()).await.unwrap();
    assert_eq!(path, dir.path().join("photo.jpg"));
    assert_eq!(std::fs::read(path).unwrap(), data);
}

#[tokio::test]
async fn test_compressed_file_from_disk() {
    let pair = connect(
        EngineSettings {
            use_compression: true,
            chunk_size: 4096,
            ..EngineSettings::default()
        },
        EngineSettings::default(),
        None,
    );

    let dir = TempDir::new().unwrap();
    let source = dir.path().join("notes.txt");
    let data = b"dropwire ".repeat(5000);
    std::fs::write(&source, &data).unwrap();

    let file = OutgoingFile::from_path(&source).await.unwrap();
    let id = pair.a.send_file(B, pair.a_to_b.clone(), file);

    let received = wait_for(&pair.b, &id, |t| t.status == TransferStatus::Completed).await;
    assert!(received.use_compression);
    assert_eq!(received.total_chunks, 11);

    let out = dir.path().join("out");
    let path = pair.b.save_completed(&id, &out).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), data);
    wait_for(&pair.a, &id, |t| t.status == TransferStatus::Completed).await;
}

#[tokio::test]
async fn test_zero_byte_file() {
    let pair = connect(EngineSettings::default(), EngineSettings::default(), None);

    let id = pair.a.send_file(
        B,
        pair.a_to_b.clone(),
        OutgoingFile::from_bytes("empty.txt", "text/plain", Vec::new()),
    );

    let sent = wait_for(&pair.a, &id, |t| t.status == TransferStatus::Completed).await;
    assert_eq!(sent.total_chunks, 0);
    let received = wait_for(&pair.b, &id, |t| t.status == TransferStatus::Completed).await;
    assert_eq!(received.progress, 1.0);

    let dir = TempDir::new().unwrap();
    let path = pair.b.save_completed(&id, dir.path()).await.unwrap();
    assert!(std::fs::read(path).unwrap().is_empty());
}

#[tokio::test]
async fn test_link_down_mid_transfer_fails_sender() {
    let settings = EngineSettings {
        ack_timeout: Duration::from_millis(300),
        ..EngineSettings::default()
    };
    let tap: Tap = Box::new(|m| {
        if is_chunk(m, 1) {
            TapAction::Disconnect
        } else {
            TapAction::Forward
        }
    });
    let pair = connect(settings, EngineSettings::default(), Some(tap));

    let id = pair.a.send_file(
        B,
        pair.a_to_b.clone(),
        OutgoingFile::from_bytes("photo.jpg", "image/jpeg", pattern(150_000)),
    );

    let failed = wait_for(&pair.a, &id, |t| t.status == TransferStatus::Error).await;
    assert!(failed.is_connectivity_error(), "error was {:?}", failed.error);
    assert!(!pair.open.load(Ordering::SeqCst));

    let partial = pair.b.get(&id).unwrap();
    assert_eq!(partial.chunks_done, 1);
    assert_ne!(partial.status, TransferStatus::Completed);
}

#[tokio::test]
async fn test_sender_ack_timeout_stops_receiver() {
    let settings = EngineSettings {
        ack_timeout: Duration::from_millis(200),
        ..EngineSettings::default()
    };
    // Chunk 1 is lost while the link stays up.
    let tap: Tap = Box::new(|m| {
        if is_chunk(m, 1) {
            TapAction::Drop
        } else {
            TapAction::Forward
        }
    });
    let pair = connect(settings, EngineSettings::default(), Some(tap));

    let id = pair.a.send_file(
        B,
        pair.a_to_b.clone(),
        OutgoingFile::from_bytes("photo.jpg", "image/jpeg", pattern(150_000)),
    );

    let sent = wait_for(&pair.a, &id, |t| t.status == TransferStatus::Error).await;
    assert_eq!(
        sent.error.as_deref(),
        Some("timed out waiting for chunk acknowledgment (connection may be lost)")
    );

    let received = wait_for(&pair.b, &id, |t| t.status == TransferStatus::Error).await;
    assert_eq!(received.error.as_deref(), Some("transfer cancelled by peer"));
    assert_eq!(received.chunks_done, 2);
    assert!(pair.open.load(Ordering::SeqCst));

    let dir = TempDir::new().unwrap();
    assert!(pair.b.save_completed(&id, dir.path()).await.is_err());
}

#[tokio::test]
async fn test_peer_loss_fails_transfers_without_waiting_for_timeout() {
    let settings = EngineSettings {
        ack_timeout: Duration::from_secs(60),
        ..EngineSettings::default()
    };
    // The receiver goes silent after the first chunk.
    let tap: Tap = Box::new(|m| {
        if matches!(m, ControlMessage::FileChunk(c) if c.chunk_index >= 1) {
            TapAction::Drop
        } else {
            TapAction::Forward
        }
    });
    let pair = connect(settings, EngineSettings::default(), Some(tap));

    let id = pair.a.send_file(
        B,
        pair.a_to_b.clone(),
        OutgoingFile::from_bytes("photo.jpg", "image/jpeg", pattern(150_000)),
    );
    wait_for(&pair.b, &id, |t| t.chunks_done == 1).await;

    assert_eq!(pair.a.fail_peer(B, "peer disconnected"), 1);

    let failed = wait_for(&pair.a, &id, |t| t.status == TransferStatus::Error).await;
    assert_eq!(failed.error.as_deref(), Some("connection lost: peer disconnected"));
    assert!(failed.is_connectivity_error());
}

#[tokio::test]
async fn test_pause_halts_and_resume_finishes() {
    let pair = connect(small_chunks(), EngineSettings::default(), None);
    let data = pattern(64 * 1024);

    let id = pair.a.send_file(
        B,
        pair.a_to_b.clone(),
        OutgoingFile::from_bytes("big.bin", "application/octet-stream", data.clone()),
    );
    wait_for(&pair.b, &id, |t| t.chunks_done >= 2).await;

    pair.a.pause(&id).await.unwrap();
    assert_eq!(pair.a.get(&id).unwrap().status, TransferStatus::Paused);
    wait_for(&pair.b, &id, |t| t.status == TransferStatus::Paused).await;

    // At most the chunk already in flight lands after the pause.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let halted = pair.b.get(&id).unwrap().chunks_done;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pair.b.get(&id).unwrap().chunks_done, halted);
    assert!(halted < 64);

    pair.a.resume(&id).await.unwrap();
    let received = wait_for(&pair.b, &id, |t| t.status == TransferStatus::Completed).await;
    assert_eq!(received.chunks_done, 64);
    wait_for(&pair.a, &id, |t| t.status == TransferStatus::Completed).await;

    let dir = TempDir::new().unwrap();
    let path = pair.b.save_completed(&id, dir.path()).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), data);
}

#[tokio::test]
async fn test_cancel_stops_both_sides() {
    let pair = connect(small_chunks(), EngineSettings::default(), None);

    let id = pair.a.send_file(
        B,
        pair.a_to_b.clone(),
        OutgoingFile::from_bytes("big.bin", "application/octet-stream", pattern(50 * 1024)),
    );
    wait_for(&pair.b, &id, |t| t.chunks_done >= 2).await;

    pair.a.cancel(&id).await.unwrap();

    let sender = pair.a.get(&id).unwrap();
    assert_eq!(sender.status, TransferStatus::Error);
    assert_eq!(sender.error.as_deref(), Some("transfer cancelled"));

    let receiver = wait_for(&pair.b, &id, |t| t.status == TransferStatus::Error).await;
    assert_eq!(receiver.error.as_deref(), Some("transfer cancelled by peer"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stopped = pair.b.get(&id).unwrap().chunks_done;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pair.b.get(&id).unwrap().chunks_done, stopped);
    assert!(stopped < 50);
}

#[tokio::test]
async fn test_receiver_rejects_offer() {
    let pair = connect(
        EngineSettings::default(),
        EngineSettings {
            auto_accept: false,
            ..EngineSettings::default()
        },
        None,
    );

    let id = pair.a.send_file(
        B,
        pair.a_to_b.clone(),
        OutgoingFile::from_bytes("a.txt", "text/plain", b"hello".to_vec()),
    );
    let pending = wait_for(&pair.b, &id, |t| t.status == TransferStatus::Pending).await;
    assert_eq!(pending.file_name, "a.txt");

    pair.b.reject(&id).await.unwrap();

    let rejected = wait_for(&pair.a, &id, |t| t.status == TransferStatus::Error).await;
    assert_eq!(rejected.error.as_deref(), Some("transfer rejected by peer"));
    assert!(!rejected.is_connectivity_error());
}

#[tokio::test]
async fn test_progress_is_monotone() {
    let pair = connect(small_chunks(), EngineSettings::default(), None);

    let mut snapshots = pair.a.subscribe();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let id = pair.a.send_file(
        B,
        pair.a_to_b.clone(),
        OutgoingFile::from_bytes("big.bin", "application/octet-stream", pattern(30 * 1024)),
    );

    tokio::time::timeout(Duration::from_secs(10), {
        let observed = observed.clone();
        let id = id.clone();
        async move {
            loop {
                snapshots.changed().await.unwrap();
                let current = snapshots
                    .borrow_and_update()
                    .iter()
                    .find(|t| t.id == id)
                    .cloned();
                if let Some(t) = current {
                    observed.lock().unwrap().push(t.progress);
                    if t.status == TransferStatus::Completed {
                        break;
                    }
                }
            }
        }
    })
    .await
    .unwrap();

    let observed = observed.lock().unwrap();
    assert!(observed.len() >= 2);
    assert!(observed.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(observed.last().copied(), Some(1.0));
}
