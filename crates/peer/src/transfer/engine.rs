//! Transfer engine: chunked, encrypted, acknowledged file streaming.
//!
//! Every outgoing file runs as its own task:
//!
//! ```text
//! file-offer ──► await file-offer-ack ──► for each chunk:
//!                                           wait for ack window
//!                                           wait while paused
//!                                           read, compress, seal, send
//!                                           publish progress
//!                                         await remaining chunk-acks
//!                                         completed
//! ```
//!
//! Incoming messages are handled inline by [`TransferEngine::handle_message`].
//! Each transfer owns a [`CancellationToken`] and a pause `watch` channel so
//! every suspension point observes cancel and pause promptly.
//!
//! The transfer table sits behind a std mutex that is never held across an
//! await. Snapshots are published on a `watch` channel after every change.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use protocol::{
    bytes_through, chunk_count, chunk_range, ChunkAck, ChunkCodec, ControlAction, ControlMessage,
    FileChunk, FileOffer, FileOfferAck, TransferControl, DEFAULT_CHUNK_SIZE,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::storage::{self, ChunkReader};
use super::{generate_transfer_id, Transfer, TransferDirection, TransferStatus};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::network::DataChannel;

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub chunk_size: u32,
    /// Maximum number of sent but unacknowledged chunks.
    pub ack_window: u32,
    pub ack_timeout: Duration,
    pub offer_ack_timeout: Duration,
    pub use_compression: bool,
    /// Acknowledge incoming offers without waiting for [`TransferEngine::accept`].
    pub auto_accept: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_window: 4,
            ack_timeout: Duration::from_secs(15),
            offer_ack_timeout: Duration::from_secs(60),
            use_compression: false,
            auto_accept: true,
        }
    }
}

impl From<&TransferConfig> for EngineSettings {
    fn from(config: &TransferConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            ack_window: config.ack_window,
            ack_timeout: config.ack_timeout(),
            offer_ack_timeout: config.offer_ack_timeout(),
            use_compression: config.use_compression,
            auto_accept: config.auto_accept,
        }
    }
}

/// Where the bytes of an outgoing file come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Arc<[u8]>),
}

/// A file selected for sending.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub file_type: String,
    pub size: u64,
    pub source: FileSource,
}

impl OutgoingFile {
    /// Describes a file on disk, guessing its MIME type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(TransferError::Io(format!(
                "not a regular file: {}",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let file_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(Self {
            name,
            file_type,
            size: metadata.len(),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// Describes an in-memory buffer.
    pub fn from_bytes(
        name: impl Into<String>,
        file_type: impl Into<String>,
        data: impl Into<Arc<[u8]>>,
    ) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            file_type: file_type.into(),
            size: data.len() as u64,
            source: FileSource::Memory(data),
        }
    }

    async fn reader(&self) -> std::io::Result<ChunkReader> {
        match &self.source {
            FileSource::Path(path) => ChunkReader::open(path).await,
            FileSource::Memory(data) => Ok(ChunkReader::Memory(Arc::clone(data))),
        }
    }
}

/// Live state backing one transfer record.
struct Runtime {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    channel: Arc<dyn DataChannel>,
    offer_ack: Option<oneshot::Sender<()>>,
    acks: Option<mpsc::UnboundedSender<u32>>,
    chunks: BTreeMap<u32, Vec<u8>>,
    source: Option<OutgoingFile>,
}

impl Runtime {
    fn new(channel: Arc<dyn DataChannel>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            paused: watch::Sender::new(false),
            channel,
            offer_ack: None,
            acks: None,
            chunks: BTreeMap::new(),
            source: None,
        }
    }
}

struct Record {
    seq: u64,
    transfer: Transfer,
    runtime: Runtime,
}

#[derive(Default)]
struct Table {
    records: HashMap<String, Record>,
    next_seq: u64,
}

struct Inner {
    settings: EngineSettings,
    table: Mutex<Table>,
    snapshots: watch::Sender<Vec<Transfer>>,
}

/// Receiving ends owned by an outgoing transfer task.
struct OutgoingLink {
    channel: Arc<dyn DataChannel>,
    offer_ack: oneshot::Receiver<()>,
    acks: mpsc::UnboundedReceiver<u32>,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
}

/// Runs all transfers of one client.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

impl TransferEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                table: Mutex::new(Table::default()),
                snapshots: watch::Sender::new(Vec::new()),
            }),
        }
    }

    /// Subscribes to transfer list snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Transfer>> {
        self.inner.snapshots.subscribe()
    }

    /// Returns all transfers in creation order.
    pub fn transfers(&self) -> Vec<Transfer> {
        self.inner.snapshots.borrow().clone()
    }

    pub fn get(&self, id: &str) -> Option<Transfer> {
        self.table().records.get(id).map(|r| r.transfer.clone())
    }

    /// Returns the peer and source of an outgoing transfer, for retries.
    pub fn source_of(&self, id: &str) -> Option<(String, OutgoingFile)> {
        let table = self.table();
        let record = table.records.get(id)?;
        let source = record.runtime.source.clone()?;
        Some((record.transfer.peer_id.clone(), source))
    }

    // =========================================================================
    // Table helpers
    // =========================================================================

    fn table(&self) -> MutexGuard<'_, Table> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, table: &Table) {
        let mut records: Vec<&Record> = table.records.values().collect();
        records.sort_by_key(|r| r.seq);
        self.inner
            .snapshots
            .send_replace(records.into_iter().map(|r| r.transfer.clone()).collect());
    }

    fn insert(&self, transfer: Transfer, runtime: Runtime) -> bool {
        let mut table = self.table();
        if table.records.contains_key(&transfer.id) {
            return false;
        }
        let seq = table.next_seq;
        table.next_seq += 1;
        table.records.insert(
            transfer.id.clone(),
            Record {
                seq,
                transfer,
                runtime,
            },
        );
        self.publish(&table);
        true
    }

    /// Applies `f` to a record and publishes a snapshot.
    fn with_record<R>(&self, id: &str, f: impl FnOnce(&mut Record) -> R) -> Option<R> {
        let mut table = self.table();
        let result = table.records.get_mut(id).map(f);
        if result.is_some() {
            self.publish(&table);
        }
        result
    }

    /// Runs a user command after checking that the transfer allows it.
    fn transition(
        &self,
        id: &str,
        action: &'static str,
        allowed: impl FnOnce(&Transfer) -> bool,
        apply: impl FnOnce(&mut Record),
    ) -> Result<Arc<dyn DataChannel>, TransferError> {
        let mut table = self.table();
        let record = table
            .records
            .get_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;

        if !allowed(&record.transfer) {
            return Err(TransferError::InvalidState {
                action,
                status: record.transfer.status,
            });
        }

        apply(record);
        let channel = Arc::clone(&record.runtime.channel);
        self.publish(&table);
        Ok(channel)
    }

    /// Moves a non-terminal transfer to `error` and stops its task.
    fn fail(&self, id: &str, err: &TransferError) -> bool {
        let failed = self
            .with_record(id, |r| {
                if r.transfer.status.is_terminal() {
                    return false;
                }
                r.transfer.fail(err.to_string());
                r.runtime.cancel.cancel();
                true
            })
            .unwrap_or(false);

        if failed {
            tracing::warn!(file_id = %id, "Transfer failed: {}", err);
        }
        failed
    }

    fn finish(&self, id: &str) {
        let finished = self
            .with_record(id, |r| {
                if r.transfer.status.is_terminal() {
                    return false;
                }
                r.transfer.complete();
                true
            })
            .unwrap_or(false);

        if finished {
            tracing::info!(file_id = %id, "Transfer completed");
        }
    }

    // =========================================================================
    // Outgoing
    // =========================================================================

    /// Offers `file` to `peer_id` and streams it once accepted.
    ///
    /// Returns the new transfer id immediately; progress is observable
    /// through [`TransferEngine::subscribe`].
    pub fn send_file(
        &self,
        peer_id: &str,
        channel: Arc<dyn DataChannel>,
        file: OutgoingFile,
    ) -> String {
        let settings = &self.inner.settings;
        let id = generate_transfer_id();
        let transfer = Transfer::new(
            &id,
            &file.name,
            file.size,
            &file.file_type,
            TransferDirection::Outgoing,
            peer_id,
            settings.chunk_size,
            settings.use_compression,
        );

        let (offer_tx, offer_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let mut runtime = Runtime::new(Arc::clone(&channel));
        runtime.offer_ack = Some(offer_tx);
        runtime.acks = Some(ack_tx);
        runtime.source = Some(file.clone());

        let link = OutgoingLink {
            channel,
            offer_ack: offer_rx,
            acks: ack_rx,
            paused: runtime.paused.subscribe(),
            cancel: runtime.cancel.clone(),
        };
        self.insert(transfer, runtime);

        let engine = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            match engine.stream_outgoing(&task_id, &file, link).await {
                Ok(()) => engine.finish(&task_id),
                Err(e) => engine.abort(&task_id, e).await,
            }
        });

        id
    }

    async fn stream_outgoing(
        &self,
        id: &str,
        file: &OutgoingFile,
        link: OutgoingLink,
    ) -> Result<(), TransferError> {
        let OutgoingLink {
            channel,
            offer_ack,
            mut acks,
            mut paused,
            cancel,
        } = link;
        let settings = &self.inner.settings;
        let total = chunk_count(file.size, settings.chunk_size);
        let codec = ChunkCodec::new(settings.use_compression);

        let offer = ControlMessage::FileOffer(FileOffer {
            file_id: id.to_string(),
            file_name: file.name.clone(),
            file_size: file.size,
            file_type: file.file_type.clone(),
            use_compression: settings.use_compression,
        });
        send_control(&channel, &offer).await?;
        tracing::info!(file_id = %id, file_name = %file.name, size = file.size, "Offered file");

        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            result = tokio::time::timeout(settings.offer_ack_timeout, offer_ack) => match result {
                Err(_) => return Err(TransferError::Timeout("file offer acknowledgment".to_string())),
                Ok(Err(_)) => return Err(TransferError::Cancelled),
                Ok(Ok(())) => {}
            }
        }

        let started = self
            .with_record(id, |r| {
                if r.transfer.status.is_terminal() {
                    return false;
                }
                r.transfer.start(Instant::now());
                true
            })
            .unwrap_or(false);
        if !started {
            return Err(TransferError::Cancelled);
        }

        let mut reader = file.reader().await?;
        let mut acked = BTreeSet::new();

        for index in 0..total {
            while index.saturating_sub(acked.len() as u32) >= settings.ack_window {
                self.next_ack(&cancel, &mut acks, &mut acked, index).await?;
            }
            wait_while_paused(&cancel, &mut paused).await?;

            let (offset, len) = chunk_range(file.size, settings.chunk_size, index)?;
            let plaintext = reader.read(offset, len).await?;
            let file_id = id.to_string();
            let chunk = tokio::task::spawn_blocking(move || {
                codec.encode(&file_id, index, total, &plaintext)
            })
            .await
            .map_err(|e| TransferError::Chunk(format!("encoder task failed: {}", e)))??;

            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            send_control(&channel, &ControlMessage::FileChunk(chunk)).await?;

            let bytes = bytes_through(file.size, settings.chunk_size, index);
            self.with_record(id, |r| {
                r.transfer.record_progress(index + 1, bytes, Instant::now())
            });
            tracing::trace!(file_id = %id, index, total, "Sent chunk");
        }

        while (acked.len() as u32) < total {
            self.next_ack(&cancel, &mut acks, &mut acked, total).await?;
        }
        Ok(())
    }

    /// Waits for one chunk acknowledgment below `sent`.
    async fn next_ack(
        &self,
        cancel: &CancellationToken,
        acks: &mut mpsc::UnboundedReceiver<u32>,
        acked: &mut BTreeSet<u32>,
        sent: u32,
    ) -> Result<(), TransferError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = tokio::time::timeout(self.inner.settings.ack_timeout, acks.recv()) => match result {
                Err(_) => Err(TransferError::Timeout("chunk acknowledgment".to_string())),
                Ok(None) => Err(TransferError::Cancelled),
                Ok(Some(index)) => {
                    if index < sent {
                        acked.insert(index);
                    }
                    Ok(())
                }
            }
        }
    }

    // =========================================================================
    // Incoming
    // =========================================================================

    /// Handles one control message received from `peer_id` on `channel`.
    ///
    /// Malformed messages and messages about unknown transfers are logged
    /// and ignored.
    pub async fn handle_message(&self, peer_id: &str, channel: Arc<dyn DataChannel>, text: &str) {
        let message = match ControlMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(peer_id = %peer_id, "Ignoring malformed control message: {}", e);
                return;
            }
        };

        match message {
            ControlMessage::FileOffer(offer) => self.on_file_offer(peer_id, channel, offer).await,
            ControlMessage::FileOfferAck(ack) => self.on_offer_ack(peer_id, &ack.file_id),
            ControlMessage::FileChunk(chunk) => self.on_file_chunk(peer_id, chunk).await,
            ControlMessage::ChunkAck(ack) => self.on_chunk_ack(peer_id, ack),
            ControlMessage::TransferControl(control) => self.on_transfer_control(peer_id, control),
        }
    }

    async fn on_file_offer(&self, peer_id: &str, channel: Arc<dyn DataChannel>, offer: FileOffer) {
        let settings = &self.inner.settings;
        let mut transfer = Transfer::new(
            &offer.file_id,
            &offer.file_name,
            offer.file_size,
            &offer.file_type,
            TransferDirection::Incoming,
            peer_id,
            settings.chunk_size,
            offer.use_compression,
        );
        if settings.auto_accept {
            transfer.start(Instant::now());
        }

        let runtime = Runtime::new(Arc::clone(&channel));
        if !self.insert(transfer, runtime) {
            tracing::debug!(file_id = %offer.file_id, "Duplicate file offer ignored");
            return;
        }
        tracing::info!(
            peer_id = %peer_id,
            file_id = %offer.file_id,
            file_name = %offer.file_name,
            size = offer.file_size,
            "Received file offer"
        );

        if settings.auto_accept {
            if let Err(e) = self.acknowledge_offer(&offer.file_id, &channel).await {
                self.fail(&offer.file_id, &e);
            }
        }
    }

    async fn acknowledge_offer(
        &self,
        id: &str,
        channel: &Arc<dyn DataChannel>,
    ) -> Result<(), TransferError> {
        let ack = ControlMessage::FileOfferAck(FileOfferAck {
            file_id: id.to_string(),
        });
        send_control(channel, &ack).await?;

        if self.get(id).is_some_and(|t| t.total_chunks == 0) {
            self.finish(id);
        }
        Ok(())
    }

    fn on_offer_ack(&self, peer_id: &str, id: &str) {
        let mut table = self.table();
        let Some(record) = table.records.get_mut(id) else {
            tracing::debug!(file_id = %id, "Offer ack for unknown transfer");
            return;
        };
        if record.transfer.direction != TransferDirection::Outgoing
            || record.transfer.peer_id != peer_id
        {
            tracing::warn!(peer_id = %peer_id, file_id = %id, "Unexpected offer ack");
            return;
        }
        if let Some(tx) = record.runtime.offer_ack.take() {
            let _ = tx.send(());
        }
    }

    async fn on_file_chunk(&self, peer_id: &str, chunk: FileChunk) {
        let id = chunk.file_id.clone();
        let codec = {
            let table = self.table();
            let Some(record) = table.records.get(&id) else {
                tracing::debug!(file_id = %id, "Chunk for unknown transfer");
                return;
            };
            if record.transfer.direction != TransferDirection::Incoming
                || record.transfer.peer_id != peer_id
            {
                tracing::warn!(peer_id = %peer_id, file_id = %id, "Unexpected chunk");
                return;
            }
            match record.transfer.status {
                TransferStatus::Transferring | TransferStatus::Paused => {}
                status => {
                    tracing::debug!(file_id = %id, status = %status, "Ignoring chunk");
                    return;
                }
            }
            ChunkCodec::new(record.transfer.use_compression)
        };

        let index = chunk.chunk_index;
        let total = chunk.total_chunks;
        let decoded = tokio::task::spawn_blocking(move || codec.decode(&chunk)).await;
        let plaintext = match decoded {
            Ok(Ok(plaintext)) => plaintext,
            Ok(Err(e)) => return self.abort(&id, TransferError::from(e)).await,
            Err(e) => {
                return self
                    .abort(&id, TransferError::Chunk(format!("decoder task failed: {}", e)))
                    .await
            }
        };

        let outcome = self
            .with_record(&id, |r| {
                if r.transfer.status.is_terminal() {
                    return None;
                }
                if r.runtime.chunks.is_empty() && r.transfer.total_chunks != total {
                    tracing::debug!(
                        file_id = %r.transfer.id,
                        expected = r.transfer.total_chunks,
                        total,
                        "Adopting sender chunk count"
                    );
                    r.transfer.total_chunks = total;
                }
                if index >= r.transfer.total_chunks {
                    return None;
                }

                let mut bytes = r.transfer.bytes_transferred;
                if let Entry::Vacant(slot) = r.runtime.chunks.entry(index) {
                    bytes += plaintext.len() as u64;
                    if bytes > r.transfer.file_size {
                        return Some(Err(size_mismatch(bytes, r.transfer.file_size)));
                    }
                    slot.insert(plaintext);
                }
                let done = r.runtime.chunks.len() as u32;
                let complete = done == r.transfer.total_chunks;
                if complete && bytes != r.transfer.file_size {
                    return Some(Err(size_mismatch(bytes, r.transfer.file_size)));
                }

                r.transfer.record_progress(done, bytes, Instant::now());
                if complete {
                    r.transfer.complete();
                }
                Some(Ok((Arc::clone(&r.runtime.channel), complete)))
            })
            .flatten();

        let (channel, complete) = match outcome {
            None => return,
            Some(Err(e)) => return self.abort(&id, e).await,
            Some(Ok(outcome)) => outcome,
        };
        if complete {
            tracing::info!(peer_id = %peer_id, file_id = %id, "Received file");
        }

        let ack = ControlMessage::ChunkAck(ChunkAck {
            file_id: id.clone(),
            chunk_index: index,
        });
        if let Err(e) = send_control(&channel, &ack).await {
            self.fail(&id, &e);
        }
    }

    fn on_chunk_ack(&self, peer_id: &str, ack: ChunkAck) {
        let table = self.table();
        let Some(record) = table.records.get(&ack.file_id) else {
            return;
        };
        if record.transfer.peer_id != peer_id {
            tracing::warn!(peer_id = %peer_id, file_id = %ack.file_id, "Unexpected chunk ack");
            return;
        }
        if let Some(acks) = &record.runtime.acks {
            let _ = acks.send(ack.chunk_index);
        }
    }

    fn on_transfer_control(&self, peer_id: &str, control: TransferControl) {
        let applied = self.with_record(&control.file_id, |r| {
            if r.transfer.peer_id != peer_id {
                return false;
            }
            match control.action {
                ControlAction::Pause if r.transfer.status == TransferStatus::Transferring => {
                    r.transfer.status = TransferStatus::Paused;
                    r.runtime.paused.send_replace(true);
                    true
                }
                ControlAction::Resume if r.transfer.status == TransferStatus::Paused => {
                    r.transfer.status = TransferStatus::Transferring;
                    r.runtime.paused.send_replace(false);
                    true
                }
                ControlAction::Cancel if !r.transfer.status.is_terminal() => {
                    let err = if r.transfer.direction == TransferDirection::Outgoing
                        && r.transfer.status == TransferStatus::Pending
                    {
                        TransferError::RejectedByPeer
                    } else {
                        TransferError::CancelledByPeer
                    };
                    r.transfer.fail(err.to_string());
                    r.runtime.cancel.cancel();
                    true
                }
                _ => false,
            }
        });

        match applied {
            Some(true) => tracing::info!(
                peer_id = %peer_id,
                file_id = %control.file_id,
                action = ?control.action,
                "Peer changed transfer state"
            ),
            _ => tracing::debug!(
                peer_id = %peer_id,
                file_id = %control.file_id,
                action = ?control.action,
                "Ignoring transfer control"
            ),
        }
    }

    /// Fails a transfer and tells the peer to stop.
    ///
    /// Nothing is sent if the transfer already ended, e.g. through a peer
    /// cancel or [`TransferEngine::fail_peer`].
    async fn abort(&self, id: &str, err: TransferError) {
        let channel = self
            .table()
            .records
            .get(id)
            .map(|r| Arc::clone(&r.runtime.channel));

        if self.fail(id, &err) {
            if let Some(channel) = channel {
                self.notify(id, &channel, ControlAction::Cancel).await;
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn notify(&self, id: &str, channel: &Arc<dyn DataChannel>, action: ControlAction) {
        let control = ControlMessage::TransferControl(TransferControl {
            file_id: id.to_string(),
            action,
        });
        if let Err(e) = send_control(channel, &control).await {
            tracing::warn!(file_id = %id, action = ?action, "Failed to notify peer: {}", e);
        }
    }

    /// Pauses a transferring transfer on both sides.
    pub async fn pause(&self, id: &str) -> Result<(), TransferError> {
        let channel = self.transition(
            id,
            "pause",
            |t| t.status == TransferStatus::Transferring,
            |r| {
                r.transfer.status = TransferStatus::Paused;
                r.runtime.paused.send_replace(true);
            },
        )?;
        self.notify(id, &channel, ControlAction::Pause).await;
        Ok(())
    }

    /// Resumes a paused transfer on both sides.
    pub async fn resume(&self, id: &str) -> Result<(), TransferError> {
        let channel = self.transition(
            id,
            "resume",
            |t| t.status == TransferStatus::Paused,
            |r| {
                r.transfer.status = TransferStatus::Transferring;
                r.runtime.paused.send_replace(false);
            },
        )?;
        self.notify(id, &channel, ControlAction::Resume).await;
        Ok(())
    }

    /// Cancels a transfer on both sides; it ends in `error`.
    pub async fn cancel(&self, id: &str) -> Result<(), TransferError> {
        self.cancel_as(id, "cancel", |_| true).await
    }

    /// Declines a pending incoming offer.
    pub async fn reject(&self, id: &str) -> Result<(), TransferError> {
        self.cancel_as(id, "reject", |t| {
            t.direction == TransferDirection::Incoming && t.status == TransferStatus::Pending
        })
        .await
    }

    async fn cancel_as(
        &self,
        id: &str,
        action: &'static str,
        allowed: impl FnOnce(&Transfer) -> bool,
    ) -> Result<(), TransferError> {
        let channel = self.transition(
            id,
            action,
            |t| !t.status.is_terminal() && allowed(t),
            |r| {
                r.transfer.fail(TransferError::Cancelled.to_string());
                r.runtime.cancel.cancel();
            },
        )?;
        tracing::info!(file_id = %id, "Transfer cancelled");
        self.notify(id, &channel, ControlAction::Cancel).await;
        Ok(())
    }

    /// Accepts a pending incoming offer.
    pub async fn accept(&self, id: &str) -> Result<(), TransferError> {
        let channel = self.transition(
            id,
            "accept",
            |t| t.direction == TransferDirection::Incoming && t.status == TransferStatus::Pending,
            |r| r.transfer.start(Instant::now()),
        )?;

        if let Err(e) = self.acknowledge_offer(id, &channel).await {
            self.fail(id, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Fails every unfinished transfer bound to `peer_id`.
    ///
    /// Returns the number of transfers affected.
    pub fn fail_peer(&self, peer_id: &str, reason: &str) -> usize {
        let message = TransferError::ConnectionLost(reason.to_string()).to_string();
        let mut table = self.table();
        let mut failed = 0;

        for record in table.records.values_mut() {
            if record.transfer.peer_id == peer_id && !record.transfer.status.is_terminal() {
                record.transfer.fail(message.clone());
                record.runtime.cancel.cancel();
                failed += 1;
            }
        }

        if failed > 0 {
            self.publish(&table);
            tracing::warn!(peer_id = %peer_id, failed, "Failed transfers after losing peer");
        }
        failed
    }

    /// Writes a completed incoming transfer into `dir`.
    ///
    /// Returns the path of the written file.
    pub async fn save_completed(&self, id: &str, dir: &Path) -> Result<PathBuf, TransferError> {
        let (name, chunks) = {
            let table = self.table();
            let record = table
                .records
                .get(id)
                .ok_or_else(|| TransferError::NotFound(id.to_string()))?;

            if record.transfer.direction != TransferDirection::Incoming {
                return Err(TransferError::InvalidState {
                    action: "save",
                    status: record.transfer.status,
                });
            }
            if record.transfer.status != TransferStatus::Completed {
                return Err(TransferError::Incomplete {
                    received: record.runtime.chunks.len() as u32,
                    total: record.transfer.total_chunks,
                });
            }

            let chunks: Vec<Vec<u8>> = record.runtime.chunks.values().cloned().collect();
            (record.transfer.file_name.clone(), chunks)
        };

        Ok(storage::save_chunks(dir, &name, &chunks).await?)
    }

    /// Removes a finished transfer.
    pub fn clear(&self, id: &str) -> Result<(), TransferError> {
        let mut table = self.table();
        let record = table
            .records
            .get(id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        if !record.transfer.status.is_terminal() {
            return Err(TransferError::InvalidState {
                action: "clear",
                status: record.transfer.status,
            });
        }

        table.records.remove(id);
        self.publish(&table);
        Ok(())
    }

    /// Removes all finished transfers; returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut table = self.table();
        let before = table.records.len();
        table
            .records
            .retain(|_, r| !r.transfer.status.is_terminal());
        let removed = before - table.records.len();
        if removed > 0 {
            self.publish(&table);
        }
        removed
    }
}

fn size_mismatch(received: u64, offered: u64) -> TransferError {
    TransferError::Chunk(format!(
        "received {} bytes for a file offered as {} bytes",
        received, offered
    ))
}

async fn send_control(
    channel: &Arc<dyn DataChannel>,
    message: &ControlMessage,
) -> Result<(), TransferError> {
    if !channel.is_open() {
        return Err(TransferError::ChannelUnavailable("not open".to_string()));
    }
    let text = message.to_json()?;
    channel.send_text(text).await?;
    Ok(())
}

/// Returns once the transfer is not paused; fails on cancel.
async fn wait_while_paused(
    cancel: &CancellationToken,
    paused: &mut watch::Receiver<bool>,
) -> Result<(), TransferError> {
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if !*paused.borrow_and_update() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            changed = paused.changed() => {
                if changed.is_err() {
                    return Err(TransferError::Cancelled);
                }
            }
        }
    }
}
