//! File layer: chunked transfer with handshake and progress.
//!
//! Sits on the object layer. An outgoing transfer announces its files
//! with `FileSendMetadata`, waits for a `FileReqAck`, then pushes
//! `FilePartObj` chunks strictly in order, one file after another. The
//! receiving side writes parts into the temp directory and reports
//! progress as they land. Flow control is the bounded per-connection
//! writer queue plus TCP backpressure; there is no per-part
//! acknowledgement.

pub mod records;
pub mod storage;

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use lanlink_core::{FileMetadata, FilePartObj, FileReqAck, FileSendMetadata};

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::object::{Messenger, ObjectEvent, ObjectMeta};
use crate::transport::Transport;

pub use records::{Direction, FileProgress};
pub use storage::{DiskStorage, MemStorage, ReadStream, Storage, WriteStream};

use records::{InboundFile, OutboundFile, ReceiveRecord, SendRecord, SendState};

const BROADCAST_DEPTH: usize = 1024;

/// Events published by the file layer.
#[derive(Debug, Clone)]
pub enum FileEvent {
    /// One part was sent or written.
    Progress(FileProgress),
    /// A file finished arriving and its stream was closed.
    Received { file_name: String, path: PathBuf },
    /// The remote side declined our transfer request.
    Rejected { peer: String },
    /// A transfer was aborted.
    Failed { peer: String, reason: String },
}

/// Decides whether an incoming request is accepted. The default accepts
/// everything.
pub type AcceptPolicy = Box<dyn Fn(&FileSendMetadata) -> bool + Send + Sync>;

struct FileInner {
    messenger: Messenger,
    storage: Arc<dyn Storage>,
    sends: Mutex<HashMap<String, SendRecord>>,
    receives: Mutex<HashMap<String, ReceiveRecord>>,
    events_tx: broadcast::Sender<FileEvent>,
    policy: StdMutex<AcceptPolicy>,
    runtime: Mutex<Option<RuntimeState>>,
}

struct RuntimeState {
    shutdown: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
}

impl FileInner {
    fn config(&self) -> &LinkConfig {
        self.messenger.transport().config()
    }

    fn emit(&self, event: FileEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// Handle to the file layer. Cheap to clone.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<FileInner>,
}

impl TransferManager {
    /// Create a transfer manager writing to the real filesystem.
    pub fn new(messenger: Messenger) -> Self {
        Self::with_storage(messenger, Arc::new(DiskStorage))
    }

    /// Create a transfer manager with a custom storage backend.
    pub fn with_storage(messenger: Messenger, storage: Arc<dyn Storage>) -> Self {
        // Receive-side dispatch needs all three protocol types decodable.
        messenger.register::<FileSendMetadata>();
        messenger.register::<FileReqAck>();
        messenger.register::<FilePartObj>();

        let (events_tx, _) = broadcast::channel(BROADCAST_DEPTH);
        Self {
            inner: Arc::new(FileInner {
                messenger,
                storage,
                sends: Mutex::new(HashMap::new()),
                receives: Mutex::new(HashMap::new()),
                events_tx,
                policy: StdMutex::new(Box::new(|_| true)),
                runtime: Mutex::new(None),
            }),
        }
    }

    /// The object layer beneath this manager.
    pub fn messenger(&self) -> &Messenger {
        &self.inner.messenger
    }

    /// The transport at the bottom of the stack.
    pub fn transport(&self) -> &Transport {
        self.inner.messenger.transport()
    }

    /// Subscribe to file events.
    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Replace the accept policy for incoming requests.
    pub fn set_accept_policy(
        &self,
        policy: impl Fn(&FileSendMetadata) -> bool + Send + Sync + 'static,
    ) {
        *self.inner.policy.lock().unwrap() = Box::new(policy);
    }

    /// Start the whole stack: transport, object dispatch, file dispatch.
    pub async fn start(&self) -> LinkResult<()> {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        let events = self.inner.messenger.events_receiver();
        self.inner.messenger.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatch = tokio::spawn(dispatch_loop(self.inner.clone(), events, shutdown_rx));

        *runtime = Some(RuntimeState {
            shutdown: shutdown_tx,
            dispatch,
        });
        Ok(())
    }

    /// Stop the stack and drop every transfer record.
    pub async fn stop(&self) {
        let state = self.inner.runtime.lock().await.take();
        if let Some(state) = state {
            let _ = state.shutdown.send(true);
            state.dispatch.abort();
        }

        self.inner.sends.lock().await.clear();
        // Dropping inbound records closes their writers.
        self.inner.receives.lock().await.clear();

        self.inner.messenger.stop().await;
    }

    /// Send files with the configured default part size.
    pub async fn send_files(
        &self,
        target_ip: &str,
        paths: &[impl AsRef<Path>],
    ) -> LinkResult<()> {
        let buffer_size = self.inner.config().default_buffer_size;
        self.send_files_with(target_ip, paths, buffer_size).await
    }

    /// Send files, reading and pushing `buffer_size` bytes per part.
    ///
    /// Fails fast with [`LinkError::FileNotFound`] if any source cannot
    /// be opened, and with [`LinkError::Busy`] while a transfer to the
    /// same peer is still in flight. Returns once the request is on the
    /// wire; streaming starts when the receiver accepts.
    pub async fn send_files_with(
        &self,
        target_ip: &str,
        paths: &[impl AsRef<Path>],
        buffer_size: u32,
    ) -> LinkResult<()> {
        if !self.transport().is_running() {
            return Err(LinkError::NotRunning);
        }
        if buffer_size == 0 {
            return Err(LinkError::InvalidArgument("buffer_size must be non-zero"));
        }
        if paths.is_empty() {
            return Err(LinkError::InvalidArgument("no files to send"));
        }

        // Reserve the per-peer slot before any I/O.
        {
            let mut sends = self.inner.sends.lock().await;
            if sends.contains_key(target_ip) {
                return Err(LinkError::Busy {
                    addr: target_ip.to_string(),
                });
            }
            sends.insert(
                target_ip.to_string(),
                SendRecord::new(target_ip.to_string(), buffer_size),
            );
        }

        let result = self
            .prepare_and_request(target_ip, paths, buffer_size)
            .await;
        if result.is_err() {
            self.inner.sends.lock().await.remove(target_ip);
        }
        result
    }

    async fn prepare_and_request(
        &self,
        target_ip: &str,
        paths: &[impl AsRef<Path>],
        buffer_size: u32,
    ) -> LinkResult<()> {
        let mut files = Vec::with_capacity(paths.len());
        let mut metas = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let (reader, file_size) =
                self.inner
                    .storage
                    .open_read(path)
                    .await
                    .map_err(|_| LinkError::FileNotFound {
                        path: path.to_path_buf(),
                    })?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or(LinkError::InvalidArgument("path has no file name"))?;
            let metadata = FileMetadata {
                file_name,
                file_path: path.display().to_string(),
                file_size,
            };
            metas.push(metadata.clone());
            files.push(OutboundFile { metadata, reader });
        }

        let request = FileSendMetadata {
            files: metas,
            buffer_size,
            sender_ip: self.transport().local_ip()?.to_string(),
        };

        {
            let mut sends = self.inner.sends.lock().await;
            if let Some(record) = sends.get_mut(target_ip) {
                record.files = Some(files);
            }
        }

        self.inner.messenger.send_tcp(target_ip, &request).await?;
        tracing::info!(
            target = %target_ip,
            files = request.files.len(),
            buffer_size,
            "Transfer requested"
        );
        Ok(())
    }
}

/// Consume object events and drive both sides of the protocol.
async fn dispatch_loop(
    inner: Arc<FileInner>,
    mut events: mpsc::Receiver<ObjectEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ObjectEvent::PeerChange { peer, active } => {
                if !active {
                    handle_disconnect(&inner, &peer.addr).await;
                }
            }
            ObjectEvent::Object { meta, object } => {
                if let Ok(request) = object.clone().downcast::<FileSendMetadata>() {
                    handle_request(&inner, &meta, &request).await;
                } else if let Ok(ack) = object.clone().downcast::<FileReqAck>() {
                    handle_ack(&inner, &meta, &ack).await;
                } else if let Ok(part) = object.downcast::<FilePartObj>() {
                    handle_part(&inner, &meta, &part).await;
                }
            }
        }
    }
    tracing::debug!("File dispatch stopped");
}

/// Incoming `FileSendMetadata`: consult the policy, open the receiving
/// streams, answer with an ack.
async fn handle_request(inner: &Arc<FileInner>, meta: &ObjectMeta, request: &FileSendMetadata) {
    let sender = meta.source_ip.clone();
    let accepted = {
        let policy = inner.policy.lock().unwrap();
        (*policy)(request)
    };

    let files = if accepted {
        match open_inbound_files(inner, request).await {
            Ok(files) => Some(files),
            Err(e) => {
                tracing::warn!(
                    sender = %sender,
                    error = %e,
                    "Cannot open receiving streams; rejecting"
                );
                None
            }
        }
    } else {
        tracing::info!(sender = %sender, "Transfer request rejected by policy");
        None
    };

    let ack = FileReqAck {
        accepted: files.is_some(),
    };

    if let Some(files) = files {
        let mut receives = inner.receives.lock().await;
        // A new request from the same sender replaces the old one; its
        // partial files stay in the temp directory.
        let replaced = receives.insert(
            sender.clone(),
            ReceiveRecord {
                sender_ip: sender.clone(),
                files,
            },
        );
        if replaced.is_some() {
            tracing::warn!(sender = %sender, "Replacing active receive record");
        }
        tracing::info!(
            sender = %sender,
            files = request.files.len(),
            "Transfer request accepted"
        );
    }

    // Answer from a separate task: the dispatch loop must never wait on
    // a writer queue, or two saturated nodes could stall each other.
    let messenger = inner.messenger.clone();
    tokio::spawn(async move {
        if let Err(e) = messenger.send_tcp(&sender, &ack).await {
            tracing::warn!(sender = %sender, error = %e, "Failed to answer transfer request");
        }
    });
}

async fn open_inbound_files(
    inner: &Arc<FileInner>,
    request: &FileSendMetadata,
) -> LinkResult<Vec<InboundFile>> {
    let temp_dir = inner.config().temp_dir.clone();
    let mut files = Vec::with_capacity(request.files.len());
    for metadata in &request.files {
        // Keep only the final path component so a crafted name cannot
        // escape the temp directory.
        let name = Path::new(&metadata.file_name)
            .file_name()
            .ok_or(LinkError::InvalidArgument("empty file name in request"))?;
        let path = temp_dir.join(name);
        let writer = inner.storage.create_write(&path).await?;
        files.push(InboundFile {
            metadata: metadata.clone(),
            writer: Some(writer),
            path,
            received: 0,
            done: false,
        });
    }
    Ok(files)
}

/// Incoming `FileReqAck`: start streaming, or drop the record.
async fn handle_ack(inner: &Arc<FileInner>, meta: &ObjectMeta, ack: &FileReqAck) {
    let target = meta.source_ip.clone();

    if !ack.accepted {
        let mut sends = inner.sends.lock().await;
        if let Some(mut record) = sends.remove(&target) {
            record.transition_to(SendState::Rejected);
            drop(sends);
            inner.emit(FileEvent::Rejected { peer: target });
        }
        return;
    }

    let taken = {
        let mut sends = inner.sends.lock().await;
        match sends.get_mut(&target) {
            Some(record) if record.state == SendState::AwaitingAck => {
                record.transition_to(SendState::Streaming);
                record.files.take().map(|files| (files, record.buffer_size))
            }
            _ => None,
        }
    };

    match taken {
        Some((files, buffer_size)) => {
            let inner = inner.clone();
            tokio::spawn(async move {
                stream_files(inner, target, buffer_size, files).await;
            });
        }
        None => {
            tracing::debug!(target = %target, "Unexpected transfer ack");
        }
    }
}

/// Push every part of every file, in order, to `target`.
async fn stream_files(
    inner: Arc<FileInner>,
    target: String,
    buffer_size: u32,
    files: Vec<OutboundFile>,
) {
    for mut file in files {
        let size = file.metadata.file_size;
        let name = file.metadata.file_name.clone();
        let mut offset = 0u64;

        loop {
            let mut chunk = vec![0u8; buffer_size as usize];
            let mut filled = 0usize;
            let mut hit_eof = false;
            // Short reads happen; keep going until the part is full or
            // the file ends.
            while filled < chunk.len() {
                match file.reader.read(&mut chunk[filled..]).await {
                    Ok(0) => {
                        hit_eof = true;
                        break;
                    }
                    Ok(n) => filled += n,
                    Err(e) => {
                        abort_send(&inner, &target, &format!("read failed: {e}")).await;
                        return;
                    }
                }
            }

            let remaining = size - offset;
            if filled as u64 > remaining {
                // The source grew after the handshake; send only what
                // was announced.
                filled = remaining as usize;
            }
            chunk.truncate(filled);

            let is_last = offset + filled as u64 >= size;
            // A non-final part must be exactly buffer_size bytes; EOF
            // before that means the source shrank after the handshake.
            // Abort before anything reaches the wire.
            if hit_eof && !is_last {
                abort_send(&inner, &target, "source file shorter than announced").await;
                return;
            }

            let part = FilePartObj {
                file_metadata: file.metadata.clone(),
                offset,
                data: Bytes::from(chunk),
                is_last,
            };
            if let Err(e) = inner.messenger.send_tcp(&target, &part).await {
                abort_send(&inner, &target, &format!("send failed: {e}")).await;
                return;
            }

            offset += part.data.len() as u64;
            inner.emit(FileEvent::Progress(FileProgress {
                direction: Direction::Sending,
                file_name: name.clone(),
                file_length: size,
                bytes_processed: offset,
            }));

            if is_last {
                break;
            }
            tokio::task::yield_now().await;
        }

        tracing::debug!(target = %target, file = %name, size, "File sent");
    }

    let mut sends = inner.sends.lock().await;
    if let Some(record) = sends.get_mut(&target) {
        record.transition_to(SendState::Done);
        sends.remove(&target);
    }
}

async fn abort_send(inner: &Arc<FileInner>, target: &str, reason: &str) {
    let removed = inner.sends.lock().await.remove(target).is_some();
    if removed {
        tracing::warn!(target = %target, reason, "Transfer aborted");
        inner.emit(FileEvent::Failed {
            peer: target.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Incoming `FilePartObj`: write at the carried offset and report.
async fn handle_part(inner: &Arc<FileInner>, meta: &ObjectMeta, part: &FilePartObj) {
    let sender = meta.source_ip.as_str();
    let mut receives = inner.receives.lock().await;

    let Some(record) = receives.get_mut(sender) else {
        tracing::warn!(sender = %sender, "Dropping part without an active transfer");
        return;
    };
    let Some(file) = record.find_file(&part.file_metadata) else {
        tracing::warn!(
            sender = %sender,
            file = %part.file_metadata.file_name,
            "Dropping part for an unknown file"
        );
        return;
    };
    if file.done {
        tracing::warn!(
            sender = %sender,
            file = %part.file_metadata.file_name,
            "Dropping part for a finished file"
        );
        return;
    }
    let Some(writer) = file.writer.as_mut() else {
        return;
    };

    // A conformant sender appends, but the offset is authoritative.
    let write_result = async {
        writer.seek(SeekFrom::Start(part.offset)).await?;
        writer.write_all(&part.data).await?;
        if part.is_last {
            writer.flush().await?;
        }
        std::io::Result::Ok(())
    }
    .await;

    if let Err(e) = write_result {
        if let Some(record) = receives.remove(sender) {
            tracing::warn!(
                sender = %record.sender_ip,
                error = %e,
                "Write failed; dropping transfer"
            );
        }
        drop(receives);
        inner.emit(FileEvent::Failed {
            peer: sender.to_string(),
            reason: format!("write failed: {e}"),
        });
        return;
    }

    file.received = part.offset + part.data.len() as u64;
    let progress = FileProgress {
        direction: Direction::Receiving,
        file_name: file.metadata.file_name.clone(),
        file_length: file.metadata.file_size,
        bytes_processed: file.received,
    };

    let mut received_event = None;
    if part.is_last {
        file.writer = None;
        file.done = true;
        received_event = Some(FileEvent::Received {
            file_name: file.metadata.file_name.clone(),
            path: file.path.clone(),
        });
        tracing::info!(
            sender = %sender,
            file = %file.metadata.file_name,
            size = file.metadata.file_size,
            "File received"
        );
    }

    if record.is_complete() {
        receives.remove(sender);
    }
    drop(receives);

    inner.emit(FileEvent::Progress(progress));
    if let Some(event) = received_event {
        inner.emit(event);
    }
}

/// Connection loss drops both records for the address, one failure
/// event per record.
async fn handle_disconnect(inner: &Arc<FileInner>, addr: &str) {
    let dropped_send = inner.sends.lock().await.remove(addr).is_some();
    let dropped_recv = inner.receives.lock().await.remove(addr).is_some();

    if dropped_send {
        tracing::warn!(addr = %addr, "Dropping outgoing transfer after connection loss");
        inner.emit(FileEvent::Failed {
            peer: addr.to_string(),
            reason: "connection lost".to_string(),
        });
    }
    if dropped_recv {
        tracing::warn!(addr = %addr, "Dropping incoming transfer after connection loss");
        inner.emit(FileEvent::Failed {
            peer: addr.to_string(),
            reason: "connection lost".to_string(),
        });
    }
}
