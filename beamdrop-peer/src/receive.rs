//! Streaming receive side of the transfer protocol.
//!
//! Inbound messages are fed to a [`Receiver`]: a text frame announces the
//! file and opens a sink, binary frames stream the body into it, and the
//! transfer completes exactly when the received byte count equals the
//! announced size. An overshoot never completes; the sender and receiver
//! disagreeing on length is surfaced as a stalled transfer, not a
//! corrupted file.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use beamdrop_core::{FileMetadata, decode_metadata, progress};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{error::TransferError, transport::ChannelMessage};

/// Destination for the received file body.
#[allow(async_fn_in_trait)]
pub trait ByteSink {
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()>;
    async fn close(&mut self) -> std::io::Result<()>;
}

/// Opens a fresh sink for each announced file.
#[allow(async_fn_in_trait)]
pub trait SinkFactory {
    type Sink: ByteSink;
    async fn create(&self, metadata: &FileMetadata) -> std::io::Result<Self::Sink>;
}

/// Writes received files into a directory, preallocated to the announced
/// size. The announced name is reduced to its final path component so a
/// remote peer cannot steer the write outside the directory.
#[derive(Clone)]
pub struct FsSinkFactory {
    directory: PathBuf,
}

impl FsSinkFactory {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn target_path(&self, name: &str) -> PathBuf {
        let file_name = Path::new(name)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .unwrap_or("download");
        self.directory.join(file_name)
    }
}

impl SinkFactory for FsSinkFactory {
    type Sink = FsSink;

    async fn create(&self, metadata: &FileMetadata) -> std::io::Result<FsSink> {
        let path = self.target_path(&metadata.name);
        let file = tokio::fs::File::create(&path).await?;
        file.set_len(metadata.size).await?;
        debug!(path = %path.display(), size = metadata.size, "opened receive sink");
        Ok(FsSink { file })
    }
}

pub struct FsSink {
    file: tokio::fs::File,
}

impl ByteSink for FsSink {
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

/// Collects received files in memory, keyed by announced name. Completed
/// bodies become visible on sink close.
#[derive(Clone, Default)]
pub struct MemorySinkFactory {
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemorySinkFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn take(&self, name: &str) -> Option<Vec<u8>> {
        self.store.lock().ok()?.remove(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.store
            .lock()
            .map(|store| store.contains_key(name))
            .unwrap_or(false)
    }
}

impl SinkFactory for MemorySinkFactory {
    type Sink = MemorySink;

    async fn create(&self, metadata: &FileMetadata) -> std::io::Result<MemorySink> {
        Ok(MemorySink {
            name: metadata.name.clone(),
            data: Vec::with_capacity(usize::try_from(metadata.size).unwrap_or(0)),
            store: Arc::clone(&self.store),
        })
    }
}

pub struct MemorySink {
    name: String,
    data: Vec<u8>,
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl ByteSink for MemorySink {
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        if let Ok(mut store) = self.store.lock() {
            store.insert(self.name.clone(), std::mem::take(&mut self.data));
        }
        Ok(())
    }
}

/// What a fed message amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveEvent {
    /// Metadata accepted, sink opened, body expected next.
    Started(FileMetadata),
    Progress {
        received: u64,
        total: u64,
        fraction: f64,
    },
    /// Received bytes match the announced size exactly; the sink is closed.
    Completed(FileMetadata),
}

enum Stage<S> {
    AwaitingMetadata,
    Receiving {
        metadata: FileMetadata,
        sink: S,
        received: u64,
    },
}

pub struct Receiver<F: SinkFactory> {
    factory: F,
    stage: Stage<F::Sink>,
}

impl<F: SinkFactory> Receiver<F> {
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            stage: Stage::AwaitingMetadata,
        }
    }

    #[must_use]
    pub fn in_progress(&self) -> bool {
        matches!(self.stage, Stage::Receiving { .. })
    }

    /// Feeds one channel message through the protocol. Protocol and i/o
    /// failures tear down the current transfer before returning; the
    /// receiver is then ready for a fresh metadata frame.
    pub async fn accept(&mut self, message: ChannelMessage) -> Result<ReceiveEvent, TransferError> {
        match message {
            ChannelMessage::Text(frame) => self.accept_metadata(&frame).await,
            ChannelMessage::Binary(data) => self.accept_chunk(&data).await,
        }
    }

    async fn accept_metadata(&mut self, frame: &str) -> Result<ReceiveEvent, TransferError> {
        if self.in_progress() {
            self.abort();
            return Err(TransferError::ProtocolViolation(
                "metadata frame arrived mid-transfer",
            ));
        }
        let metadata = decode_metadata(frame).map_err(TransferError::Metadata)?;
        let mut sink = self.factory.create(&metadata).await?;
        if metadata.size == 0 {
            sink.close().await?;
            return Ok(ReceiveEvent::Completed(metadata));
        }
        debug!(name = %metadata.name, size = metadata.size, "transfer started");
        self.stage = Stage::Receiving {
            metadata: metadata.clone(),
            sink,
            received: 0,
        };
        Ok(ReceiveEvent::Started(metadata))
    }

    async fn accept_chunk(&mut self, data: &[u8]) -> Result<ReceiveEvent, TransferError> {
        match std::mem::replace(&mut self.stage, Stage::AwaitingMetadata) {
            Stage::AwaitingMetadata => Err(TransferError::ProtocolViolation(
                "binary chunk arrived before metadata",
            )),
            Stage::Receiving {
                metadata,
                mut sink,
                mut received,
            } => {
                if let Err(err) = sink.write(data).await {
                    drop(sink);
                    return Err(err.into());
                }
                received += data.len() as u64;
                if received == metadata.size {
                    sink.close().await?;
                    debug!(name = %metadata.name, "transfer completed");
                    return Ok(ReceiveEvent::Completed(metadata));
                }
                let event = ReceiveEvent::Progress {
                    received,
                    total: metadata.size,
                    fraction: progress(received, metadata.size),
                };
                self.stage = Stage::Receiving {
                    metadata,
                    sink,
                    received,
                };
                Ok(event)
            }
        }
    }

    /// Drops the in-flight transfer, if any. The partial sink is dropped
    /// without being closed, so an aborted body is never published as a
    /// finished file.
    pub fn abort(&mut self) {
        if let Stage::Receiving { metadata, .. } =
            std::mem::replace(&mut self.stage, Stage::AwaitingMetadata)
        {
            warn!(name = %metadata.name, "aborting in-flight transfer");
        }
    }
}

#[cfg(test)]
mod tests {
    use beamdrop_core::encode_metadata;
    use bytes::Bytes;

    use super::*;

    fn metadata_frame(name: &str, size: u64) -> ChannelMessage {
        let metadata = FileMetadata {
            name: name.to_owned(),
            size,
            mime_type: None,
        };
        ChannelMessage::Text(encode_metadata(&metadata).unwrap())
    }

    fn chunk(len: usize) -> ChannelMessage {
        ChannelMessage::Binary(Bytes::from(vec![42u8; len]))
    }

    #[tokio::test]
    async fn completes_exactly_at_announced_size() {
        let factory = MemorySinkFactory::new();
        let mut receiver = Receiver::new(factory.clone());

        let started = receiver
            .accept(metadata_frame("a.bin", 10))
            .await
            .unwrap();
        assert!(matches!(started, ReceiveEvent::Started(_)));

        let progress = receiver.accept(chunk(6)).await.unwrap();
        assert_eq!(
            progress,
            ReceiveEvent::Progress {
                received: 6,
                total: 10,
                fraction: 0.6,
            }
        );

        let done = receiver.accept(chunk(4)).await.unwrap();
        assert!(matches!(done, ReceiveEvent::Completed(_)));
        assert!(!receiver.in_progress());
        assert_eq!(factory.take("a.bin").unwrap().len(), 10);
    }

    #[tokio::test]
    async fn overshoot_never_completes() {
        let factory = MemorySinkFactory::new();
        let mut receiver = Receiver::new(factory.clone());

        receiver.accept(metadata_frame("a.bin", 10)).await.unwrap();
        receiver.accept(chunk(8)).await.unwrap();
        let event = receiver.accept(chunk(8)).await.unwrap();
        assert_eq!(
            event,
            ReceiveEvent::Progress {
                received: 16,
                total: 10,
                fraction: 1.0,
            }
        );
        assert!(receiver.in_progress());
        assert!(!factory.contains("a.bin"));
    }

    #[tokio::test]
    async fn chunk_before_metadata_is_a_protocol_violation() {
        let mut receiver = Receiver::new(MemorySinkFactory::new());
        let result = receiver.accept(chunk(8)).await;
        assert!(matches!(
            result,
            Err(TransferError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn metadata_mid_transfer_aborts_and_errors() {
        let factory = MemorySinkFactory::new();
        let mut receiver = Receiver::new(factory.clone());

        receiver.accept(metadata_frame("a.bin", 10)).await.unwrap();
        receiver.accept(chunk(4)).await.unwrap();
        let result = receiver.accept(metadata_frame("b.bin", 5)).await;
        assert!(matches!(
            result,
            Err(TransferError::ProtocolViolation(_))
        ));
        assert!(!receiver.in_progress());
        assert!(!factory.contains("a.bin"));
    }

    #[tokio::test]
    async fn zero_byte_file_completes_on_metadata_alone() {
        let factory = MemorySinkFactory::new();
        let mut receiver = Receiver::new(factory.clone());

        let event = receiver.accept(metadata_frame("empty", 0)).await.unwrap();
        assert!(matches!(event, ReceiveEvent::Completed(_)));
        assert_eq!(factory.take("empty").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn handles_sequential_transfers() {
        let factory = MemorySinkFactory::new();
        let mut receiver = Receiver::new(factory.clone());

        receiver.accept(metadata_frame("one", 3)).await.unwrap();
        receiver.accept(chunk(3)).await.unwrap();
        receiver.accept(metadata_frame("two", 2)).await.unwrap();
        receiver.accept(chunk(2)).await.unwrap();

        assert_eq!(factory.take("one").unwrap().len(), 3);
        assert_eq!(factory.take("two").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fs_factory_confines_writes_to_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FsSinkFactory::new(dir.path());
        let mut receiver = Receiver::new(factory);

        receiver
            .accept(metadata_frame("../../escape.bin", 4))
            .await
            .unwrap();
        receiver
            .accept(ChannelMessage::Binary(Bytes::from_static(b"data")))
            .await
            .unwrap();

        let written = tokio::fs::read(dir.path().join("escape.bin")).await.unwrap();
        assert_eq!(written, b"data");
        assert!(!dir.path().join("../../escape.bin").exists());
    }
}
