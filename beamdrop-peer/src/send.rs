//! Chunked file sending over a data channel.
//!
//! The wire protocol is one text frame of metadata followed by the file
//! body as fixed-size binary chunks. The sender never lets the channel's
//! transmit buffer grow past [`BUFFER_HIGH_WATER`]: when it does, sending
//! pauses and polls the buffered amount until it drains back to
//! [`BUFFER_LOW_WATER`].

use std::{path::Path, time::Duration};

use beamdrop_core::{
    BUFFER_HIGH_WATER, BUFFER_LOW_WATER, CHUNK_SIZE, DRAIN_POLL_INTERVAL_MS, FileMetadata,
    encode_metadata, progress,
};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::{
    error::{ChannelClosed, TransferError},
    transport::DataChannel,
};

/// Supplies the file body in chunks of at most [`CHUNK_SIZE`] bytes.
#[allow(async_fn_in_trait)]
pub trait ChunkSource {
    /// Next chunk, or `None` once the source is exhausted.
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>>;
}

/// Reads chunks from a file on disk.
pub struct FileSource {
    file: tokio::fs::File,
}

impl FileSource {
    /// Opens `path` and derives the transfer metadata from it.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<(Self, FileMetadata)> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("file")
            .to_owned();
        let metadata = FileMetadata {
            name,
            size,
            mime_type: None,
        };
        Ok((Self { file }, metadata))
    }
}

impl ChunkSource for FileSource {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;
        // Short reads are refilled so every chunk but the last is full-size.
        while filled < CHUNK_SIZE {
            let read = self.file.read(&mut buffer[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            return Ok(None);
        }
        buffer.truncate(filled);
        Ok(Some(Bytes::from(buffer)))
    }
}

/// Serves chunks from an in-memory buffer.
pub struct MemorySource {
    remaining: Bytes,
}

impl MemorySource {
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            remaining: data.into(),
        }
    }
}

impl ChunkSource for MemorySource {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        if self.remaining.is_empty() {
            return Ok(None);
        }
        let take = self.remaining.len().min(CHUNK_SIZE);
        Ok(Some(self.remaining.split_to(take)))
    }
}

/// Sends one file over `channel`: metadata text frame first, then every
/// chunk from `source` in order, pausing for backpressure between chunks.
///
/// `on_progress` is called after each chunk with the total bytes sent so
/// far and the completed fraction. A zero-byte file produces only the
/// metadata frame and a single `(0, 1.0)` progress report.
pub async fn send_file<S, C>(
    source: &mut S,
    metadata: &FileMetadata,
    channel: &C,
    mut on_progress: impl FnMut(u64, f64),
) -> Result<(), TransferError>
where
    S: ChunkSource,
    C: DataChannel,
{
    let frame = encode_metadata(metadata).map_err(TransferError::Metadata)?;
    channel.send_text(&frame).await?;
    debug!(name = %metadata.name, size = metadata.size, "announced transfer");

    if metadata.size == 0 {
        on_progress(0, 1.0);
        return Ok(());
    }

    let mut sent: u64 = 0;
    while let Some(chunk) = source.next_chunk().await? {
        wait_for_drain(channel).await?;
        let len = chunk.len() as u64;
        channel.send_binary(chunk).await?;
        sent += len;
        on_progress(sent, progress(sent, metadata.size));
    }
    if sent != metadata.size {
        warn!(
            sent,
            announced = metadata.size,
            "source length differs from announced size"
        );
    }
    Ok(())
}

/// Blocks while the channel's transmit buffer sits above the high-water
/// mark, polling every [`DRAIN_POLL_INTERVAL_MS`] until it drains to the
/// low-water mark. Fails if the channel closes while waiting.
async fn wait_for_drain<C: DataChannel>(channel: &C) -> Result<(), ChannelClosed> {
    if channel.buffered_amount() <= BUFFER_HIGH_WATER {
        return Ok(());
    }
    while channel.buffered_amount() > BUFFER_LOW_WATER {
        if !channel.is_open() {
            return Err(ChannelClosed);
        }
        tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex,
        time::Duration,
    };

    use beamdrop_core::decode_metadata;
    use tokio::time::Instant;

    use super::*;
    use crate::transport::ChannelMessage;

    /// Scripted channel: each `buffered_amount`/`is_open` call pops the
    /// next scripted value, the last one sticking once the script runs dry.
    struct FakeChannel {
        sent: Mutex<Vec<ChannelMessage>>,
        buffered_script: Mutex<VecDeque<usize>>,
        open_script: Mutex<VecDeque<bool>>,
    }

    impl FakeChannel {
        fn new(buffered: Vec<usize>, open: Vec<bool>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                buffered_script: Mutex::new(buffered.into()),
                open_script: Mutex::new(open.into()),
            }
        }

        fn always_drained() -> Self {
            Self::new(vec![0], vec![true])
        }

        fn sent(&self) -> Vec<ChannelMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    fn pop_scripted<T: Copy>(script: &Mutex<VecDeque<T>>, fallback: T) -> T {
        let mut script = script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().copied().unwrap_or(fallback)
        }
    }

    impl DataChannel for FakeChannel {
        fn label(&self) -> &str {
            "fileTransfer"
        }

        fn is_open(&self) -> bool {
            pop_scripted(&self.open_script, true)
        }

        fn buffered_amount(&self) -> usize {
            pop_scripted(&self.buffered_script, 0)
        }

        fn close(&self) {}

        async fn send_text(&self, text: &str) -> Result<(), ChannelClosed> {
            self.sent
                .lock()
                .unwrap()
                .push(ChannelMessage::Text(text.to_owned()));
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> Result<(), ChannelClosed> {
            self.sent.lock().unwrap().push(ChannelMessage::Binary(data));
            Ok(())
        }

        async fn recv(&mut self) -> Option<ChannelMessage> {
            None
        }

        async fn wait_open(&mut self) -> Result<(), ChannelClosed> {
            Ok(())
        }
    }

    fn metadata(size: u64) -> FileMetadata {
        FileMetadata {
            name: "dataset.bin".to_owned(),
            size,
            mime_type: None,
        }
    }

    #[tokio::test]
    async fn partitions_into_fixed_chunks_with_short_tail() {
        let channel = FakeChannel::always_drained();
        let mut source = MemorySource::new(vec![7u8; 1_000_000]);
        let mut reports = Vec::new();

        send_file(&mut source, &metadata(1_000_000), &channel, |sent, fraction| {
            reports.push((sent, fraction));
        })
        .await
        .unwrap();

        let sent = channel.sent();
        assert_eq!(sent.len(), 5);
        let ChannelMessage::Text(frame) = &sent[0] else {
            panic!("metadata frame must be text");
        };
        assert_eq!(decode_metadata(frame).unwrap().size, 1_000_000);
        for message in &sent[1..4] {
            assert_eq!(message.len(), CHUNK_SIZE);
        }
        assert_eq!(sent[4].len(), 1_000_000 - 3 * CHUNK_SIZE);

        assert_eq!(reports.len(), 4);
        assert_eq!(reports.last(), Some(&(1_000_000, 1.0)));
    }

    #[tokio::test]
    async fn zero_byte_file_sends_metadata_only() {
        let channel = FakeChannel::always_drained();
        let mut source = MemorySource::new(Vec::new());
        let mut reports = Vec::new();

        send_file(&mut source, &metadata(0), &channel, |sent, fraction| {
            reports.push((sent, fraction));
        })
        .await
        .unwrap();

        assert_eq!(channel.sent().len(), 1);
        assert_eq!(reports, vec![(0, 1.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_until_buffer_drains_to_low_water() {
        // Before the second chunk the buffer reads over high water, stays
        // over it for two polls, then reaches the low-water mark.
        let channel = FakeChannel::new(
            vec![
                0,
                BUFFER_HIGH_WATER + 1,
                BUFFER_HIGH_WATER + 1,
                BUFFER_HIGH_WATER + 1,
                BUFFER_LOW_WATER,
                0,
            ],
            vec![true],
        );
        let mut source = MemorySource::new(vec![1u8; 2 * CHUNK_SIZE]);
        let start = Instant::now();

        send_file(&mut source, &metadata(2 * CHUNK_SIZE as u64), &channel, |_, _| {})
            .await
            .unwrap();

        // Two over-low readings inside the drain loop cost two poll sleeps.
        assert_eq!(
            start.elapsed(),
            Duration::from_millis(2 * DRAIN_POLL_INTERVAL_MS)
        );
        assert_eq!(channel.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_closing_during_drain_fails_the_send() {
        let channel = FakeChannel::new(
            vec![0, BUFFER_HIGH_WATER + 1],
            vec![true, true, false],
        );
        let mut source = MemorySource::new(vec![1u8; 2 * CHUNK_SIZE]);

        let result = send_file(
            &mut source,
            &metadata(2 * CHUNK_SIZE as u64),
            &channel,
            |_, _| {},
        )
        .await;

        assert!(matches!(result, Err(TransferError::ChannelClosed)));
    }

    #[tokio::test]
    async fn file_source_reads_full_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, vec![9u8; CHUNK_SIZE + 17]).await.unwrap();

        let (mut source, metadata) = FileSource::open(&path).await.unwrap();
        assert_eq!(metadata.name, "payload.bin");
        assert_eq!(metadata.size, (CHUNK_SIZE + 17) as u64);

        let first = source.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), CHUNK_SIZE);
        let second = source.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.len(), 17);
        assert!(source.next_chunk().await.unwrap().is_none());
    }
}
