//! Buffer model and the read/write capabilities a session owns.
//!
//! A [`MultiBuffer`] is an ordered list of byte chunks, each at most
//! [`BUFFER_SIZE`] bytes. Readers hand out one multi-buffer per call; an empty
//! multi-buffer means end of stream.

use crate::error::{MuxError, MuxResult};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;

/// Maximum size of a single chunk.
pub const BUFFER_SIZE: usize = 2048;

/// An ordered list of byte chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiBuffer {
    chunks: Vec<Vec<u8>>,
}

impl MultiBuffer {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    /// Copy `data` into chunks of at most [`BUFFER_SIZE`] bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            chunks: data.chunks(BUFFER_SIZE).map(<[u8]>::to_vec).collect(),
        }
    }

    /// Append a chunk. Empty chunks are skipped.
    pub fn push(&mut self, chunk: Vec<u8>) {
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    /// Total number of bytes across all chunks.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    /// Concatenate all chunks into one contiguous vector.
    pub fn into_bytes(self) -> Vec<u8> {
        self.chunks.concat()
    }
}

impl From<Vec<u8>> for MultiBuffer {
    fn from(data: Vec<u8>) -> Self {
        if data.len() <= BUFFER_SIZE {
            let mut mb = Self::new();
            mb.push(data);
            mb
        } else {
            Self::from_bytes(&data)
        }
    }
}

/// Source half of a session: yields multi-buffers until end of stream.
pub trait Reader: Send {
    /// Read the next multi-buffer. An empty multi-buffer means end of stream.
    fn read_multi_buffer(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = MuxResult<MultiBuffer>> + Send + '_>>;

    /// Close this reader and release its resources.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>>;
}

/// Sink half of a session.
pub trait Writer: Send {
    /// Write one multi-buffer.
    fn write_multi_buffer(
        &mut self,
        mb: MultiBuffer,
    ) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>>;

    /// Close this writer and release its resources.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>>;
}

/// The reader/writer pair owned by one session.
pub struct Link {
    pub reader: Box<dyn Reader>,
    pub writer: Box<dyn Writer>,
}

impl Link {
    pub fn new(reader: impl Reader + 'static, writer: impl Writer + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Buffered view over the raw multiplexed byte source.
///
/// The read adapters borrow it for the duration of one chunk so the frame
/// reader can continue from the same position afterwards.
#[derive(Debug)]
pub struct BufferedReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin + Send> BufferedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Read a big-endian `u16`.
    pub async fn read_u16(&mut self) -> MuxResult<u16> {
        Ok(self.inner.read_u16().await?)
    }

    /// Read exactly `n` bytes into a single chunk.
    pub async fn read_chunk(&mut self, n: usize) -> MuxResult<Vec<u8>> {
        let mut chunk = vec![0u8; n];
        self.inner.read_exact(&mut chunk).await?;
        Ok(chunk)
    }

    /// Read one chunk of `min(n, BUFFER_SIZE)` bytes.
    pub async fn read_at_most(&mut self, n: usize) -> MuxResult<MultiBuffer> {
        let chunk = self.read_chunk(n.min(BUFFER_SIZE)).await?;
        let mut mb = MultiBuffer::new();
        mb.push(chunk);
        Ok(mb)
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

/// Create an in-memory reader/writer pair connected by a bounded queue of
/// `capacity` multi-buffers.
pub fn pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PipeReader { rx, closed: false },
        PipeWriter { tx: Some(tx) },
    )
}

/// Reading end of a [`pipe`].
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<MultiBuffer>,
    closed: bool,
}

impl PipeReader {
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Reader for PipeReader {
    fn read_multi_buffer(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = MuxResult<MultiBuffer>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Err(MuxError::PipeClosed);
            }
            // Writer dropped = EOF
            Ok(self.rx.recv().await.unwrap_or_default())
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>> {
        Box::pin(async move {
            self.closed = true;
            self.rx.close();
            Ok(())
        })
    }
}

/// Writing end of a [`pipe`].
#[derive(Debug)]
pub struct PipeWriter {
    tx: Option<mpsc::Sender<MultiBuffer>>,
}

impl PipeWriter {
    /// Whether this end was closed or the reading end went away.
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, mpsc::Sender::is_closed)
    }
}

impl Writer for PipeWriter {
    fn write_multi_buffer(
        &mut self,
        mb: MultiBuffer,
    ) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>> {
        Box::pin(async move {
            let tx = self.tx.as_ref().ok_or(MuxError::PipeClosed)?;
            if mb.is_empty() {
                return Ok(());
            }
            tx.send(mb).await.map_err(|_| MuxError::PipeClosed)
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>> {
        Box::pin(async move {
            self.tx = None;
            Ok(())
        })
    }
}
