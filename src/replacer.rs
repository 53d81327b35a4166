//! Streaming byte-sequence substitution.
//!
//! [`Replacer`] copies bytes from an [`AsyncRead`] to an [`AsyncWrite`],
//! replacing every non-overlapping occurrence of `old` with `new`. Matches
//! that straddle a buffer refill are handled by holding back the last
//! `old.len() + BOUNDARY_MARGIN` bytes of each fill until more input arrives,
//! so the output never depends on how the source happens to chunk its reads.
//!
//! [`Replacer::rewrite`] runs the copy on its own task behind an in-memory
//! pipe and hands back a [`RewriteStream`] immediately. Copy failures travel
//! to the reader through a completion channel and surface as the final item
//! of the stream; they never take down the process. Dropping the stream
//! stops the copy and releases the source straight away, even while the copy
//! is parked on a read.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::Stream;
use memchr::memmem;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

/// Working buffer size used when none is configured (1 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 20;

/// Extra bytes held back past `old.len()` at every fill boundary. Covers the
/// widest multi-byte character with some slack.
pub const BOUNDARY_MARGIN: usize = 10;

/// Capacity of the in-memory pipe between the copy task and its reader.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Errors raised by a replace operation.
#[derive(Debug)]
pub enum ReplaceError {
    /// The working buffer cannot hold three boundary windows.
    BufferTooSmall { size: usize, min: usize },
    /// Reading the source or writing the sink failed.
    Io(io::Error),
}

impl fmt::Display for ReplaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall { size, min } => write!(
                f,
                "not enough memory allocated for replacement buffer ({size} bytes, need {min})"
            ),
            Self::Io(e) => write!(f, "replacement stream failed - {e}"),
        }
    }
}

impl std::error::Error for ReplaceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::BufferTooSmall { .. } => None,
        }
    }
}

impl From<io::Error> for ReplaceError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ReplaceError> for io::Error {
    fn from(e: ReplaceError) -> Self {
        match e {
            ReplaceError::Io(inner) => inner,
            other @ ReplaceError::BufferTooSmall { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, other.to_string())
            }
        }
    }
}

/// A literal `old` → `new` substitution with its working buffer size.
///
/// Not meant to be shared between concurrent streams: [`Replacer::reverse`]
/// mutates it in place. Clone one per request direction instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacer {
    old: Vec<u8>,
    new: Vec<u8>,
    buffer_size: usize,
}

impl Replacer {
    pub fn new(old: impl Into<Vec<u8>>, new: impl Into<Vec<u8>>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Set the working buffer size. Zero selects [`DEFAULT_BUFFER_SIZE`].
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = if size == 0 { DEFAULT_BUFFER_SIZE } else { size };
        self
    }

    pub fn old(&self) -> &[u8] {
        &self.old
    }

    pub fn new_bytes(&self) -> &[u8] {
        &self.new
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Swap `old` and `new`.
    pub fn reverse(&mut self) {
        std::mem::swap(&mut self.old, &mut self.new);
    }

    /// Smallest buffer that leaves room to refill after holding back a
    /// boundary window.
    pub fn min_buffer_size(&self) -> usize {
        3 * (self.old.len() + BOUNDARY_MARGIN)
    }

    /// Reject a buffer size below [`Replacer::min_buffer_size`].
    pub fn check(&self) -> Result<(), ReplaceError> {
        let min = self.min_buffer_size();
        if self.buffer_size < min {
            return Err(ReplaceError::BufferTooSmall {
                size: self.buffer_size,
                min,
            });
        }
        Ok(())
    }

    /// Substitute within an in-memory slice.
    pub fn replace_bytes(&self, data: &[u8]) -> Vec<u8> {
        replace_all(data, &self.old, &self.new)
    }

    /// Substitute within a string. Returns `None` if the result is not UTF-8,
    /// which can only happen when `old` or `new` splits a character.
    pub fn replace_str(&self, data: &str) -> Option<String> {
        String::from_utf8(self.replace_bytes(data.as_bytes())).ok()
    }

    /// Copy `source` into `sink` with every occurrence of `old` replaced.
    /// Returns the number of bytes written to `sink`.
    ///
    /// Fails with [`ReplaceError::BufferTooSmall`] before touching either
    /// side if the buffer size is below the minimum.
    pub async fn replace<R, W>(&self, source: &mut R, sink: &mut W) -> Result<u64, ReplaceError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.check()?;

        if self.old.is_empty() {
            let copied = tokio::io::copy(source, sink).await?;
            sink.flush().await?;
            return Ok(copied);
        }

        let hold = self.old.len() + BOUNDARY_MARGIN;
        let mut data = vec![0u8; self.buffer_size];
        let mut written: u64 = 0;
        // data[start..end] is read but not yet written
        let mut start = 0;
        let mut end = 0;

        loop {
            if start > 0 {
                data.copy_within(start..end, 0);
                end -= start;
                start = 0;
            }

            let read = source.read(&mut data[end..]).await?;
            if read == 0 {
                break;
            }
            end += read;

            while start + hold < end {
                if let Some(pos) = memmem::find(&data[start..end], &self.old) {
                    written += write_whole(sink, &data[start..start + pos]).await?;
                    written += write_whole(sink, &self.new).await?;
                    start += pos + self.old.len();
                } else {
                    // anything past this point may still begin a match
                    let keep = end - hold;
                    written += write_whole(sink, &data[start..keep]).await?;
                    start = keep;
                    break;
                }
            }
        }

        let tail = self.replace_bytes(&data[start..end]);
        written += write_whole(sink, &tail).await?;
        sink.flush().await?;
        Ok(written)
    }

    /// Run [`Replacer::replace`] on its own task and return the rewritten
    /// bytes as a stream.
    ///
    /// The stream yields every substituted byte, then at most one error if
    /// the copy failed, then ends. Dropping the stream cancels the copy and
    /// drops `source`.
    pub fn rewrite<R>(self, source: R) -> Result<RewriteStream, ReplaceError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.check()?;

        let (reader, mut writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let stop = CancellationToken::new();

        let stopped = stop.clone();
        tokio::spawn(async move {
            let mut source = source;
            let result = tokio::select! {
                res = self.replace(&mut source, &mut writer) => res,
                () = stopped.cancelled() => Err(ReplaceError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "rewrite stream reader went away",
                ))),
            };
            drop(source);
            match &result {
                Ok(bytes) => debug!(bytes, "rewrite stream finished"),
                Err(e) => debug!("rewrite stream failed: {e}"),
            }
            let _ = writer.shutdown().await;
            drop(writer);
            let _ = done_tx.send(result.map(|_| ()));
        });

        Ok(RewriteStream {
            inner: ReaderStream::new(reader),
            done: Some(done_rx),
            _stop: stop.drop_guard(),
        })
    }
}

/// Reading half of a [`Replacer::rewrite`] pipe.
pub struct RewriteStream {
    inner: ReaderStream<DuplexStream>,
    done: Option<oneshot::Receiver<Result<(), ReplaceError>>>,
    _stop: DropGuard,
}

impl Stream for RewriteStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.done.is_none() {
            return Poll::Ready(None);
        }

        if let Some(chunk) = ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            return Poll::Ready(Some(chunk));
        }

        // pipe drained: report how the copy ended, exactly once
        let Some(done) = this.done.as_mut() else {
            return Poll::Ready(None);
        };
        let outcome = ready!(Pin::new(done).poll(cx));
        this.done = None;
        match outcome {
            Ok(Ok(())) => Poll::Ready(None),
            Ok(Err(e)) => Poll::Ready(Some(Err(e.into()))),
            Err(_) => Poll::Ready(Some(Err(io::Error::other(
                "rewrite task ended without reporting",
            )))),
        }
    }
}

async fn write_whole<W>(sink: &mut W, data: &[u8]) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if data.is_empty() {
        return Ok(0);
    }
    sink.write_all(data).await?;
    Ok(data.len() as u64)
}

/// Replace every non-overlapping occurrence of `old`, scanning left to right.
pub(crate) fn replace_all(data: &[u8], old: &[u8], new: &[u8]) -> Vec<u8> {
    if old.is_empty() {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len());
    let mut rest = data;
    let finder = memmem::Finder::new(old);
    while let Some(pos) = finder.find(rest) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(new);
        rest = &rest[pos + old.len()..];
    }
    out.extend_from_slice(rest);
    out
}
