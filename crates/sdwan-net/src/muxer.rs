//! Single-producer, many-reader stream fan-out
//!
//! A [`Muxer`] wraps one expensive upstream reader. Every [`MuxReader`]
//! replays the stream from byte zero at its own pace; upstream bytes are read
//! once, appended to a shared buffer, and served from there to everyone else.
//!
//! Readers hold nothing but an offset. The buffer, the upstream reader and the
//! terminal state live behind one read/write lock, so only one physical read
//! from upstream is in flight at a time.

use bytes::Bytes;
use futures::stream::{self, Stream};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;
use tracing::error;

const CHUNK_SIZE: usize = 8 * 1024;

/// Invariant violations inside the multiplexer
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("reader offset {offset} is past the {buffered} buffered bytes")]
    Overrun { offset: usize, buffered: usize },
}

/// How the upstream stream ended
#[derive(Debug, Clone)]
enum Terminal {
    Eof,
    Failed { kind: io::ErrorKind, message: String },
}

impl Terminal {
    fn from_error(err: &io::Error) -> Self {
        Self::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// The error each reader sees once it catches up, `None` for a clean end
    fn to_error(&self) -> Option<io::Error> {
        match self {
            Terminal::Eof => None,
            Terminal::Failed { kind, message } => Some(io::Error::new(*kind, message.clone())),
        }
    }
}

struct State {
    source: Box<dyn AsyncRead + Send + Sync + Unpin>,
    buffer: Vec<u8>,
    terminal: Option<Terminal>,
}

/// Shared buffer over one upstream reader
pub struct Muxer {
    state: RwLock<State>,
}

impl Muxer {
    /// Wrap an upstream reader. Nothing is read until a handle asks for bytes.
    pub fn new<R>(source: R) -> Arc<Self>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        Arc::new(Self {
            state: RwLock::new(State {
                source: Box::new(source),
                buffer: Vec::new(),
                terminal: None,
            }),
        })
    }

    /// New handle positioned at the start of the stream
    pub fn reader(self: &Arc<Self>) -> MuxReader {
        MuxReader {
            muxer: Arc::clone(self),
            offset: 0,
        }
    }

    /// Whether upstream has ended (cleanly or with an error)
    pub async fn eof(&self) -> bool {
        self.state.read().await.terminal.is_some()
    }

    /// Bytes buffered so far
    pub async fn buffered(&self) -> usize {
        self.state.read().await.buffer.len()
    }
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer").finish_non_exhaustive()
    }
}

/// Independent cursor into a [`Muxer`]
#[derive(Debug)]
pub struct MuxReader {
    muxer: Arc<Muxer>,
    offset: usize,
}

impl MuxReader {
    /// Read into `dst`.
    ///
    /// Buffered bytes are served first. Only when this handle has caught up
    /// with the buffer and `dst` still has room does it pull from upstream.
    /// Returns `Ok(0)` at end of stream. An upstream error is returned to
    /// every handle once it has consumed the bytes that preceded it.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut state = self.muxer.state.write().await;

        let buffered = state.buffer.len();
        if self.offset > buffered {
            let err = MuxError::Overrun {
                offset: self.offset,
                buffered,
            };
            error!("muxer invariant broken: {}", err);
            return Err(io::Error::new(io::ErrorKind::Other, err));
        }

        let copied = (buffered - self.offset).min(dst.len());
        dst[..copied].copy_from_slice(&state.buffer[self.offset..self.offset + copied]);
        self.offset += copied;

        if copied == dst.len() {
            return Ok(copied);
        }

        // caught up with everything buffered and dst still has room
        if let Some(terminal) = &state.terminal {
            return match terminal.to_error() {
                Some(err) if copied == 0 => Err(err),
                _ => Ok(copied),
            };
        }

        let State {
            source,
            buffer,
            terminal,
        } = &mut *state;
        match source.read(&mut dst[copied..]).await {
            Ok(0) => {
                *terminal = Some(Terminal::Eof);
                Ok(copied)
            }
            Ok(read) => {
                buffer.extend_from_slice(&dst[copied..copied + read]);
                self.offset += read;
                Ok(copied + read)
            }
            Err(err) => {
                *terminal = Some(Terminal::from_error(&err));
                if copied > 0 {
                    Ok(copied)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Read until end of stream, appending to `out`
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut total = 0;
        loop {
            match self.read(&mut chunk).await? {
                0 => return Ok(total),
                n => {
                    out.extend_from_slice(&chunk[..n]);
                    total += n;
                }
            }
        }
    }

    /// Turn this handle into a stream of chunks, suitable for a response body
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            let mut chunk = vec![0u8; CHUNK_SIZE];
            match reader.read(&mut chunk).await {
                Ok(0) => None,
                Ok(n) => {
                    chunk.truncate(n);
                    Some((Ok(Bytes::from(chunk)), Some(reader)))
                }
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, ReadBuf};

    fn payload() -> Vec<u8> {
        (0..20_000u32).map(|i| (i % 251) as u8).collect()
    }

    /// Upstream that counts how many bytes were pulled from it
    struct Counting {
        data: Vec<u8>,
        pos: usize,
        pulled: Arc<AtomicUsize>,
    }

    impl AsyncRead for Counting {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let n = (self.data.len() - self.pos).min(buf.remaining()).min(777);
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            self.pulled.fetch_add(n, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    /// Upstream that yields some bytes and then fails
    struct Failing {
        sent: bool,
    }

    impl AsyncRead for Failing {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.sent {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "producer died")));
            }
            self.sent = true;
            buf.put_slice(b"partial");
            Poll::Ready(Ok(()))
        }
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_handles_cross_tasks() {
        assert_send_sync::<Muxer>();
        assert_send_sync::<Arc<Muxer>>();
        assert_send_sync::<MuxReader>();
    }

    #[tokio::test]
    async fn test_readers_replay_same_bytes() {
        let (mut writer, reader) = tokio::io::duplex(512);
        let muxer = Muxer::new(reader);
        let expected = payload();

        let mut handles = Vec::new();
        for (i, size) in [1usize, 7, 64, 4096].into_iter().enumerate() {
            let mut handle = muxer.reader();
            handles.push(tokio::spawn(async move {
                let mut out = Vec::new();
                let mut chunk = vec![0u8; size];
                loop {
                    let n = handle.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&chunk[..n]);
                    if i % 2 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                out
            }));
        }

        let data = expected.clone();
        let producer = tokio::spawn(async move {
            for piece in data.chunks(1000) {
                writer.write_all(piece).await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        producer.await.unwrap();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), expected);
        }
        assert!(muxer.eof().await);
    }

    #[tokio::test]
    async fn test_upstream_read_once() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let data = payload();
        let muxer = Muxer::new(Counting {
            data: data.clone(),
            pos: 0,
            pulled: pulled.clone(),
        });

        for _ in 0..5 {
            let mut out = Vec::new();
            muxer.reader().read_to_end(&mut out).await.unwrap();
            assert_eq!(out, data);
        }
        assert_eq!(pulled.load(Ordering::SeqCst), data.len());
        assert_eq!(muxer.buffered().await, data.len());
    }

    #[tokio::test]
    async fn test_eof_only_after_source_ends() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let muxer = Muxer::new(reader);
        let mut handle = muxer.reader();

        writer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(handle.read(&mut buf).await.unwrap(), 5);
        assert!(!muxer.eof().await);

        drop(writer);
        let mut rest = Vec::new();
        handle.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(muxer.eof().await);
    }

    #[tokio::test]
    async fn test_error_replayed_after_bytes() {
        let muxer = Muxer::new(Failing { sent: false });

        for _ in 0..2 {
            let mut handle = muxer.reader();
            let mut buf = [0u8; 64];
            let n = handle.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"partial");
            let err = handle.read(&mut buf).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        }
        assert!(muxer.eof().await);
    }

    #[tokio::test]
    async fn test_overrun_is_an_error() {
        let muxer = Muxer::new(tokio::io::empty());
        let mut handle = muxer.reader();
        handle.offset = 10;

        let mut buf = [0u8; 4];
        let err = handle.read(&mut buf).await.unwrap_err();
        assert!(err.get_ref().unwrap().is::<MuxError>());
    }

    #[tokio::test]
    async fn test_stream_yields_whole_payload() {
        let data = payload();
        let muxer = Muxer::new(std::io::Cursor::new(data.clone()));
        let chunks: Vec<Bytes> = muxer
            .reader()
            .into_stream()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.concat(), data);
    }
}
