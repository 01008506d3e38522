//! Bounded reads from an open engine stream

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_stream::Stream;

/// Default size of a single read
pub const DEFAULT_READ_SIZE: usize = 8 * 1024;

/// What one wake-up produced
#[derive(Debug)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    Eof,
    Failed(io::Error),
}

/// Turns a reader into a stream of reads of at most `read_size` bytes.
/// Ends after yielding `Eof` or `Failed`.
pub struct ReadStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    buf: Vec<u8>,
    done: bool,
}

impl ReadStream {
    pub fn new(reader: Box<dyn AsyncRead + Send + Unpin>, read_size: usize) -> Self {
        Self {
            reader,
            buf: vec![0; read_size.max(1)],
            done: false,
        }
    }
}

impl Stream for ReadStream {
    type Item = ReadOutcome;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let mut read_buf = ReadBuf::new(&mut this.buf);
        match Pin::new(&mut this.reader).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) if read_buf.filled().is_empty() => {
                this.done = true;
                Poll::Ready(Some(ReadOutcome::Eof))
            }
            Poll::Ready(Ok(())) => Poll::Ready(Some(ReadOutcome::Data(read_buf.filled().to_vec()))),
            Poll::Ready(Err(e)) => {
                this.done = true;
                Poll::Ready(Some(ReadOutcome::Failed(e)))
            }
        }
    }
}
