//! Deadline-enforcing stream wrapper.
//!
//! [`TimeoutStream`] arms an absolute deadline of `now + timeout` at the start
//! of every write. The deadline covers both directions: a write still pending
//! when it passes fails, and so does a read. Every read, once it returns
//! (with data or an error), clears the read deadline, so an idle connection
//! with no write outstanding never times out on its own.
//!
//! Caveat: if the peer starts answering before a request has been fully
//! written, the deadline armed by the last write is still in force for the
//! reads that follow and can surface as a spurious read timeout.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::{sleep_until, Instant, Sleep};

/// A stream whose reads and writes are bounded by a deadline armed on write.
#[derive(Debug)]
pub struct TimeoutStream<S> {
    inner: S,
    timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    /// Address and length of the buffer of a write that has been started but
    /// has not returned yet. A poll with any other buffer is a new write, which
    /// covers a caller that dropped a pending write and moved on.
    write_in_flight: Option<(usize, usize)>,
}

impl TimeoutStream<TcpStream> {
    /// Connect to `addr` and wrap the resulting stream.
    pub async fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, timeout))
    }
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            read_deadline: None,
            write_deadline: None,
            write_in_flight: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Whether a read issued now would be bounded by a deadline.
    pub fn has_read_deadline(&self) -> bool {
        self.read_deadline.is_some()
    }

    fn arm(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.read_deadline = Some(Box::pin(sleep_until(deadline)));
        self.write_deadline = Some(Box::pin(sleep_until(deadline)));
    }
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{op} timed out"))
}

/// Poll an optional deadline, reporting `true` once it has passed.
fn expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline.as_mut() {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if expired(&mut this.read_deadline, cx) {
                    this.read_deadline = None;
                    return Poll::Ready(Err(timed_out("read")));
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let write = (buf.as_ptr() as usize, buf.len());
        if this.write_in_flight != Some(write) {
            this.arm();
            this.write_in_flight = Some(write);
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_in_flight = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if expired(&mut this.write_deadline, cx) {
                    this.write_in_flight = None;
                    return Poll::Ready(Err(timed_out("write")));
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
