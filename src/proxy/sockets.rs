//! Socket tracking for relay operations
//!
//! Every stream opened on behalf of one logical operation (a forwarded
//! request, a tunnel, a MITM session) is registered in a [`TunnelSocketSet`].
//! Closing or dropping the set force-closes every stream it tracks, so a
//! failure on one leg never leaves the other leg dangling.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

struct SocketEntry {
    label: String,
    closed: AtomicBool,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
}

impl SocketEntry {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            trace!(socket = %self.label, "Force-closing socket");
        }
        self.read_waker.wake();
        self.write_waker.wake();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct SetInner {
    name: String,
    closed: AtomicBool,
    entries: Mutex<HashMap<u64, Arc<SocketEntry>>>,
    parent: Option<Arc<SetInner>>,
}

impl SetInner {
    fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let entries: Vec<Arc<SocketEntry>> = self.entries.lock().values().cloned().collect();
        for entry in entries {
            entry.close();
        }
    }
}

impl Drop for SetInner {
    fn drop(&mut self) {
        for entry in self.entries.get_mut().values() {
            entry.close();
        }
    }
}

/// Set of streams tied to one logical operation
///
/// Cloning shares the set. The streams are closed when [`close_all`] is
/// called or when the last clone is dropped.
///
/// [`close_all`]: TunnelSocketSet::close_all
#[derive(Clone)]
pub struct TunnelSocketSet {
    inner: Arc<SetInner>,
}

impl TunnelSocketSet {
    /// Create a standalone set
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SetInner {
                name: name.into(),
                closed: AtomicBool::new(false),
                entries: Mutex::new(HashMap::new()),
                parent: None,
            }),
        }
    }

    /// Create a set whose streams are also registered in this one
    ///
    /// Used with a server-wide registry so shutdown can close everything.
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SetInner {
                name: name.into(),
                closed: AtomicBool::new(self.is_closed()),
                entries: Mutex::new(HashMap::new()),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a stream. The returned wrapper fails every pending and future
    /// operation with `ConnectionAborted` once the set is closed.
    pub fn track<S>(&self, stream: S, label: impl Into<String>) -> Tracked<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(SocketEntry {
            label: label.into(),
            closed: AtomicBool::new(false),
            read_waker: AtomicWaker::new(),
            write_waker: AtomicWaker::new(),
        });

        let mut owners = Vec::with_capacity(2);
        let mut current = Some(&self.inner);
        while let Some(set) = current {
            set.entries.lock().insert(id, entry.clone());
            owners.push(Arc::downgrade(set));
            if set.closed.load(Ordering::Acquire) {
                entry.close();
            }
            current = set.parent.as_ref();
        }

        trace!(set = %self.inner.name, socket = %entry.label, "Socket tracked");

        Tracked {
            inner: Some(stream),
            id,
            entry,
            owners,
        }
    }

    /// Close every tracked stream. Streams tracked afterwards start closed.
    pub fn close_all(&self) {
        self.inner.close_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of live streams tracked by this set (including children's)
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TunnelSocketSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSocketSet")
            .field("name", &self.inner.name)
            .field("sockets", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "socket closed by relay")
}

/// Stream registered in a [`TunnelSocketSet`]
pub struct Tracked<S> {
    inner: Option<S>,
    id: u64,
    entry: Arc<SocketEntry>,
    owners: Vec<Weak<SetInner>>,
}

impl<S> Tracked<S> {
    pub fn is_closed(&self) -> bool {
        self.entry.is_closed()
    }

    /// Access the wrapped stream while it is still open
    pub fn get_ref(&self) -> Option<&S> {
        self.inner.as_ref()
    }

    /// Release the underlying stream once the relay closed it
    fn check_closed(&mut self) -> bool {
        if self.entry.is_closed() {
            self.inner = None;
            true
        } else {
            false
        }
    }
}

impl<S> Drop for Tracked<S> {
    fn drop(&mut self) {
        for owner in &self.owners {
            if let Some(set) = owner.upgrade() {
                set.entries.lock().remove(&self.id);
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.entry.read_waker.register(cx.waker());
        if this.check_closed() {
            return Poll::Ready(Err(aborted()));
        }
        match this.inner.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(aborted())),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.entry.write_waker.register(cx.waker());
        if this.check_closed() {
            return Poll::Ready(Err(aborted()));
        }
        match this.inner.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(aborted())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.entry.write_waker.register(cx.waker());
        if this.check_closed() {
            return Poll::Ready(Err(aborted()));
        }
        match this.inner.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Err(aborted())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.check_closed() {
            return Poll::Ready(Ok(()));
        }
        match this.inner.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
