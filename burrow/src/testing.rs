//! In-crate mock collaborators for tests.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::DuplexStream;

use crate::{
    error::BoxError,
    hooks::{Auth, Cipher, Notify},
    message::ClientId,
    pipe::{BoxPipeIo, MakePipeSession, PipeSession},
};

/// A mux session backed by in-memory duplex streams. Cheap to clone; all
/// clones share the same state, so the maker can keep a handle to sessions
/// it produced.
#[derive(Clone, Default)]
pub(crate) struct MockSession {
    inner: Arc<MockSessionInner>,
}

#[derive(Default)]
struct MockSessionInner {
    closed: AtomicBool,
    streams: AtomicUsize,
    // far ends of opened streams, in open order
    peers: Mutex<Vec<DuplexStream>>,
    labels: Mutex<Vec<String>>,
}

impl MockSession {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Pretend `n` streams are open without going through `open_stream`.
    pub(crate) fn set_streams(&self, n: usize) {
        self.inner.streams.store(n, Ordering::SeqCst);
    }

    pub(crate) fn release_stream(&self) {
        self.inner.streams.fetch_sub(1, Ordering::SeqCst);
    }

    /// Far end of the oldest not-yet-taken stream.
    pub(crate) fn take_peer(&self) -> Option<DuplexStream> {
        let mut peers = self.inner.peers.lock();
        if peers.is_empty() {
            None
        } else {
            Some(peers.remove(0))
        }
    }

    pub(crate) fn labels(&self) -> Vec<String> {
        self.inner.labels.lock().clone()
    }
}

impl PipeSession for MockSession {
    type Stream = DuplexStream;

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn num_streams(&self) -> usize {
        self.inner.streams.load(Ordering::SeqCst)
    }

    async fn open_stream(&self, label: &str) -> io::Result<DuplexStream> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }
        self.inner.streams.fetch_add(1, Ordering::SeqCst);
        self.inner.labels.lock().push(label.to_string());
        let (near, far) = tokio::io::duplex(16 * 1024);
        self.inner.peers.lock().push(far);
        Ok(near)
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

/// Builds `MockSession`s and remembers them. The handshaken pipe
/// connection is parked so the far end stays open for the test's lifetime.
#[derive(Clone, Default)]
pub(crate) struct MockMaker {
    inner: Arc<MockMakerInner>,
}

#[derive(Default)]
struct MockMakerInner {
    sessions: Mutex<Vec<MockSession>>,
    conns: Mutex<Vec<BoxPipeIo>>,
}

impl MockMaker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn sessions(&self) -> Vec<MockSession> {
        self.inner.sessions.lock().clone()
    }
}

impl MakePipeSession for MockMaker {
    type Session = MockSession;

    async fn make_session(
        &self,
        io: BoxPipeIo,
        _max_recv_buffer: usize,
    ) -> io::Result<MockSession> {
        let session = MockSession::new();
        self.inner.sessions.lock().push(session.clone());
        self.inner.conns.lock().push(io);
        Ok(session)
    }
}

/// Accepts exactly one token.
pub(crate) struct TestAuth {
    pub(crate) token: &'static str,
}

impl Auth for TestAuth {
    fn check<'a>(&'a self, token: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { token == self.token })
    }
}

/// A cipher that records what it was asked to do and leaves the bytes
/// alone.
#[derive(Default)]
pub(crate) struct TestCipher {
    pub(crate) derived_keys: Mutex<Vec<[u8; 16]>>,
    pub(crate) wrapped: AtomicUsize,
}

impl Cipher for TestCipher {
    fn exchange(&self, client_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>), BoxError> {
        if client_key.is_empty() {
            return Err("empty client key".into());
        }
        Ok((b"server-public".to_vec(), b"pre-master".to_vec()))
    }

    fn session_key(&self, pre_master: &[u8], _client_id: ClientId, nonce: &[u8; 16]) -> [u8; 16] {
        let mut key = *nonce;
        for (k, b) in key.iter_mut().zip(pre_master.iter().cycle()) {
            *k ^= b;
        }
        self.derived_keys.lock().push(key);
        key
    }

    fn wrap(&self, io: BoxPipeIo, _key: [u8; 16]) -> BoxPipeIo {
        self.wrapped.fetch_add(1, Ordering::SeqCst);
        io
    }
}

/// Records every membership change it is told about.
#[derive(Default)]
pub(crate) struct RecordingNotify {
    pub(crate) added: Mutex<Vec<(String, String)>>,
    pub(crate) removed: Mutex<Vec<(String, String)>>,
}

impl Notify for RecordingNotify {
    fn add_member<'a>(
        &'a self,
        domain: &'a str,
        public_addr: &'a str,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move {
            self.added
                .lock()
                .push((domain.to_string(), public_addr.to_string()));
            Ok(())
        })
    }

    fn remove_member<'a>(
        &'a self,
        domain: &'a str,
        public_addr: &'a str,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move {
            self.removed
                .lock()
                .push((domain.to_string(), public_addr.to_string()));
            Ok(())
        })
    }
}
