//! Per-client control session.
//!
//! One `Control` owns one control connection, the tunnels advertised over
//! it, and a pool of pipe sessions. Five cooperating tasks run per
//! session: receiver, sender, pipe-manager, watchdog, and moderator. The
//! moderator is the only place teardown happens; everything else just asks
//! for it by signalling `to_die`.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    codec::{FramedReader, FramedWriter},
    config::ServerConfig,
    hooks::Hooks,
    message::{ClientId, CtlMsg},
    pipe::PipeSession,
    pool::{PipePool, PoolHandle},
    registry::Registry,
    tunnel::{self, TunnelHandle},
};

/// Everything `serve` consumes that cannot live inside the shared
/// `Control`: the receive ends of its channels and the pool state.
pub(crate) struct ServeParts<S: PipeSession> {
    write_rx: mpsc::Receiver<CtlMsg>,
    to_die_rx: mpsc::Receiver<()>,
    pool: PipePool<S>,
}

pub struct Control<S: PipeSession> {
    client_id: ClientId,
    pre_master: Option<Vec<u8>>,
    write_tx: mpsc::Sender<CtlMsg>,
    pool: PoolHandle<S>,
    die: CancellationToken,
    to_die: mpsc::Sender<()>,
    /// Nanoseconds since `started_at` of the last successful inbound read.
    last_read: AtomicU64,
    started_at: Instant,
    pub(crate) tunnels: Mutex<Vec<TunnelHandle>>,
    pub(crate) registry: Arc<Registry<S>>,
    pub(crate) hooks: Hooks,
    pub(crate) config: Arc<ServerConfig>,
}

impl<S: PipeSession> Control<S> {
    pub(crate) fn new(
        client_id: ClientId,
        pre_master: Option<Vec<u8>>,
        registry: Arc<Registry<S>>,
        hooks: Hooks,
        config: Arc<ServerConfig>,
    ) -> (Arc<Self>, ServeParts<S>) {
        let tunables = &config.tunables;
        let (write_tx, write_rx) = mpsc::channel(tunables.write_chan_buffer);
        let (to_die, to_die_rx) = mpsc::channel(1);
        let die = CancellationToken::new();
        let (pool, pool_handle) = PipePool::new(write_tx.clone(), die.clone(), tunables.clone());

        let control = Arc::new(Control {
            client_id,
            pre_master,
            write_tx,
            pool: pool_handle,
            die,
            to_die,
            last_read: AtomicU64::new(0),
            started_at: Instant::now(),
            tunnels: Mutex::new(Vec::new()),
            registry,
            hooks,
            config,
        });
        (
            control,
            ServeParts {
                write_rx,
                to_die_rx,
                pool,
            },
        )
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub(crate) fn pre_master(&self) -> Option<&[u8]> {
        self.pre_master.as_deref()
    }

    /// Ask for teardown. Non-blocking and idempotent; the moderator does
    /// the actual work exactly once.
    pub fn close(&self) {
        let _ = self.to_die.try_send(());
    }

    pub fn is_closed(&self) -> bool {
        self.die.is_cancelled()
    }

    pub(crate) fn die(&self) -> &CancellationToken {
        &self.die
    }

    /// Take a pipe with stream capacity, waiting for one if necessary.
    /// `None` only once the control is dying.
    pub async fn get_pipe(&self) -> Option<Arc<S>> {
        self.pool.get().await
    }

    /// Return a pipe so other consumers can share its remaining capacity.
    /// Also the entry point for freshly handshaken pipes.
    pub async fn put_pipe(&self, session: Arc<S>) {
        self.pool.put(session).await;
    }

    /// Queue a frame for the sender without blocking; under a full queue
    /// the frame is dropped with a log line.
    pub(crate) fn try_enqueue(&self, msg: CtlMsg) {
        if self.write_tx.try_send(msg).is_err() && !self.is_closed() {
            warn!(client_id = %self.client_id, "write queue full, dropping frame");
        }
    }

    pub(crate) async fn enqueue(&self, msg: CtlMsg) {
        let _ = self.write_tx.send(msg).await;
    }

    fn touch(&self) {
        let nanos = self.started_at.elapsed().as_nanos() as u64;
        self.last_read.fetch_max(nanos, Ordering::Relaxed);
    }

    fn since_last_read(&self) -> Duration {
        let elapsed = self.started_at.elapsed().as_nanos() as u64;
        Duration::from_nanos(elapsed.saturating_sub(self.last_read.load(Ordering::Relaxed)))
    }

    /// Start the session's tasks. The handshake has already happened; the
    /// connection's framed halves are handed over here.
    pub(crate) fn serve<R, W>(
        self: Arc<Self>,
        parts: ServeParts<S>,
        reader: FramedReader<R>,
        writer: FramedWriter<W>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.touch();
        tokio::spawn(parts.pool.run());
        tokio::spawn(self.clone().recv_loop(reader));
        tokio::spawn(self.clone().send_loop(writer, parts.write_rx));
        tokio::spawn(self.clone().watchdog());
        tokio::spawn(self.moderator(parts.to_die_rx));
    }

    async fn recv_loop<R>(self: Arc<Self>, mut reader: FramedReader<R>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        loop {
            tokio::select! {
                _ = self.die.cancelled() => break,
                res = reader.next() => match res {
                    Ok(Some(msg)) => {
                        self.touch();
                        match msg {
                            CtlMsg::Ping => self.try_enqueue(CtlMsg::Pong),
                            CtlMsg::Pong => {}
                            CtlMsg::AddTunnels { tunnels } => {
                                let control = self.clone();
                                tokio::spawn(async move {
                                    tunnel::add_tunnels(control, tunnels).await;
                                });
                            }
                            other => {
                                error!(
                                    client_id = %self.client_id,
                                    "unexpected frame on established control: {other:?}"
                                );
                                self.close();
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        trace!(client_id = %self.client_id, "control connection closed by peer");
                        self.close();
                        break;
                    }
                    Err(e) => {
                        error!(client_id = %self.client_id, "control read failed: {e}");
                        self.close();
                        break;
                    }
                }
            }
        }
    }

    async fn send_loop<W>(
        self: Arc<Self>,
        mut writer: FramedWriter<W>,
        mut write_rx: mpsc::Receiver<CtlMsg>,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let coalesce_window = self.config.tunables.ping_interval / 2;
        let mut last_write: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = self.die.cancelled() => break,
                msg = write_rx.recv() => {
                    let Some(msg) = msg else { break };
                    // keepalives piggyback on any recent traffic
                    if msg.is_keepalive() {
                        if let Some(at) = last_write {
                            if at.elapsed() < coalesce_window {
                                continue;
                            }
                        }
                    }
                    if let Err(e) = writer.send(&msg).await {
                        error!(client_id = %self.client_id, "control write failed: {e}");
                        self.close();
                        break;
                    }
                    last_write = Some(Instant::now());
                }
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn watchdog(self: Arc<Self>) {
        let interval = self.config.tunables.ping_interval;
        let timeout = self.config.tunables.ping_timeout;
        let mut tick = time::interval_at(Instant::now() + interval, interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.die.cancelled() => break,
                _ = tick.tick() => {
                    if self.since_last_read() > timeout {
                        warn!(client_id = %self.client_id, "keepalive timeout, closing control");
                        self.close();
                        break;
                    }
                    self.try_enqueue(CtlMsg::Ping);
                }
            }
        }
    }

    /// Waits for the first `close()` and runs the one ordered teardown:
    /// cancel `die` (listeners, receiver, sender, watchdog, and the pool
    /// manager all observe it), withdraw and deregister every tunnel,
    /// deregister the control itself.
    async fn moderator(self: Arc<Self>, mut to_die_rx: mpsc::Receiver<()>) {
        if to_die_rx.recv().await.is_none() {
            return;
        }
        debug!(client_id = %self.client_id, "tearing down control session");
        self.die.cancel();

        let tunnels: Vec<TunnelHandle> = self.tunnels.lock().drain(..).collect();
        for t in tunnels {
            self.registry.remove_tunnel(&t.addr_key);
            if let Some(notify) = &self.hooks.notify {
                if let Err(e) = notify
                    .remove_member(&self.config.domain, &t.public_addr)
                    .await
                {
                    warn!(tunnel = %t.name, "endpoint withdrawal failed: {e}");
                }
            }
        }

        self.registry.remove_control(self.client_id);
        debug!(client_id = %self.client_id, "control session torn down");
    }
}
