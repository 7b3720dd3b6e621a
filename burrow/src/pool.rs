//! Per-control pipe pool.
//!
//! All idle/busy bookkeeping lives in one pipe-manager task; consumers and
//! the pipe handshake talk to it over two rendezvous channels, so no lock
//! ever guards the lists. The manager runs a two-phase loop: *prepare*
//! (make sure a usable pipe is in hand, asking the client for a new one
//! when the pool is dry) and *available* (hand the pipe to a waiting
//! consumer or absorb arrivals until someone wants it).
//!
//! Sharing is gated by capacity, not exclusivity: a consumer takes a pipe,
//! opens one stream, and immediately returns it, so a single pipe serves up
//! to `max_streams` concurrent streams.

use std::{collections::VecDeque, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot},
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{config::Tunables, message::CtlMsg, pipe::PipeSession};

/// Consumer-side face of the pool. Cloned into every stream dispatcher and
/// the pipe handshake path.
pub(crate) struct PoolHandle<S: PipeSession> {
    add_tx: mpsc::Sender<Arc<S>>,
    get_tx: mpsc::Sender<oneshot::Sender<Arc<S>>>,
}

impl<S: PipeSession> Clone for PoolHandle<S> {
    fn clone(&self) -> Self {
        PoolHandle {
            add_tx: self.add_tx.clone(),
            get_tx: self.get_tx.clone(),
        }
    }
}

impl<S: PipeSession> PoolHandle<S> {
    /// Hand a pipe to the pool. If the control is dying the pool is gone
    /// and the pipe is closed instead; the caller never sees an error.
    pub(crate) async fn put(&self, session: Arc<S>) {
        if let Err(mpsc::error::SendError(session)) = self.add_tx.send(session).await {
            trace!("pool is gone, closing returned pipe");
            session.close().await;
        }
    }

    /// Block until a pipe with stream capacity is available. `None` only
    /// when the control died; waiters are served in arrival order.
    pub(crate) async fn get(&self) -> Option<Arc<S>> {
        let (tx, rx) = oneshot::channel();
        self.get_tx.send(tx).await.ok()?;
        rx.await.ok()
    }
}

pub(crate) struct PipePool<S: PipeSession> {
    // newest idle pipe sits at the front
    idle: VecDeque<Arc<S>>,
    busy: Vec<Arc<S>>,
    add_rx: mpsc::Receiver<Arc<S>>,
    get_rx: mpsc::Receiver<oneshot::Sender<Arc<S>>>,
    write_tx: mpsc::Sender<CtlMsg>,
    die: CancellationToken,
    tunables: Tunables,
}

impl<S: PipeSession> PipePool<S> {
    pub(crate) fn new(
        write_tx: mpsc::Sender<CtlMsg>,
        die: CancellationToken,
        tunables: Tunables,
    ) -> (Self, PoolHandle<S>) {
        let (add_tx, add_rx) = mpsc::channel(1);
        let (get_tx, get_rx) = mpsc::channel(1);
        let pool = PipePool {
            idle: VecDeque::new(),
            busy: Vec::new(),
            add_rx,
            get_rx,
            write_tx,
            die,
            tunables,
        };
        (pool, PoolHandle { add_tx, get_tx })
    }

    /// The pipe-manager task.
    pub(crate) async fn run(mut self) {
        let mut clean_tick = time::interval_at(
            time::Instant::now() + self.tunables.clean_interval,
            self.tunables.clean_interval,
        );
        clean_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut available: Option<Arc<S>> = None;

        loop {
            let Some(pipe) = available.take() else {
                // prepare phase
                if let Some(p) = self.take_idle() {
                    available = Some(p);
                    continue;
                }
                self.clean().await;
                if let Some(p) = self.take_idle() {
                    available = Some(p);
                    continue;
                }
                self.request_pipe();
                let deadline = time::sleep(self.tunables.pipe_req_timeout);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = self.die.cancelled() => return self.shutdown(None).await,
                        arrived = self.add_rx.recv() => match arrived {
                            Some(p) if self.usable(&p) => { available = Some(p); break; }
                            Some(p) => self.absorb(p),
                            None => return self.shutdown(None).await,
                        },
                        _ = clean_tick.tick() => {
                            self.clean().await;
                            if let Some(p) = self.take_idle() {
                                available = Some(p);
                                break;
                            }
                        }
                        // ask again on the next prepare cycle
                        _ = &mut deadline => break,
                    }
                }
                continue;
            };

            // available phase: revalidate what we hold, then dispatch
            if pipe.is_closed() {
                continue;
            }
            if !self.usable(&pipe) {
                self.busy.push(pipe);
                continue;
            }
            tokio::select! {
                _ = self.die.cancelled() => return self.shutdown(Some(pipe)).await,
                waiter = self.get_rx.recv() => match waiter {
                    Some(tx) => {
                        if let Err(p) = tx.send(pipe) {
                            // consumer gave up while queued
                            available = Some(p);
                        }
                    }
                    None => return self.shutdown(Some(pipe)).await,
                },
                arrived = self.add_rx.recv() => match arrived {
                    Some(p) => {
                        self.absorb(p);
                        available = Some(pipe);
                    }
                    None => return self.shutdown(Some(pipe)).await,
                },
                _ = clean_tick.tick() => {
                    self.clean().await;
                    available = Some(pipe);
                }
            }
        }
    }

    fn usable(&self, pipe: &Arc<S>) -> bool {
        !pipe.is_closed() && pipe.num_streams() < self.tunables.max_streams
    }

    /// Pop the newest idle pipe, detaching closed ones along the way.
    fn take_idle(&mut self) -> Option<Arc<S>> {
        while let Some(pipe) = self.idle.pop_front() {
            if pipe.is_closed() {
                continue;
            }
            if pipe.num_streams() < self.tunables.max_streams {
                return Some(pipe);
            }
            self.busy.push(pipe);
        }
        None
    }

    /// File an arriving pipe into idle or busy by capacity.
    fn absorb(&mut self, pipe: Arc<S>) {
        if pipe.is_closed() {
            return;
        }
        if pipe.num_streams() < self.tunables.max_streams {
            self.idle.push_front(pipe);
        } else {
            self.busy.push(pipe);
        }
    }

    /// Bookkeeping pass: drop closed entries from both lists, promote busy
    /// pipes whose stream count dropped below the cap, and close surplus
    /// idle pipes that carry no streams.
    async fn clean(&mut self) {
        let max_streams = self.tunables.max_streams;
        let busy = std::mem::take(&mut self.busy);
        for pipe in busy {
            if pipe.is_closed() {
                continue;
            }
            if pipe.num_streams() < max_streams {
                self.idle.push_front(pipe);
            } else {
                self.busy.push(pipe);
            }
        }
        self.idle.retain(|pipe| !pipe.is_closed());

        // evict from the oldest end first
        let mut i = self.idle.len();
        while self.idle.len() > self.tunables.max_idle_pipes && i > 0 {
            i -= 1;
            if self.idle[i].num_streams() == 0 {
                if let Some(pipe) = self.idle.remove(i) {
                    trace!("evicting surplus idle pipe");
                    pipe.close().await;
                }
            }
        }
    }

    /// Ask the client for one more pipe. The write queue dropping the
    /// request is survivable: the next dry prepare cycle asks again.
    fn request_pipe(&self) {
        trace!("pool dry, requesting a pipe from the client");
        if self.write_tx.try_send(CtlMsg::PipeReq).is_err() {
            warn!("control write queue unavailable, pipe request dropped");
        }
    }

    /// Death: absorb anything still in flight, then close every pipe the
    /// pool tracks. Dropping `get_rx` wakes blocked consumers with `None`.
    async fn shutdown(mut self, available: Option<Arc<S>>) {
        self.add_rx.close();
        while let Some(pipe) = self.add_rx.recv().await {
            self.idle.push_front(pipe);
        }
        if let Some(pipe) = available {
            self.idle.push_front(pipe);
        }
        for pipe in self.idle.drain(..) {
            pipe.close().await;
        }
        for pipe in self.busy.drain(..) {
            pipe.close().await;
        }
        trace!("pipe pool shut down");
    }
}
