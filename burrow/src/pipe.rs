//! The contract this server requires of the stream multiplexer that runs
//! over pipe connections. The mux itself is a collaborator; embedders
//! implement these traits for whichever mux they carry.

use std::{future::Future, io};

use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe alias for the byte streams handed to the mux: a raw pipe
/// connection, possibly wrapped in the collaborator stream cipher.
pub trait PipeIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> PipeIo for T {}

pub type BoxPipeIo = Box<dyn PipeIo>;

/// One multiplexed pipe session.
///
/// The pool treats a session as idle while `num_streams()` is below the
/// configured per-pipe stream cap and the session is open; otherwise it is
/// busy. Sessions are shared behind `Arc`, so all methods take `&self`.
pub trait PipeSession: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn is_closed(&self) -> bool;

    fn num_streams(&self) -> usize;

    /// Open one bidirectional stream. The label names the tunnel so the
    /// client can route the stream to the right local service.
    fn open_stream(&self, label: &str) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Builds a mux session over a freshly handshaken pipe connection.
///
/// The server speaks mux *client* on pipes: streams are opened server →
/// client, so the stream-initiating role sits here even though the TCP
/// connection was dialed by the tunnel client.
pub trait MakePipeSession: Send + Sync + 'static {
    type Session: PipeSession;

    fn make_session(
        &self,
        io: BoxPipeIo,
        max_recv_buffer: usize,
    ) -> impl Future<Output = io::Result<Self::Session>> + Send;
}
