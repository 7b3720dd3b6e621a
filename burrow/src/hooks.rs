//! Collaborator hooks: authentication, endpoint notification, and the
//! cipher primitive. All three are external services as far as this crate
//! is concerned; they are injected as trait objects and the best-effort
//! ones only ever cost a log line when they fail.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{error::BoxError, message::ClientId, pipe::BoxPipeIo};

/// Validates the bearer token a client presents in its control hello.
pub trait Auth: Send + Sync {
    fn check<'a>(&'a self, token: &'a str) -> BoxFuture<'a, bool>;
}

/// Registers and withdraws public endpoints with an external system (DNS,
/// load-balancer fan-out, ...). Best-effort: errors are logged, never
/// propagated.
pub trait Notify: Send + Sync {
    fn add_member<'a>(
        &'a self,
        domain: &'a str,
        public_addr: &'a str,
    ) -> BoxFuture<'a, Result<(), BoxError>>;

    fn remove_member<'a>(
        &'a self,
        domain: &'a str,
        public_addr: &'a str,
    ) -> BoxFuture<'a, Result<(), BoxError>>;
}

/// The cryptographic primitive behind encrypted pipes.
///
/// The control handshake calls `exchange` once to agree on a pre-master
/// secret; each pipe handshake then derives a 16-byte session key from
/// `(pre_master, client_id, nonce)` and wraps the raw connection.
pub trait Cipher: Send + Sync {
    /// Key exchange for the control handshake: the client's public part in,
    /// `(server_public_part, pre_master_secret)` out.
    fn exchange(&self, client_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>), BoxError>;

    /// TLS-1.2-PRF-style session key for one pipe.
    fn session_key(&self, pre_master: &[u8], client_id: ClientId, nonce: &[u8; 16]) -> [u8; 16];

    /// Wrap a raw pipe connection in the stream cipher keyed above.
    fn wrap(&self, io: BoxPipeIo, key: [u8; 16]) -> BoxPipeIo;
}

/// Bundle of optional collaborators handed to the server. Auth is enabled
/// iff a hook is present; `EncryptMode::Cipher` requires the cipher hook.
#[derive(Clone, Default)]
pub struct Hooks {
    pub auth: Option<Arc<dyn Auth>>,
    pub notify: Option<Arc<dyn Notify>>,
    pub cipher: Option<Arc<dyn Cipher>>,
}

impl Hooks {
    pub fn auth(mut self, auth: Arc<dyn Auth>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn notify(mut self, notify: Arc<dyn Notify>) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }
}
