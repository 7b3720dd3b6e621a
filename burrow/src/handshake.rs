//! Control and pipe handshakes.
//!
//! Both connection kinds arrive on the same public address; the caller has
//! already read the first frame and routes here on its type. A control
//! hello births a new session; a pipe hello attaches a fresh mux session
//! to an existing one.

use std::sync::Arc;

use tokio::io::AsyncWrite;
use tracing::debug;

use crate::{
    codec::FramedWriter,
    config::{EncryptMode, ServerConfig},
    control::{Control, ServeParts},
    error::{Error, Result},
    hooks::Hooks,
    message::{ClientId, CtlMsg},
    pipe::{BoxPipeIo, MakePipeSession, PipeSession},
    registry::Registry,
};

/// Finish a control handshake whose `ControlClientHello` has already been
/// read: authenticate, optionally run the key exchange, allocate a fresh
/// ClientId, answer with `ControlServerHello`, and register the new
/// session. The caller starts the session's tasks afterwards.
pub(crate) async fn control_handshake<S, W>(
    auth_token: Option<String>,
    cipher_key: Option<Vec<u8>>,
    registry: &Arc<Registry<S>>,
    hooks: &Hooks,
    config: &Arc<ServerConfig>,
    writer: &mut FramedWriter<W>,
) -> Result<(Arc<Control<S>>, ServeParts<S>)>
where
    S: PipeSession,
    W: AsyncWrite + Unpin,
{
    if let Some(auth) = &hooks.auth {
        let token = auth_token.as_deref().unwrap_or("");
        if !auth.check(token).await {
            return Err(Error::handshake("authentication failed"));
        }
    }

    let mut pre_master = None;
    let mut server_key = None;
    if config.encrypt_mode == EncryptMode::Cipher {
        let Some(cipher) = &hooks.cipher else {
            return Err(Error::config("encrypt mode requires a cipher hook"));
        };
        let Some(client_key) = cipher_key else {
            return Err(Error::handshake("client offered no cipher key"));
        };
        let (public, secret) = cipher
            .exchange(&client_key)
            .map_err(|e| Error::handshake(format!("key exchange failed: {e}")))?;
        server_key = Some(public);
        pre_master = Some(secret);
    }

    let client_id = ClientId::generate();
    writer
        .send(&CtlMsg::ControlServerHello {
            client_id,
            cipher_key: server_key,
        })
        .await?;

    let (control, parts) = Control::new(
        client_id,
        pre_master,
        registry.clone(),
        hooks.clone(),
        config.clone(),
    );
    registry.insert_control(control.clone());
    debug!(client_id = %client_id, "control session established");
    Ok((control, parts))
}

/// Attach a freshly-opened pipe connection to its control session. The
/// `PipeClientHello` has already been read, plaintext; from here the
/// connection optionally gets the stream cipher and then speaks mux only.
///
/// An unknown ClientId closes the connection and changes nothing.
pub(crate) async fn pipe_handshake<M>(
    client_id: ClientId,
    nonce: [u8; 16],
    registry: &Arc<Registry<M::Session>>,
    hooks: &Hooks,
    config: &Arc<ServerConfig>,
    maker: &M,
    io: BoxPipeIo,
) -> Result<()>
where
    M: MakePipeSession,
{
    let Some(control) = registry.control(client_id) else {
        return Err(Error::handshake(format!(
            "pipe for unknown client {client_id}"
        )));
    };

    let io = if config.encrypt_mode == EncryptMode::Cipher {
        let Some(cipher) = &hooks.cipher else {
            return Err(Error::config("encrypt mode requires a cipher hook"));
        };
        let Some(pre_master) = control.pre_master() else {
            return Err(Error::handshake("control session has no pre-master secret"));
        };
        let key = cipher.session_key(pre_master, client_id, &nonce);
        cipher.wrap(io, key)
    } else {
        io
    };

    let session = maker
        .make_session(io, config.tunables.mux_max_recv_buffer)
        .await?;
    control.put_pipe(Arc::new(session)).await;
    debug!(client_id = %client_id, "pipe attached");
    Ok(())
}
