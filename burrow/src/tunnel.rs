//! Public-side tunnel endpoints and the user ↔ pipe-stream dispatch path.
//!
//! Tcp tunnels own a kernel listener on a server-chosen port and an accept
//! task that lives until the control dies. Http/https tunnels own no
//! listener; they reserve a sub-domain and rely on an external L7 router
//! that looks the tunnel up in the registry and calls [`serve_stream`].

use std::{collections::HashMap, io, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tracing::{debug, trace, warn};

use crate::{
    control::Control,
    message::{CtlMsg, Protocol, TunnelConfig},
    pipe::PipeSession,
    registry::TunnelEntry,
};

/// Teardown record kept by the owning control: enough to deregister and
/// withdraw the public endpoint. The listener itself is owned by its
/// accept task, which exits when the control dies.
pub(crate) struct TunnelHandle {
    pub(crate) name: String,
    /// Key in the tunnel registry.
    pub(crate) addr_key: String,
    /// Address handed to the notify collaborator.
    pub(crate) public_addr: String,
}

/// Handle one `AddTunnels` request: allocate every tunnel in the batch,
/// rewrite the configs with the allocated endpoints, and echo the batch
/// back so the client learns its public addresses. A tunnel that fails to
/// allocate carries the error in its echoed entry; the rest of the batch
/// is unaffected.
pub(crate) async fn add_tunnels<S: PipeSession>(
    control: Arc<Control<S>>,
    mut tunnels: HashMap<String, TunnelConfig>,
) {
    for (name, cfg) in tunnels.iter_mut() {
        let res = match cfg.protocol {
            Protocol::Tcp => bind_tcp(&control, name, cfg).await,
            Protocol::Udp => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "udp tunnels are not supported",
            )),
            Protocol::Http => {
                allocate_l7(&control, name, cfg, control.config.http_port).await;
                Ok(())
            }
            Protocol::Https => {
                allocate_l7(&control, name, cfg, control.config.https_port).await;
                Ok(())
            }
        };
        if let Err(e) = res {
            warn!(tunnel = %name, protocol = %cfg.protocol, "tunnel setup failed: {e}");
            cfg.error = Some(e.to_string());
        }
    }
    control.enqueue(CtlMsg::AddTunnels { tunnels }).await;
}

async fn bind_tcp<S: PipeSession>(
    control: &Arc<Control<S>>,
    name: &str,
    cfg: &mut TunnelConfig,
) -> io::Result<()> {
    let listener = TcpListener::bind((control.config.listen_ip, 0)).await?;
    let port = listener.local_addr()?.port();
    cfg.remote_port = port;
    cfg.hostname = Some(control.config.listen_ip.to_string());

    let public_addr = format!("{}:{}", control.config.listen_ip, port);
    register(control, name, cfg.protocol, public_addr.clone(), &public_addr).await;

    // accept before the echo goes out; bind has already happened, so early
    // user connections are valid
    tokio::spawn(accept_loop(control.clone(), listener, name.to_string()));
    debug!(tunnel = %name, %public_addr, "tcp tunnel listening");
    Ok(())
}

async fn allocate_l7<S: PipeSession>(
    control: &Arc<Control<S>>,
    name: &str,
    cfg: &mut TunnelConfig,
    shared_port: u16,
) {
    let label = control.registry.next_subdomain();
    let host = format!("{}.{}", label, control.config.domain);
    cfg.subdomain = Some(label);
    cfg.hostname = Some(host.clone());
    cfg.remote_port = shared_port;

    register(control, name, cfg.protocol, host.clone(), &host).await;
    debug!(tunnel = %name, %host, "l7 tunnel allocated");
}

/// Insert into the tunnel registry, record the teardown handle, and tell
/// the notify collaborator. Notification is best-effort.
async fn register<S: PipeSession>(
    control: &Arc<Control<S>>,
    name: &str,
    protocol: Protocol,
    addr_key: String,
    public_addr: &str,
) {
    control.registry.insert_tunnel(
        addr_key.clone(),
        TunnelEntry {
            name: name.to_string(),
            protocol,
            control: Arc::downgrade(control),
        },
    );
    control.tunnels.lock().push(TunnelHandle {
        name: name.to_string(),
        addr_key,
        public_addr: public_addr.to_string(),
    });
    if let Some(notify) = &control.hooks.notify {
        if let Err(e) = notify.add_member(&control.config.domain, public_addr).await {
            warn!(tunnel = %name, "endpoint registration failed: {e}");
        }
    }
}

async fn accept_loop<S: PipeSession>(
    control: Arc<Control<S>>,
    listener: TcpListener,
    name: String,
) {
    loop {
        tokio::select! {
            _ = control.die().cancelled() => {
                trace!(tunnel = %name, "listener closed with its control");
                break;
            }
            res = listener.accept() => match res {
                Ok((user, peer)) => {
                    trace!(tunnel = %name, %peer, "user connection accepted");
                    let control = control.clone();
                    let name = name.clone();
                    tokio::spawn(async move {
                        serve_stream(control, user, &name).await;
                    });
                }
                Err(e) => {
                    // only this listener dies; the control keeps serving
                    warn!(tunnel = %name, "accept failed, stopping listener: {e}");
                    break;
                }
            }
        }
    }
}

/// Splice one user connection onto a fresh pipe stream.
///
/// The pipe is returned to the pool right after the stream is opened:
/// capacity, not exclusivity, gates sharing, so other dispatchers can open
/// streams on the same pipe concurrently. Public so an external L7 router
/// can dispatch virtual-host traffic the same way.
pub async fn serve_stream<S, U>(control: Arc<Control<S>>, user: U, name: &str)
where
    S: PipeSession,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(pipe) = control.get_pipe().await else {
        // control died while we waited; dropping the user conn closes it
        return;
    };
    let stream = match pipe.open_stream(name).await {
        Ok(s) => s,
        Err(e) => {
            warn!(tunnel = %name, "failed to open pipe stream: {e}");
            control.put_pipe(pipe).await;
            return;
        }
    };
    control.put_pipe(pipe).await;

    let (mut user_rd, mut user_wr) = tokio::io::split(user);
    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);
    // two half-duplex copies; when either side finishes, both connections
    // are dropped and the other copy ends with a read error
    tokio::select! {
        res = tokio::io::copy(&mut user_rd, &mut stream_wr) => {
            trace!(tunnel = %name, "user side finished: {res:?}");
        }
        res = tokio::io::copy(&mut stream_rd, &mut user_wr) => {
            trace!(tunnel = %name, "pipe side finished: {res:?}");
        }
    }
}
