//! Public front door.
//!
//! One TCP listener receives both control and pipe connections; the first
//! frame of each connection decides which handshake runs. `run` is the
//! long-lived entry point with signal-driven graceful shutdown; `serve` is
//! the bare accept loop.

use std::sync::Arc;

use futures::stream::TryStreamExt as _;
use tokio::{
    net::{TcpListener, TcpStream},
    time,
};
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{debug, info, trace};

use crate::{
    codec::{FramedReader, FramedWriter},
    config::{EncryptMode, ServerConfig},
    error::{BoxError, Error, Result},
    handshake,
    hooks::Hooks,
    message::CtlMsg,
    pipe::MakePipeSession,
    registry::Registry,
};

pub struct Server<M: MakePipeSession> {
    config: Arc<ServerConfig>,
    hooks: Hooks,
    registry: Arc<Registry<M::Session>>,
    maker: Arc<M>,
}

impl<M: MakePipeSession> Clone for Server<M> {
    fn clone(&self) -> Self {
        Server {
            config: self.config.clone(),
            hooks: self.hooks.clone(),
            registry: self.registry.clone(),
            maker: self.maker.clone(),
        }
    }
}

impl<M: MakePipeSession> Server<M> {
    pub fn new(config: ServerConfig, hooks: Hooks, maker: M) -> Result<Self> {
        if config.encrypt_mode == EncryptMode::Cipher && hooks.cipher.is_none() {
            return Err(Error::config("encrypt mode 'cipher' requires a cipher hook"));
        }
        Ok(Server {
            config: Arc::new(config),
            hooks,
            registry: Arc::new(Registry::new()),
            maker: Arc::new(maker),
        })
    }

    /// The process-wide indices. An external L7 router resolves virtual
    /// hosts against this and dispatches with [`crate::tunnel::serve_stream`].
    pub fn registry(&self) -> Arc<Registry<M::Session>> {
        self.registry.clone()
    }

    /// The main entry point for the server: bind, accept until a shutdown
    /// signal arrives, then close every live control session and wait for
    /// the teardowns to drain.
    pub async fn run(self) -> std::result::Result<(), BoxError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("server start at: {:?}", listener.local_addr()?);

        #[cfg(target_family = "unix")]
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        #[cfg(target_family = "unix")]
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        #[cfg(target_family = "unix")]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let acceptor = self.clone();
        let handler = tokio::spawn(async move { acceptor.serve(listener).await });

        #[cfg(target_family = "unix")]
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sighup.recv() => {}
            _ = sigterm.recv() => {}
            res = handler => {
                match res {
                    Ok(res) => res?,
                    Err(e) => return Err(Box::new(e)),
                }
            }
        }
        #[cfg(target_family = "windows")]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            res = handler => {
                match res {
                    Ok(res) => res?,
                    Err(e) => return Err(Box::new(e)),
                }
            }
        }

        info!("received signal, gracefully exiting now");
        for control in self.registry.live_controls() {
            control.close();
        }
        // give the moderators a bounded window to drain
        for _ in 0..28 {
            if self.registry.control_count() == 0 {
                break;
            }
            time::sleep(time::Duration::from_secs(1)).await;
        }
        Ok(())
    }

    /// Accept loop: one task per incoming connection. Returns only when
    /// the listener itself fails or is exhausted.
    pub async fn serve(&self, listener: TcpListener) -> std::result::Result<(), BoxError> {
        let mut incoming = TcpListenerStream::new(listener);
        loop {
            match incoming.try_next().await {
                Ok(Some(conn)) => {
                    trace!("recv a connection from: {:?}", conn.peer_addr());
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_conn(conn).await {
                            debug!("connection dropped: {e}");
                        }
                    });
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(Box::new(e)),
            }
        }
    }

    /// Read the first frame and route: control hello or pipe hello.
    /// Anything else is a protocol error and drops the connection.
    async fn handle_conn(&self, stream: TcpStream) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedReader::new(read_half);
        let mut writer = FramedWriter::new(write_half);

        let first = time::timeout(self.config.tunables.handshake_timeout, reader.next())
            .await
            .map_err(|_| Error::handshake("timed out waiting for hello"))??;

        match first {
            Some(CtlMsg::ControlClientHello {
                auth_token,
                cipher_key,
            }) => {
                let (control, parts) = handshake::control_handshake(
                    auth_token,
                    cipher_key,
                    &self.registry,
                    &self.hooks,
                    &self.config,
                    &mut writer,
                )
                .await?;
                control.serve(parts, reader, writer);
                Ok(())
            }
            Some(CtlMsg::PipeClientHello { client_id, nonce }) => {
                let stream = reader
                    .into_inner()
                    .reunite(writer.into_inner())
                    .map_err(|_| Error::protocol("mismatched connection halves"))?;
                handshake::pipe_handshake(
                    client_id,
                    nonce,
                    &self.registry,
                    &self.hooks,
                    &self.config,
                    self.maker.as_ref(),
                    Box::new(stream),
                )
                .await
            }
            Some(other) => Err(Error::protocol(format!(
                "unexpected first frame: {other:?}"
            ))),
            None => Err(Error::handshake("connection closed before hello")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, net::SocketAddr, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    };

    use super::*;
    use crate::{
        config::Tunables,
        message::{ClientId, Protocol, TunnelConfig},
        pipe::PipeSession,
        testing::MockMaker,
    };

    struct TestServer {
        addr: SocketAddr,
        maker: MockMaker,
        registry: Arc<Registry<crate::testing::MockSession>>,
    }

    async fn start_server() -> TestServer {
        let maker = MockMaker::new();
        let config = ServerConfig {
            listen_ip: "127.0.0.1".parse().unwrap(),
            domain: "tunnel.test".into(),
            tunables: Tunables::default()
                .clean_interval(Duration::from_millis(40))
                .pipe_req_timeout(Duration::from_millis(80))
                .handshake_timeout(Duration::from_millis(200)),
            ..Default::default()
        };
        let server = Server::new(config, Hooks::default(), maker.clone()).unwrap();
        let registry = server.registry();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.serve(listener).await });
        TestServer {
            addr,
            maker,
            registry,
        }
    }

    async fn framed_connect(
        addr: SocketAddr,
    ) -> (FramedReader<OwnedReadHalf>, FramedWriter<OwnedWriteHalf>) {
        let conn = TcpStream::connect(addr).await.unwrap();
        let (r, w) = conn.into_split();
        (FramedReader::new(r), FramedWriter::new(w))
    }

    #[tokio::test]
    async fn cold_start_single_tcp_tunnel_round_trip() {
        let srv = start_server().await;

        // control hello
        let (mut reader, mut writer) = framed_connect(srv.addr).await;
        writer
            .send(&CtlMsg::ControlClientHello {
                auth_token: None,
                cipher_key: None,
            })
            .await
            .unwrap();
        let client_id = match reader.next().await.unwrap() {
            Some(CtlMsg::ControlServerHello { client_id, .. }) => client_id,
            other => panic!("expected server hello, got {other:?}"),
        };

        // advertise one tcp tunnel and learn the allocated port
        let mut tunnels = HashMap::new();
        tunnels.insert(
            "a".to_string(),
            TunnelConfig {
                protocol: Protocol::Tcp,
                local_addr: "127.0.0.1:3000".into(),
                ..Default::default()
            },
        );
        writer.send(&CtlMsg::AddTunnels { tunnels }).await.unwrap();

        let mut remote_port = 0;
        let mut saw_pipe_req = false;
        while remote_port == 0 || !saw_pipe_req {
            match reader.next().await.unwrap() {
                Some(CtlMsg::AddTunnels { tunnels }) => {
                    let cfg = &tunnels["a"];
                    assert!(cfg.error.is_none());
                    assert_ne!(cfg.remote_port, 0);
                    remote_port = cfg.remote_port;
                }
                Some(CtlMsg::PipeReq) => saw_pipe_req = true,
                Some(CtlMsg::Ping) => {}
                other => panic!("unexpected frame {other:?}"),
            }
        }

        // open a pipe like a client answering the pipe request
        let (_pipe_reader, mut pipe_writer) = framed_connect(srv.addr).await;
        pipe_writer
            .send(&CtlMsg::PipeClientHello {
                client_id,
                nonce: [1u8; 16],
            })
            .await
            .unwrap();
        let session = loop {
            if let Some(s) = srv.maker.sessions().into_iter().next() {
                break s;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        // user traffic round-trips through the dispatched stream
        let mut user = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
        user.write_all(b"round").await.unwrap();
        let mut peer = loop {
            if let Some(p) = session.take_peer() {
                break p;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"round");
        peer.write_all(b"trip!").await.unwrap();
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"trip!");

        // closing the control connection tears everything down
        drop(reader);
        drop(writer);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(srv.registry.control_count(), 0);
        assert_eq!(srv.registry.tunnel_count(), 0);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn pipe_hello_for_unknown_client_is_dropped() {
        let srv = start_server().await;
        let (mut reader, mut writer) = framed_connect(srv.addr).await;
        writer
            .send(&CtlMsg::PipeClientHello {
                client_id: ClientId::from_raw(999),
                nonce: [0u8; 16],
            })
            .await
            .unwrap();
        // server closes the connection without creating anything
        assert!(reader.next().await.unwrap().is_none());
        assert!(srv.maker.sessions().is_empty());
        assert_eq!(srv.registry.control_count(), 0);
    }

    #[tokio::test]
    async fn non_hello_first_frame_is_dropped() {
        let srv = start_server().await;
        let (mut reader, mut writer) = framed_connect(srv.addr).await;
        writer.send(&CtlMsg::Ping).await.unwrap();
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn silent_connection_is_dropped_after_handshake_timeout() {
        let srv = start_server().await;
        let conn = TcpStream::connect(srv.addr).await.unwrap();
        let (mut r, _w) = conn.into_split();
        let mut buf = [0u8; 1];
        // handshake_timeout is 200ms; the read unblocks with eof
        let n = tokio::time::timeout(Duration::from_secs(2), r.read(&mut buf))
            .await
            .expect("server must drop the connection")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn encrypt_mode_without_cipher_hook_is_a_config_error() {
        let config = ServerConfig {
            encrypt_mode: EncryptMode::Cipher,
            ..Default::default()
        };
        let res = Server::new(config, Hooks::default(), MockMaker::new());
        assert!(matches!(res, Err(Error::Config(_))));
    }
}
