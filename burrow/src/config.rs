use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

/// Whether pipe connections are wrapped in the collaborator stream cipher
/// after their handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptMode {
    /// Pipes run in the clear; no key exchange happens on the control
    /// handshake.
    #[default]
    None,
    /// The control handshake performs a key exchange and every pipe is
    /// wrapped with a per-pipe session key.
    Cipher,
}

/// Server-wide configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public front door. Control connections and pipe connections both
    /// arrive here and are told apart by their first frame.
    pub bind_addr: SocketAddr,
    /// Address tcp tunnels bind their public listeners to, and the host
    /// part advertised back to clients.
    pub listen_ip: IpAddr,
    /// Shared port advertised for http tunnels.
    pub http_port: u16,
    /// Shared port advertised for https tunnels.
    pub https_port: u16,
    /// Base domain under which L7 sub-domains are minted.
    pub domain: String,
    pub encrypt_mode: EncryptMode,
    pub tunables: Tunables,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8380)),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 80,
            https_port: 443,
            domain: "localhost".to_string(),
            encrypt_mode: EncryptMode::None,
            tunables: Tunables::default(),
        }
    }
}

/// Process-wide tuning knobs, with the defaults the protocol was sized for.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Idle pipes kept parked per control before eviction kicks in.
    pub max_idle_pipes: usize,
    /// Streams per pipe before the pipe counts as busy.
    pub max_streams: usize,
    /// Keepalive probe period.
    pub ping_interval: Duration,
    /// Inbound silence tolerated before the control is torn down.
    pub ping_timeout: Duration,
    /// Period of the pool's bookkeeping pass.
    pub clean_interval: Duration,
    /// How long the pool waits for the client to deliver a requested pipe
    /// before asking again.
    pub pipe_req_timeout: Duration,
    /// Capacity of the per-control outbound frame queue.
    pub write_chan_buffer: usize,
    /// Receive-buffer target handed to the mux when a pipe session is set
    /// up.
    pub mux_max_recv_buffer: usize,
    /// How long a fresh connection may take to produce its first frame.
    pub handshake_timeout: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            max_idle_pipes: 3,
            max_streams: 6,
            ping_interval: Duration::from_secs(8),
            ping_timeout: Duration::from_secs(17),
            clean_interval: Duration::from_secs(5),
            pipe_req_timeout: Duration::from_secs(12),
            write_chan_buffer: 128,
            mux_max_recv_buffer: 4 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl Tunables {
    pub fn max_idle_pipes(mut self, n: usize) -> Self {
        self.max_idle_pipes = n;
        self
    }

    pub fn max_streams(mut self, n: usize) -> Self {
        self.max_streams = n;
        self
    }

    pub fn ping_interval(mut self, d: Duration) -> Self {
        self.ping_interval = d;
        self
    }

    pub fn ping_timeout(mut self, d: Duration) -> Self {
        self.ping_timeout = d;
        self
    }

    pub fn clean_interval(mut self, d: Duration) -> Self {
        self.clean_interval = d;
        self
    }

    pub fn pipe_req_timeout(mut self, d: Duration) -> Self {
        self.pipe_req_timeout = d;
        self
    }

    pub fn handshake_timeout(mut self, d: Duration) -> Self {
        self.handshake_timeout = d;
        self
    }
}
