use std::{collections::HashMap, fmt};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Server-generated identifier binding pipe connections back to their
/// owning control session. Unique per live control.
///
/// On the wire it travels as its 32-digit hex form, which also keeps it
/// representable in any frame body.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u128);

impl ClientId {
    pub fn generate() -> Self {
        ClientId(rand::random())
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u128) -> Self {
        ClientId(raw)
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        u128::from_str_radix(&s, 16)
            .map(ClientId)
            .map_err(|_| de::Error::custom("client id is not a 128-bit hex string"))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({:032x})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Http => "http",
            Protocol::Https => "https",
        };
        f.write_str(s)
    }
}

/// One tunnel as requested by the client and echoed back with the
/// server-allocated endpoint filled in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub protocol: Protocol,
    /// Public host, filled in by the server: `ip` for L4 tunnels, the full
    /// `label.domain` for L7 tunnels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// L7 sub-domain label, server-allocated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    /// Where the client forwards this tunnel's traffic on its side.
    pub local_addr: String,
    /// Public port, filled in by the server.
    #[serde(default)]
    pub remote_port: u16,
    /// Set in the echo when this tunnel's allocation failed; the rest of
    /// the batch is unaffected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Control-channel frames. The first frame of every fresh connection is
/// either `ControlClientHello` (a new control session) or `PipeClientHello`
/// (a pipe attaching to an existing one); everything else flows over an
/// established control connection. Unknown tags fail decoding and are
/// treated as protocol errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CtlMsg {
    ControlClientHello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
        /// Client's public part of the key exchange, present when the
        /// client wants encrypted pipes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cipher_key: Option<Vec<u8>>,
    },
    ControlServerHello {
        client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cipher_key: Option<Vec<u8>>,
    },
    /// Tunnel advertisement, sent by the client and echoed back by the
    /// server with allocated ports and sub-domains.
    AddTunnels {
        tunnels: HashMap<String, TunnelConfig>,
    },
    /// Server asks the client to open one more pipe connection.
    PipeReq,
    Ping,
    Pong,
    /// First and only control frame on a pipe connection, sent plaintext.
    PipeClientHello { client_id: ClientId, nonce: [u8; 16] },
}

impl CtlMsg {
    /// Keepalive frames may be coalesced by the sender; nothing else may.
    pub(crate) fn is_keepalive(&self) -> bool {
        matches!(self, CtlMsg::Ping | CtlMsg::Pong)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_display_is_padded_hex() {
        let id = ClientId::from_raw(0xabc);
        assert_eq!(id.to_string(), format!("{:032x}", 0xabcu128));
    }

    #[test]
    fn client_id_survives_the_tagged_envelope() {
        let msg = CtlMsg::PipeClientHello {
            client_id: ClientId::from_raw(0xdead_beef),
            nonce: [3u8; 16],
        };
        let json = serde_json::to_string(&msg).unwrap();
        match serde_json::from_str::<CtlMsg>(&json).unwrap() {
            CtlMsg::PipeClientHello { client_id, nonce } => {
                assert_eq!(client_id, ClientId::from_raw(0xdead_beef));
                assert_eq!(nonce, [3u8; 16]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = serde_json::from_str::<CtlMsg>(r#"{"type":"SelfDestruct"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn tunnel_error_field_only_serialized_when_set() {
        let cfg = TunnelConfig {
            protocol: Protocol::Tcp,
            local_addr: "127.0.0.1:3000".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("error"));
    }
}
