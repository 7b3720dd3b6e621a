//! Process-wide indices: live controls by ClientId, tunnels by public
//! address, and the monotonic counter behind L7 sub-domain labels.
//!
//! Inserts happen during handshake (controls) and tunnel setup (tunnels);
//! deletes happen only in a control's moderator during teardown. The pipe
//! handshake path reads `control`; an external L7 router reads `tunnel`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::RwLock;

use crate::{
    control::Control,
    message::{ClientId, Protocol},
    pipe::PipeSession,
};

/// What `TunnelByAddr` stores: enough for a router to dispatch a user
/// connection into the owning control. The back-reference is weak so an
/// index entry can never keep a dead control alive.
pub struct TunnelEntry<S: PipeSession> {
    pub name: String,
    pub protocol: Protocol,
    pub control: Weak<Control<S>>,
}

impl<S: PipeSession> Clone for TunnelEntry<S> {
    fn clone(&self) -> Self {
        TunnelEntry {
            name: self.name.clone(),
            protocol: self.protocol,
            control: self.control.clone(),
        }
    }
}

pub struct Registry<S: PipeSession> {
    controls: RwLock<HashMap<ClientId, Arc<Control<S>>>>,
    tunnels: RwLock<HashMap<String, TunnelEntry<S>>>,
    subdomain_seq: AtomicU64,
}

impl<S: PipeSession> Default for Registry<S> {
    fn default() -> Self {
        Registry {
            controls: RwLock::new(HashMap::new()),
            tunnels: RwLock::new(HashMap::new()),
            subdomain_seq: AtomicU64::new(0),
        }
    }
}

impl<S: PipeSession> Registry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_control(&self, control: Arc<Control<S>>) {
        self.controls.write().insert(control.client_id(), control);
    }

    pub fn control(&self, id: ClientId) -> Option<Arc<Control<S>>> {
        self.controls.read().get(&id).cloned()
    }

    pub(crate) fn remove_control(&self, id: ClientId) {
        self.controls.write().remove(&id);
    }

    pub fn control_count(&self) -> usize {
        self.controls.read().len()
    }

    pub(crate) fn live_controls(&self) -> Vec<Arc<Control<S>>> {
        self.controls.read().values().cloned().collect()
    }

    pub(crate) fn insert_tunnel(&self, addr: String, entry: TunnelEntry<S>) {
        self.tunnels.write().insert(addr, entry);
    }

    /// Look up a tunnel by its public key: `"host:port"` for L4 tunnels,
    /// the full sub-domain host for L7 tunnels.
    pub fn tunnel(&self, addr: &str) -> Option<TunnelEntry<S>> {
        self.tunnels.read().get(addr).cloned()
    }

    pub(crate) fn remove_tunnel(&self, addr: &str) {
        self.tunnels.write().remove(addr);
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.read().len()
    }

    /// Mint a fresh sub-domain label: increment the counter, encode the new
    /// value in base 36.
    pub fn next_subdomain(&self) -> String {
        let n = self.subdomain_seq.fetch_add(1, Ordering::Relaxed) + 1;
        encode_base36(n)
    }
}

/// Short lexicographic encoding over lowercase letters and digits.
fn encode_base36(mut n: u64) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    // ALPHABET bytes are ascii
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSession;

    #[test]
    fn base36_encoding() {
        assert_eq!(encode_base36(0), "0");
        assert_eq!(encode_base36(1), "1");
        assert_eq!(encode_base36(35), "z");
        assert_eq!(encode_base36(36), "10");
        assert_eq!(encode_base36(36 * 36 + 1), "101");
    }

    #[test]
    fn subdomains_are_sequential() {
        let registry: Registry<MockSession> = Registry::new();
        assert_eq!(registry.next_subdomain(), "1");
        assert_eq!(registry.next_subdomain(), "2");
        for _ in 0..33 {
            registry.next_subdomain();
        }
        assert_eq!(registry.next_subdomain(), "10");
    }

    #[test]
    fn unknown_lookups_are_none() {
        let registry: Registry<MockSession> = Registry::new();
        assert!(registry.control(ClientId::from_raw(1)).is_none());
        assert!(registry.tunnel("10.0.0.1:4242").is_none());
    }
}
