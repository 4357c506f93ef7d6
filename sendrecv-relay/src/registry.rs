use std::collections::HashMap;

use derive_new::new;
use sendrecv_lib::error::{ProtocolError, RelayError};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Messages delivered to a connection's outbound queue by other connections.
#[derive(Debug)]
pub enum Outbound {
    /// Payload relayed verbatim from the paired peer.
    Relayed { from: String, text: String },
    /// Someone paired with us.
    Paired {
        peer_id: String,
        peer: mpsc::UnboundedSender<Outbound>,
    },
    SessionClosed { peer_id: String },
}

#[derive(new)]
struct PeerEntry {
    outbound: mpsc::UnboundedSender<Outbound>,
    #[new(default)]
    session: Option<String>,
}

fn validate_identity(id: &str) -> Result<(), RelayError> {
    if id.is_empty() || id.chars().any(char::is_whitespace) {
        return Err(RelayError::InvalidIdentity(id.to_owned()));
    }
    Ok(())
}

/// Registered identities and the sessions between them.
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn session_of(&self, id: &str) -> Option<&str> {
        self.peers.get(id)?.session.as_deref()
    }

    /// The first registration of an identity wins.
    pub fn register(
        &mut self,
        id: &str,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<(), RelayError> {
        validate_identity(id)?;
        if self.peers.contains_key(id) {
            return Err(RelayError::DuplicateIdentity(id.to_owned()));
        }
        info!("register {}", id);
        self.peers.insert(id.to_owned(), PeerEntry::new(outbound));
        Ok(())
    }

    /// Pairs `initiator` with `target`, notifies the target and returns the
    /// target's outbound queue.
    pub fn pair(
        &mut self,
        initiator: &str,
        target: &str,
    ) -> Result<mpsc::UnboundedSender<Outbound>, RelayError> {
        if initiator == target {
            return Err(ProtocolError::SessionWithSelf.into());
        }
        let initiator_entry = self
            .peers
            .get(initiator)
            .ok_or_else(|| RelayError::UnknownPeer(initiator.to_owned()))?;
        if initiator_entry.session.is_some() {
            return Err(RelayError::PeerBusy(initiator.to_owned()));
        }
        let initiator_outbound = initiator_entry.outbound.clone();
        let target_entry = self
            .peers
            .get(target)
            .ok_or_else(|| RelayError::UnknownPeer(target.to_owned()))?;
        if target_entry.session.is_some() {
            return Err(RelayError::PeerBusy(target.to_owned()));
        }
        let notification = Outbound::Paired {
            peer_id: initiator.to_owned(),
            peer: initiator_outbound,
        };
        if target_entry.outbound.send(notification).is_err() {
            // The target is disconnecting and about to unregister.
            return Err(RelayError::UnknownPeer(target.to_owned()));
        }
        let target_outbound = target_entry.outbound.clone();

        info!("pair {} with {}", initiator, target);
        if let Some(entry) = self.peers.get_mut(initiator) {
            entry.session = Some(target.to_owned());
        }
        if let Some(entry) = self.peers.get_mut(target) {
            entry.session = Some(initiator.to_owned());
        }
        Ok(target_outbound)
    }

    /// Ends the session of `id`, if any, and tells the peer. Returns the
    /// peer's identity.
    pub fn end_session(&mut self, id: &str) -> Option<String> {
        let peer_id = self.peers.get_mut(id)?.session.take()?;
        info!("end session {} - {}", id, peer_id);
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.session = None;
            let closed = Outbound::SessionClosed {
                peer_id: id.to_owned(),
            };
            if peer.outbound.send(closed).is_err() {
                debug!("{} is gone, drop SESSION_CLOSED", peer_id);
            }
        }
        Some(peer_id)
    }

    pub fn unregister(&mut self, id: &str) {
        self.end_session(id);
        if self.peers.remove(id).is_some() {
            info!("unregister {}", id);
        } else {
            debug!("{} was not registered", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (
        mpsc::UnboundedSender<Outbound>,
        mpsc::UnboundedReceiver<Outbound>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_duplicate_identity_keeps_first() {
        let mut registry = PeerRegistry::new();
        let (first, mut first_rx) = queue();
        let (second, _second_rx) = queue();
        registry.register("x", first).unwrap();
        assert_eq!(
            registry.register("x", second),
            Err(RelayError::DuplicateIdentity("x".to_owned()))
        );

        let (peer, _peer_rx) = queue();
        registry.register("y", peer).unwrap();
        registry.pair("y", "x").unwrap();
        assert!(matches!(
            first_rx.try_recv(),
            Ok(Outbound::Paired { peer_id, .. }) if peer_id == "y"
        ));
    }

    #[test]
    fn test_invalid_identity() {
        let mut registry = PeerRegistry::new();
        for id in ["", "a b", "tab\there"] {
            let (tx, _rx) = queue();
            assert_eq!(
                registry.register(id, tx),
                Err(RelayError::InvalidIdentity(id.to_owned()))
            );
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_pairing_and_busy() {
        let mut registry = PeerRegistry::new();
        let (a, _a_rx) = queue();
        let (b, mut b_rx) = queue();
        let (c, _c_rx) = queue();
        registry.register("a", a).unwrap();
        registry.register("b", b).unwrap();
        registry.register("c", c).unwrap();

        registry.pair("a", "b").unwrap();
        assert_eq!(registry.session_of("a"), Some("b"));
        assert_eq!(registry.session_of("b"), Some("a"));
        assert!(matches!(
            b_rx.try_recv(),
            Ok(Outbound::Paired { peer_id, .. }) if peer_id == "a"
        ));

        assert_eq!(
            registry.pair("c", "b").unwrap_err(),
            RelayError::PeerBusy("b".to_owned())
        );
        assert_eq!(registry.session_of("c"), None);
    }

    #[test]
    fn test_pairing_errors() {
        let mut registry = PeerRegistry::new();
        let (a, _a_rx) = queue();
        registry.register("a", a).unwrap();
        assert_eq!(
            registry.pair("a", "nobody").unwrap_err(),
            RelayError::UnknownPeer("nobody".to_owned())
        );
        assert_eq!(
            registry.pair("a", "a").unwrap_err(),
            RelayError::Protocol(ProtocolError::SessionWithSelf)
        );
    }

    #[test]
    fn test_unregister_notifies_peer() {
        let mut registry = PeerRegistry::new();
        let (a, _a_rx) = queue();
        let (b, mut b_rx) = queue();
        registry.register("a", a).unwrap();
        registry.register("b", b).unwrap();
        registry.pair("a", "b").unwrap();
        let _ = b_rx.try_recv();

        registry.unregister("a");
        assert!(!registry.is_registered("a"));
        assert_eq!(registry.session_of("b"), None);
        assert!(matches!(
            b_rx.try_recv(),
            Ok(Outbound::SessionClosed { peer_id }) if peer_id == "a"
        ));

        // The identity is free again.
        let (a, _a_rx) = queue();
        registry.register("a", a).unwrap();
    }

    #[test]
    fn test_end_session_keeps_registration() {
        let mut registry = PeerRegistry::new();
        let (a, mut a_rx) = queue();
        let (b, _b_rx) = queue();
        registry.register("a", a).unwrap();
        registry.register("b", b).unwrap();
        registry.pair("a", "b").unwrap();

        assert_eq!(registry.end_session("b"), Some("a".to_owned()));
        assert!(registry.is_registered("a") && registry.is_registered("b"));
        assert!(matches!(
            a_rx.try_recv(),
            Ok(Outbound::SessionClosed { peer_id }) if peer_id == "b"
        ));
        registry.pair("b", "a").unwrap();
    }

    #[test]
    fn test_end_session_with_departed_peer() {
        let mut registry = PeerRegistry::new();
        let (a, a_rx) = queue();
        let (b, _b_rx) = queue();
        registry.register("a", a).unwrap();
        registry.register("b", b).unwrap();
        registry.pair("b", "a").unwrap();
        drop(a_rx);

        assert_eq!(registry.end_session("b"), Some("a".to_owned()));
        assert_eq!(registry.session_of("a"), None);
        assert_eq!(registry.session_of("b"), None);
    }
}
