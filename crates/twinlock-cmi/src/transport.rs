//! Collaborator traits between the lock layer and the message transport.
//!
//! The transport is reliable and in-order per link. Every [`CmiTransport::send`]
//! is answered by exactly one [`CmiClient::on_event`] carrying the same token.

use serde::{Deserialize, Serialize};

use crate::message::CmiMessage;

/// Caller-chosen value echoed back with the delivery outcome.
pub type SendToken = u64;

/// Delivery outcome of one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmiEvent {
    /// The peer received the message.
    Transmitted,
    /// Contact with the peer was lost before delivery.
    PeerContactLost,
    /// The transport failed the message.
    FatalError,
    /// No peer client is present.
    PeerNotPresent,
    /// The peer could not accept the message.
    PeerBusy,
}

impl CmiEvent {
    /// Returns true for every outcome except `Transmitted`.
    pub fn is_failure(&self) -> bool {
        !matches!(self, CmiEvent::Transmitted)
    }
}

/// Sending half consumed by the lock layer.
pub trait CmiTransport: Send + Sync {
    /// Queues `message`; the outcome arrives later through `on_event`.
    fn send(&self, message: CmiMessage, token: SendToken);

    /// Best-effort check that a peer is connected.
    fn is_peer_alive(&self) -> bool;
}

/// Receiving half implemented by the lock layer.
pub trait CmiClient: Send + Sync {
    /// A message arrived from the peer.
    fn on_message(&self, message: CmiMessage);

    /// Delivery outcome of a message this node sent.
    fn on_event(&self, event: CmiEvent, message: CmiMessage, token: SendToken);

    /// The transport lost the peer.
    fn on_contact_lost(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_failure_classification() {
        assert!(!CmiEvent::Transmitted.is_failure());
        assert!(CmiEvent::PeerContactLost.is_failure());
        assert!(CmiEvent::FatalError.is_failure());
        assert!(CmiEvent::PeerNotPresent.is_failure());
        assert!(CmiEvent::PeerBusy.is_failure());
    }
}
