//! In-process loopback link joining two nodes.
//!
//! Frames are bincode-encoded on send and decoded on delivery, so the codec is
//! exercised end to end. Nothing moves until [`LoopbackLink::pump`] is called,
//! which keeps two-node scenarios deterministic.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::codec::{decode_message, encode_message};
use crate::message::CmiMessage;
use crate::transport::{CmiClient, CmiEvent, CmiTransport, SendToken};

struct Frame {
    message: CmiMessage,
    bytes: Option<Vec<u8>>,
    token: SendToken,
}

struct Side {
    outbound: Mutex<VecDeque<Frame>>,
    client: RwLock<Option<Weak<dyn CmiClient>>>,
    up: AtomicBool,
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Side {
    fn new() -> Self {
        Self {
            outbound: Mutex::new(VecDeque::new()),
            client: RwLock::new(None),
            up: AtomicBool::new(true),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn client(&self) -> Option<Arc<dyn CmiClient>> {
        self.client.read().as_ref().and_then(|weak| weak.upgrade())
    }
}

struct LinkShared {
    sides: [Side; 2],
}

/// Counters for one link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopbackStats {
    /// Frames queued per side.
    pub sent: [u64; 2],
    /// Frames delivered per sending side.
    pub delivered: [u64; 2],
    /// Frames failed per sending side.
    pub failed: [u64; 2],
}

/// Two-sided in-process link.
#[derive(Clone)]
pub struct LoopbackLink {
    shared: Arc<LinkShared>,
}

impl LoopbackLink {
    /// Creates a link with both sides up and no clients attached.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LinkShared {
                sides: [Side::new(), Side::new()],
            }),
        }
    }

    /// Creates a link and returns it with both endpoints.
    pub fn pair() -> (Self, LoopbackEndpoint, LoopbackEndpoint) {
        let link = Self::new();
        let a = link.endpoint(0);
        let b = link.endpoint(1);
        (link, a, b)
    }

    /// Endpoint for `side` (0 or 1).
    pub fn endpoint(&self, side: usize) -> LoopbackEndpoint {
        LoopbackEndpoint {
            shared: Arc::clone(&self.shared),
            side: side & 1,
        }
    }

    /// Frames waiting to leave `side`.
    pub fn pending(&self, side: usize) -> usize {
        self.shared.sides[side & 1].outbound.lock().len()
    }

    /// Delivers one frame sent by `side`. Returns false if none was queued.
    ///
    /// Every frame taken off the queue is answered with an event to the
    /// sending client, delivered or not.
    pub fn pump_one(&self, side: usize) -> bool {
        let from = side & 1;
        let to = from ^ 1;
        let frame = match self.shared.sides[from].outbound.lock().pop_front() {
            Some(frame) => frame,
            None => return false,
        };
        let sender = &self.shared.sides[from];
        let receiver = &self.shared.sides[to];

        let outcome = match frame.bytes.as_deref() {
            _ if !sender.up.load(Ordering::Acquire) => Err(CmiEvent::PeerContactLost),
            None => Err(CmiEvent::FatalError),
            Some(_) if !receiver.up.load(Ordering::Acquire) => Err(CmiEvent::PeerContactLost),
            Some(bytes) => match receiver.client() {
                None => Err(CmiEvent::PeerNotPresent),
                Some(client) => match decode_message(bytes) {
                    Ok(decoded) => Ok((client, decoded)),
                    Err(e) => {
                        warn!("loopback side {} dropped undecodable frame: {}", from, e);
                        Err(CmiEvent::FatalError)
                    }
                },
            },
        };

        let event = match outcome {
            Ok((client, decoded)) => {
                client.on_message(decoded);
                sender.delivered.fetch_add(1, Ordering::Relaxed);
                CmiEvent::Transmitted
            }
            Err(event) => {
                sender.failed.fetch_add(1, Ordering::Relaxed);
                event
            }
        };

        if let Some(client) = sender.client() {
            client.on_event(event, frame.message, frame.token);
        }
        true
    }

    /// Delivers frames in both directions until neither side has any queued.
    /// Returns the number of frames processed.
    pub fn pump(&self) -> usize {
        let mut count = 0;
        loop {
            let mut progressed = false;
            for side in 0..2 {
                if self.pump_one(side) {
                    progressed = true;
                    count += 1;
                }
            }
            if !progressed {
                return count;
            }
        }
    }

    /// Takes `side` down and tells the surviving client that contact is lost.
    pub fn fail_side(&self, side: usize) {
        let down = side & 1;
        if !self.shared.sides[down].up.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("loopback side {} down", down);
        if let Some(client) = self.shared.sides[down ^ 1].client() {
            client.on_contact_lost();
        }
    }

    /// Brings `side` back up.
    pub fn restore_side(&self, side: usize) {
        self.shared.sides[side & 1].up.store(true, Ordering::Release);
    }

    /// Snapshot of link counters.
    pub fn stats(&self) -> LoopbackStats {
        let mut stats = LoopbackStats::default();
        for (i, side) in self.shared.sides.iter().enumerate() {
            stats.sent[i] = side.sent.load(Ordering::Relaxed);
            stats.delivered[i] = side.delivered.load(Ordering::Relaxed);
            stats.failed[i] = side.failed.load(Ordering::Relaxed);
        }
        stats
    }
}

impl Default for LoopbackLink {
    fn default() -> Self {
        Self::new()
    }
}

/// One side of a [`LoopbackLink`].
#[derive(Clone)]
pub struct LoopbackEndpoint {
    shared: Arc<LinkShared>,
    side: usize,
}

impl LoopbackEndpoint {
    /// Side index of this endpoint.
    pub fn side(&self) -> usize {
        self.side
    }

    /// Attaches the client that receives messages and events for this side.
    pub fn attach(&self, client: Weak<dyn CmiClient>) {
        *self.shared.sides[self.side].client.write() = Some(client);
    }

    /// Detaches the client; the peer then sees `PeerNotPresent`.
    pub fn detach(&self) {
        *self.shared.sides[self.side].client.write() = None;
    }
}

impl CmiTransport for LoopbackEndpoint {
    fn send(&self, message: CmiMessage, token: SendToken) {
        let bytes = match encode_message(&message) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("loopback side {} cannot encode {:?}: {}", self.side, message.message_type(), e);
                None
            }
        };
        let side = &self.shared.sides[self.side];
        side.sent.fetch_add(1, Ordering::Relaxed);
        side.outbound.lock().push_back(Frame {
            message,
            bytes,
            token,
        });
    }

    fn is_peer_alive(&self) -> bool {
        let me = &self.shared.sides[self.side];
        let peer = &self.shared.sides[self.side ^ 1];
        me.up.load(Ordering::Acquire) && peer.up.load(Ordering::Acquire) && peer.client().is_some()
    }
}
