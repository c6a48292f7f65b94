//! Lock requests and the caller-facing ticket.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use twinlock_cmi::{CmiLockFlags, ElementHandle, LockMode, RequestToken, StripeRegion};

use crate::completion::{CancelToken, Completer, Completion};
use crate::flags::{PrivateFlags, RequestFlags};
use crate::pool::ShadowPermit;

/// Request identifier, unique within a lock domain.
pub type RequestId = u64;

/// What a lock protects; selects which abort triggers apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockClass {
    /// User data stripes.
    #[default]
    Data,
    /// Demand-paged metadata.
    Paged,
    /// Always-resident metadata; survives plain abort.
    NonPaged,
}

impl LockClass {
    /// Class named by a request's wire flags; plain requests are data locks.
    pub fn from_wire(flags: CmiLockFlags) -> Self {
        if flags.contains(CmiLockFlags::NON_PAGED) {
            LockClass::NonPaged
        } else if flags.contains(CmiLockFlags::PAGED) {
            LockClass::Paged
        } else {
            LockClass::Data
        }
    }

    /// Wire flags announcing this class to the peer.
    pub fn wire_flags(self) -> CmiLockFlags {
        match self {
            LockClass::Data => CmiLockFlags::empty(),
            LockClass::Paged => CmiLockFlags::PAGED,
            LockClass::NonPaged => CmiLockFlags::NON_PAGED,
        }
    }

    fn priv_flags(self) -> PrivateFlags {
        match self {
            LockClass::Data => PrivateFlags::empty(),
            LockClass::Paged => PrivateFlags::PAGED,
            LockClass::NonPaged => PrivateFlags::NP,
        }
    }
}

/// Operation kind of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockOpcode {
    /// Acquire shared.
    ReadLock,
    /// Acquire exclusive.
    WriteLock,
    /// Release shared.
    ReadUnlock,
    /// Release exclusive.
    WriteUnlock,
    /// Attach the element to peer traffic.
    Start,
    /// Detach the element from peer traffic.
    Stop,
}

impl LockOpcode {
    /// Acquire opcode for `mode`.
    pub fn lock(mode: LockMode) -> Self {
        match mode {
            LockMode::Read => LockOpcode::ReadLock,
            LockMode::Write => LockOpcode::WriteLock,
        }
    }

    /// Release opcode for `mode`.
    pub fn unlock(mode: LockMode) -> Self {
        match mode {
            LockMode::Read => LockOpcode::ReadUnlock,
            LockMode::Write => LockOpcode::WriteUnlock,
        }
    }
}

/// Outcome of a lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockStatus {
    /// Built but not submitted.
    Initialized,
    /// Parked behind another request or awaiting the peer.
    Pending,
    /// Granted, or released for unlock.
    Ok,
    /// Refused by element policy or by the peer.
    Aborted,
    /// Withdrawn by the caller.
    Cancelled,
    /// The request made no sense in the current state.
    IllegalRequest,
}

impl LockStatus {
    /// Returns true for statuses that end the request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LockStatus::Initialized | LockStatus::Pending)
    }
}

/// Caller options for [`LockDomain::lock`](crate::domain::LockDomain::lock).
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// What the lock protects.
    pub class: LockClass,
    /// Issued by a background monitor rather than host I/O.
    pub monitor_op: bool,
    /// Report an immediate decision only through the ticket.
    pub sync_mode: bool,
    /// Cancellation flag shared with the caller's I/O.
    pub cancel: Option<CancelToken>,
}

impl LockOptions {
    /// Options for a lock of `class`.
    pub fn class(class: LockClass) -> Self {
        Self {
            class,
            ..Self::default()
        }
    }

    /// Marks the lock as a monitor operation.
    pub fn monitor(mut self) -> Self {
        self.monitor_op = true;
        self
    }

    /// Requests sync-mode reporting.
    pub fn sync(mut self) -> Self {
        self.sync_mode = true;
        self
    }

    /// Attaches a cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Engine-side state of one lock request.
///
/// A request lives either on its entry's top-level queue or on exactly one
/// other request's `wait_queue`; the entry's request map owns it in both
/// cases.
#[derive(Debug)]
pub(crate) struct LockRequest {
    pub id: RequestId,
    pub opcode: LockOpcode,
    pub class: LockClass,
    pub status: LockStatus,
    pub flags: RequestFlags,
    pub priv_flags: PrivateFlags,
    pub cmi_flags: CmiLockFlags,
    pub stripe: StripeRegion,
    pub read_region: StripeRegion,
    pub write_region: StripeRegion,
    pub wait_queue: VecDeque<RequestId>,
    /// Initiator's request, for peer shadows.
    pub request_token: Option<RequestToken>,
    /// Granter's shadow once a grant arrived, or this shadow once granted.
    pub grant_token: Option<RequestToken>,
    pub monitor_op: bool,
    completer: Option<Completer<LockStatus>>,
    cancel: Option<CancelToken>,
    permit: Option<ShadowPermit>,
}

impl LockRequest {
    /// Builds a request issued on this node.
    pub fn local(
        id: RequestId,
        mode: LockMode,
        stripe: StripeRegion,
        options: &LockOptions,
        completer: Completer<LockStatus>,
    ) -> Self {
        let mut priv_flags = PrivateFlags::PENDING;
        if mode == LockMode::Read {
            priv_flags.insert(PrivateFlags::READ);
        }
        priv_flags.insert(options.class.priv_flags());
        let mut flags = RequestFlags::LOCAL_REQUEST;
        flags.set(RequestFlags::SYNC_MODE, options.sync_mode);
        let mut cmi_flags = CmiLockFlags::empty();
        if options.monitor_op {
            cmi_flags.insert(CmiLockFlags::MONITOR_OP);
        }
        Self {
            id,
            opcode: LockOpcode::lock(mode),
            class: options.class,
            status: LockStatus::Initialized,
            flags,
            priv_flags,
            cmi_flags,
            stripe,
            read_region: StripeRegion::INVALID,
            write_region: StripeRegion::INVALID,
            wait_queue: VecDeque::new(),
            request_token: None,
            grant_token: None,
            monitor_op: options.monitor_op,
            completer: Some(completer),
            cancel: options.cancel.clone(),
            permit: None,
        }
    }

    /// Builds the local shadow of a peer request.
    ///
    /// `region` is the slice-expanded range recorded as the peer's reflected
    /// region; `stripe` is the exact range the peer asked for.
    pub fn peer(
        id: RequestId,
        mode: LockMode,
        stripe: StripeRegion,
        region: StripeRegion,
        request: RequestToken,
        permit: ShadowPermit,
    ) -> Self {
        let (priv_flags, read_region, write_region) = match mode {
            LockMode::Read => (
                PrivateFlags::READ | PrivateFlags::PENDING,
                region,
                StripeRegion::INVALID,
            ),
            LockMode::Write => (PrivateFlags::PENDING, StripeRegion::INVALID, region),
        };
        Self {
            id,
            opcode: LockOpcode::lock(mode),
            class: LockClass::Data,
            status: LockStatus::Pending,
            flags: RequestFlags::PEER_REQUEST,
            priv_flags,
            cmi_flags: CmiLockFlags::empty(),
            stripe,
            read_region,
            write_region,
            wait_queue: VecDeque::new(),
            request_token: Some(request),
            grant_token: Some(RequestToken::new(id, stripe.first)),
            monitor_op: false,
            completer: None,
            cancel: None,
            permit: Some(permit),
        }
    }

    /// Sets the class of a peer shadow from the peer's request.
    pub fn with_class(mut self, class: LockClass) -> Self {
        self.priv_flags.remove(PrivateFlags::NP | PrivateFlags::PAGED);
        self.priv_flags.insert(class.priv_flags());
        self.class = class;
        self
    }

    pub fn token(&self) -> RequestToken {
        RequestToken::new(self.id, self.stripe.first)
    }

    pub fn mode(&self) -> LockMode {
        if self.is_read() {
            LockMode::Read
        } else {
            LockMode::Write
        }
    }

    pub fn is_read(&self) -> bool {
        self.priv_flags.contains(PrivateFlags::READ)
    }

    pub fn is_peer(&self) -> bool {
        self.flags.contains(RequestFlags::PEER_REQUEST)
    }

    pub fn is_np(&self) -> bool {
        self.priv_flags.contains(PrivateFlags::NP)
    }

    pub fn is_paged(&self) -> bool {
        self.priv_flags.contains(PrivateFlags::PAGED)
    }

    pub fn is_local_grant(&self) -> bool {
        self.priv_flags.contains(PrivateFlags::LOCAL_GRANT)
    }

    pub fn need_release(&self) -> bool {
        self.cmi_flags.contains(CmiLockFlags::NEED_RELEASE)
    }

    pub fn waiting_for_peer(&self) -> bool {
        self.flags.contains(RequestFlags::WAITING_FOR_PEER)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Region this request reflects for its own mode.
    pub fn own_region(&self) -> StripeRegion {
        if self.is_read() {
            self.read_region
        } else {
            self.write_region
        }
    }

    /// Resets the reflected regions to the exact stripe range.
    pub fn set_region(&mut self) {
        if self.is_read() {
            self.read_region = self.stripe;
            self.write_region = StripeRegion::INVALID;
        } else {
            self.write_region = self.stripe;
            self.read_region = StripeRegion::INVALID;
        }
    }

    /// True once the caller has been told the outcome.
    pub fn is_reported(&self) -> bool {
        self.completer.is_none() && !self.is_peer()
    }

    /// Records `status` and hands back the caller's completer, if still owed.
    pub fn finish(&mut self, status: LockStatus) -> Option<(Completer<LockStatus>, LockStatus)> {
        self.status = status;
        self.priv_flags.remove(PrivateFlags::PENDING);
        self.completer.take().map(|c| (c, status))
    }

    /// Takes the shadow-pool slot backing a peer shadow.
    pub fn take_permit(&mut self) -> Option<ShadowPermit> {
        self.permit.take()
    }
}

/// Caller's handle on a submitted lock.
#[derive(Debug)]
pub struct LockTicket {
    element: ElementHandle,
    token: RequestToken,
    mode: LockMode,
    completion: Completion<LockStatus>,
}

impl LockTicket {
    pub(crate) fn new(
        element: ElementHandle,
        token: RequestToken,
        mode: LockMode,
        completion: Completion<LockStatus>,
    ) -> Self {
        Self {
            element,
            token,
            mode,
            completion,
        }
    }

    /// Element the lock was taken on.
    pub fn element(&self) -> ElementHandle {
        self.element
    }

    /// Request token; also names the request in unlock.
    pub fn token(&self) -> RequestToken {
        self.token
    }

    /// Requested access.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Current status without blocking.
    pub fn status(&mut self) -> LockStatus {
        self.completion.poll().unwrap_or(LockStatus::Pending)
    }

    /// Returns true once the lock is held.
    pub fn is_granted(&mut self) -> bool {
        self.status() == LockStatus::Ok
    }

    /// Waits for the outcome.
    pub async fn wait(&mut self) -> LockStatus {
        self.completion
            .wait()
            .await
            .unwrap_or(LockStatus::Aborted)
    }
}
