//! Call registry - correlates acks with the calls that produced them.
//!
//! The transport gives no request/response pairing, so every outbound call
//! is remembered under its call sequence until exactly one of two things
//! happens:
//!
//! - a matching ack arrives and [`CallRegistry::resolve`] consumes the entry
//! - the entry outlives the timeout and [`CallRegistry::sweep`] evicts it
//!
//! Lookup and removal happen under one lock, so an entry is never handed to
//! both paths.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::command::{Command, CommandKind};
use crate::error::{ProtocolError, ProtocolResult};

/// Default time a call waits for its ack.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Outcome delivered to a call callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Ack arrived within the timeout
    Ok,
    /// No ack before the sweep, or the ack arrived too late
    Timeout,
}

/// Result of a completed call.
#[derive(Debug, Clone)]
pub struct CallReply {
    pub call_seq: u64,
    pub action: String,
    pub status: CallStatus,
    /// Time between issuing the call and completing it
    pub elapsed: Duration,
    /// The ack, when one arrived
    pub ack: Option<Command>,
}

impl CallReply {
    pub fn is_ok(&self) -> bool {
        self.status == CallStatus::Ok
    }
}

/// Callback fired once when a call completes.
pub type CallCallback = Box<dyn FnOnce(CallReply) + Send + 'static>;

/// An in-flight call.
pub struct PendingCall {
    call_seq: u64,
    action: String,
    issued_at: Instant,
    callback: Option<CallCallback>,
}

impl PendingCall {
    pub fn new(
        call_seq: u64,
        action: impl Into<String>,
        issued_at: Instant,
        callback: Option<CallCallback>,
    ) -> Self {
        Self {
            call_seq,
            action: action.into(),
            issued_at,
            callback,
        }
    }

    pub fn call_seq(&self) -> u64 {
        self.call_seq
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.issued_at)
    }

    /// Consume the call and notify its callback, if any.
    pub fn complete(self, status: CallStatus, elapsed: Duration, ack: Option<Command>) {
        let reply = CallReply {
            call_seq: self.call_seq,
            action: self.action,
            status,
            elapsed,
            ack,
        };
        let Some(callback) = self.callback else {
            return;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(reply))) {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "callback panicked".to_string());
            warn!("Callback for call #{} panicked: {}", self.call_seq, reason);
        }
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("call_seq", &self.call_seq)
            .field("action", &self.action)
            .field("issued_at", &self.issued_at)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// A pending call matched by an ack.
#[derive(Debug)]
pub struct Resolution {
    pub pending: PendingCall,
    pub elapsed: Duration,
    pub status: CallStatus,
}

impl Resolution {
    /// Fire the callback with the ack that resolved the call.
    pub fn complete(self, ack: Command) {
        self.pending.complete(self.status, self.elapsed, Some(ack));
    }
}

/// Registry of outstanding calls for one endpoint.
pub struct CallRegistry {
    timeout: Duration,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
}

impl CallRegistry {
    /// Create a registry with the given ack timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issue a call sequence for `action` and register it as pending.
    ///
    /// Registration completes before this returns, so the call can be
    /// published afterwards without its ack racing the bookkeeping.
    pub fn issue(&self, action: impl Into<String>, callback: Option<CallCallback>) -> u64 {
        self.issue_at(action, callback, Instant::now())
    }

    /// [`issue`](Self::issue) with an explicit issue time.
    pub fn issue_at(
        &self,
        action: impl Into<String>,
        callback: Option<CallCallback>,
        now: Instant,
    ) -> u64 {
        let mut pending = self.pending.lock();
        let call_seq = loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            // Only after a full wrap could a live sequence come round again
            if !pending.contains_key(&seq) {
                break seq;
            }
        };
        let action = action.into();
        debug!("Issued call #{} ({})", call_seq, action);
        pending.insert(call_seq, PendingCall::new(call_seq, action, now, callback));
        call_seq
    }

    /// Register a pending call built by the caller.
    pub fn register(&self, call: PendingCall) -> ProtocolResult<()> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&call.call_seq) {
            return Err(ProtocolError::DuplicateCallSeq(call.call_seq));
        }
        pending.insert(call.call_seq, call);
        Ok(())
    }

    /// Match an ack against the pending calls.
    pub fn resolve(&self, ack: &Command) -> Option<Resolution> {
        self.resolve_at(ack, Instant::now())
    }

    /// [`resolve`](Self::resolve) with an explicit arrival time.
    ///
    /// A matched call is removed, so each call is resolved at most once.
    /// Acks arriving after the timeout still consume the entry but report
    /// [`CallStatus::Timeout`].
    pub fn resolve_at(&self, ack: &Command, now: Instant) -> Option<Resolution> {
        if ack.kind() != CommandKind::Ack {
            warn!("Refusing to resolve a {} command", ack.kind());
            return None;
        }
        let call_seq = ack.call_seq()?;

        let Some(pending) = self.pending.lock().remove(&call_seq) else {
            let err = ProtocolError::StaleOrUnknownAck(call_seq);
            debug!("Discarding ack from node {}: {}", ack.sender(), err);
            return None;
        };

        if ack.action() != Some(pending.action()) {
            debug!(
                "Ack #{} action {:?} differs from call action {}",
                call_seq,
                ack.action(),
                pending.action()
            );
        }

        let elapsed = pending.elapsed(now);
        let status = if elapsed < self.timeout {
            CallStatus::Ok
        } else {
            CallStatus::Timeout
        };
        Some(Resolution {
            pending,
            elapsed,
            status,
        })
    }

    /// Remove and return every call pending for at least the timeout.
    pub fn sweep(&self, now: Instant) -> Vec<PendingCall> {
        let mut pending = self.pending.lock();
        let expired: Vec<u64> = pending
            .values()
            .filter(|call| call.elapsed(now) >= self.timeout)
            .map(|call| call.call_seq)
            .collect();

        let mut calls: Vec<PendingCall> = expired
            .into_iter()
            .filter_map(|seq| pending.remove(&seq))
            .collect();
        drop(pending);

        calls.sort_by_key(|call| call.call_seq);
        calls
    }

    /// Drop a pending call whose publish never reached the transport.
    pub(crate) fn withdraw(&self, call_seq: u64) -> Option<PendingCall> {
        self.pending.lock().remove(&call_seq)
    }

    pub fn contains(&self, call_seq: u64) -> bool {
        self.pending.lock().contains_key(&call_seq)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

impl fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRegistry")
            .field("timeout", &self.timeout)
            .field("pending", &self.len())
            .finish()
    }
}
