//! Request/response correlation
//!
//! OCPP allows a single outstanding CALL per connection. The [`Correlator`]
//! owns that slot together with a FIFO queue of calls waiting for it:
//!
//! - a call is transmitted as soon as the slot is free and a writer is attached
//! - the response timeout starts at transmission
//! - a reply resolves the slot only if its message id matches
//! - closing the transport puts the in-flight call back at the head of the
//!   queue, unresolved, so it is retransmitted first with the same id
//!
//! All state lives behind one `parking_lot::Mutex` that is never held across
//! an await point.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::messages::{Action, Call, OcppError, OcppMessage};
use crate::collab::TelemetrySink;

/// Default response timeout
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(15_000);

/// How many timed-out message ids are remembered for late-reply detection
const EXPIRED_HISTORY: usize = 32;

const LOGGER: &str = "ocpp::correlation";

type ReplyTx = oneshot::Sender<Result<Value, OcppError>>;

/// Outbound frames handed to the transport task
pub type FrameWriter = mpsc::UnboundedSender<OcppMessage>;

/// The single in-flight call
struct PendingCall {
    call: Call,
    reply: ReplyTx,
    attempt: u64,
    timer: JoinHandle<()>,
}

/// A call waiting for the slot or for the transport
struct DeferredCall {
    call: Call,
    reply: ReplyTx,
}

#[derive(Default)]
struct State {
    pending: Option<PendingCall>,
    deferred: VecDeque<DeferredCall>,
    writer: Option<FrameWriter>,
    expired: VecDeque<String>,
    next_attempt: u64,
}

impl State {
    fn remember_expired(&mut self, message_id: String) {
        if self.expired.len() == EXPIRED_HISTORY {
            self.expired.pop_front();
        }
        self.expired.push_back(message_id);
    }

    fn is_expired(&self, message_id: &str) -> bool {
        self.expired.iter().any(|id| id == message_id)
    }
}

/// Single-outstanding-call enforcement for one charge point identity
pub struct Correlator {
    identity: String,
    response_timeout: Duration,
    telemetry: Arc<dyn TelemetrySink>,
    state: Mutex<State>,
}

impl Correlator {
    pub fn new(
        identity: impl Into<String>,
        response_timeout: Duration,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.into(),
            response_timeout,
            telemetry,
            state: Mutex::new(State::default()),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Register a call and return a future for its reply
    ///
    /// Registration happens synchronously, so the submission order of
    /// successive `submit` calls is the transmission order. Dropping the
    /// returned future does not withdraw the call.
    pub fn submit(
        self: &Arc<Self>,
        call: Call,
    ) -> impl Future<Output = Result<Value, OcppError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();

        {
            let mut state = self.state.lock();
            debug!(
                "[{}] Submitting {} ({}), {} queued",
                self.identity,
                call.action,
                call.message_id,
                state.deferred.len()
            );
            self.report("submit", call.action, &call.message_id);
            state.deferred.push_back(DeferredCall { call, reply });
            self.advance(&mut state);
        }

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(OcppError::ConnectionClosed),
            }
        }
    }

    /// Close out the pending call with a CALLRESULT payload or CALLERROR
    ///
    /// A reply for a call that already timed out is ignored. Any other reply
    /// that does not match the pending call is a protocol violation: the
    /// pending call fails, the queue is left untouched, and the error is
    /// returned so the transport can be torn down.
    pub fn resolve(
        self: &Arc<Self>,
        message_id: &str,
        outcome: Result<Value, OcppError>,
    ) -> Result<(), OcppError> {
        let mut state = self.state.lock();

        let matches = state
            .pending
            .as_ref()
            .map(|p| p.call.message_id == message_id)
            .unwrap_or(false);

        if matches {
            let pending = state.pending.take();
            if let Some(pending) = pending {
                pending.timer.abort();
                debug!(
                    "[{}] Resolved {} ({})",
                    self.identity, pending.call.action, message_id
                );
                self.report("resolve", pending.call.action, message_id);
                self.advance(&mut state);
                drop(state);
                let _ = pending.reply.send(outcome);
            }
            return Ok(());
        }

        if state.is_expired(message_id) {
            warn!(
                "[{}] Ignoring late reply for expired call {}",
                self.identity, message_id
            );
            self.telemetry.record(
                LOGGER,
                &self.identity,
                json!({"event": "late-reply", "messageId": message_id}),
            );
            return Ok(());
        }

        let violation = match state.pending.take() {
            Some(pending) => {
                pending.timer.abort();
                let violation = format!(
                    "reply {} does not match pending {} ({})",
                    message_id, pending.call.action, pending.call.message_id
                );
                let _ = pending
                    .reply
                    .send(Err(OcppError::ProtocolViolation(violation.clone())));
                violation
            }
            None => format!("reply {} with no call outstanding", message_id),
        };

        error!("[{}] Protocol violation: {}", self.identity, violation);
        self.telemetry.record(
            LOGGER,
            &self.identity,
            json!({"event": "violation", "messageId": message_id, "reason": &violation}),
        );
        Err(OcppError::ProtocolViolation(violation))
    }

    /// Timer callback; `attempt` guards against a stale timer expiring a
    /// retransmission of the same call
    fn expire(self: &Arc<Self>, message_id: &str, attempt: u64) {
        let mut state = self.state.lock();

        let current = state
            .pending
            .as_ref()
            .map(|p| p.attempt == attempt && p.call.message_id == message_id)
            .unwrap_or(false);
        if !current {
            return;
        }

        let pending = state.pending.take();
        if let Some(pending) = pending {
            let action = pending.call.action;
            warn!(
                "[{}] {} ({}) timed out after {:?}",
                self.identity, action, message_id, self.response_timeout
            );
            self.report("timeout", action, message_id);
            state.remember_expired(message_id.to_string());
            self.advance(&mut state);
            drop(state);
            let _ = pending.reply.send(Err(OcppError::Timeout {
                action,
                message_id: message_id.to_string(),
            }));
        }
    }

    /// Attach a freshly opened transport and flush the head of the queue
    pub fn on_open(self: &Arc<Self>, writer: FrameWriter) {
        let mut state = self.state.lock();
        state.writer = Some(writer);
        self.advance(&mut state);
    }

    /// Detach the transport; the in-flight call is re-queued at the front
    pub fn on_close(&self) {
        let mut state = self.state.lock();
        state.writer = None;

        if let Some(pending) = state.pending.take() {
            pending.timer.abort();
            debug!(
                "[{}] Re-queueing {} ({}) for retransmission",
                self.identity, pending.call.action, pending.call.message_id
            );
            self.report("requeue", pending.call.action, &pending.call.message_id);
            state.deferred.push_front(DeferredCall {
                call: pending.call,
                reply: pending.reply,
            });
        }
    }

    /// Fail every pending and deferred call; used on permanent shutdown
    pub fn abandon(&self) {
        let (pending, deferred) = {
            let mut state = self.state.lock();
            state.writer = None;
            (state.pending.take(), std::mem::take(&mut state.deferred))
        };

        if let Some(pending) = pending {
            pending.timer.abort();
            let _ = pending.reply.send(Err(OcppError::ConnectionClosed));
        }
        for item in deferred {
            let _ = item.reply.send(Err(OcppError::ConnectionClosed));
        }
    }

    /// Send a CALLRESULT or CALLERROR answering an inbound call
    ///
    /// Replies do not occupy the outbound slot.
    pub fn send_reply(&self, message: OcppMessage) -> Result<(), OcppError> {
        let state = self.state.lock();
        let writer = state.writer.as_ref().ok_or(OcppError::NotConnected)?;
        writer
            .send(message)
            .map_err(|_| OcppError::NotConnected)
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    pub fn pending_id(&self) -> Option<String> {
        self.state
            .lock()
            .pending
            .as_ref()
            .map(|p| p.call.message_id.clone())
    }

    pub fn deferred_len(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Move the head of the queue into the slot when possible
    fn advance(self: &Arc<Self>, state: &mut State) {
        if state.pending.is_some() {
            return;
        }
        let Some(writer) = state.writer.clone() else {
            return;
        };
        let Some(next) = state.deferred.pop_front() else {
            return;
        };

        if writer.send(OcppMessage::Call(next.call.clone())).is_err() {
            // Transport task is gone but close has not been signalled yet
            warn!("[{}] Writer closed, keeping {} queued", self.identity, next.call.action);
            state.writer = None;
            state.deferred.push_front(next);
            return;
        }

        state.next_attempt += 1;
        let attempt = state.next_attempt;
        let timer = self.arm_timeout(next.call.message_id.clone(), attempt);

        debug!(
            "[{}] Transmitted {} ({}), attempt {}",
            self.identity, next.call.action, next.call.message_id, attempt
        );
        self.report("transmit", next.call.action, &next.call.message_id);

        state.pending = Some(PendingCall {
            call: next.call,
            reply: next.reply,
            attempt,
            timer,
        });
    }

    fn arm_timeout(self: &Arc<Self>, message_id: String, attempt: u64) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let timeout = self.response_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(correlator) = weak.upgrade() {
                correlator.expire(&message_id, attempt);
            }
        })
    }

    fn report(&self, event: &str, action: Action, message_id: &str) {
        self.telemetry.record(
            LOGGER,
            &self.identity,
            json!({"event": event, "action": action.as_str(), "messageId": message_id}),
        );
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        if let Some(pending) = self.state.get_mut().pending.take() {
            pending.timer.abort();
        }
    }
}
