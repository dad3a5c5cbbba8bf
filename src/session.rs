//! Receive session state machine
//!
//! Tracks one outstanding SysEx request/response exchange. The MIDI driver
//! delivers reply packets asynchronously with chunk boundaries of its own
//! choosing; this state machine validates the first packet, accumulates the
//! rest, and collapses the push stream into a single wait/signal boundary so
//! the caller can treat "send a command, get a reply" as one blocking call.
//!
//! Lifecycle: `Idle -> Waiting -> Receiving -> {Finished | Overflow | Error}`.
//! Terminal states are re-armed only by resetting back to `Idle`. All
//! transitions happen on the driver callback thread; the application thread
//! reads the outcome after `wait` returns, with the signal as the
//! happens-before edge.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, trace};

use crate::device::SysexSink;
use crate::event::SignalEvent;
use crate::midi::MidiEvent;
use crate::registry::{CallbackRegistry, RegistrationToken};
use crate::sysex::{FUNCTION_INDEX, MIN_REPLY_LEN, SYSEX_END};

/// Lifecycle of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// Not armed; inbound packets are ignored.
    Idle,
    /// Command sent, no reply packet accepted yet.
    Waiting,
    /// First packet validated, accumulating payload.
    Receiving,
    /// Terminator seen; the exchange succeeded.
    Finished,
    /// Accumulation buffer filled before the terminator arrived.
    Overflow,
    /// Reply was malformed or carried the wrong function code.
    Error,
}

impl ReceiveStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReceiveStatus::Finished | ReceiveStatus::Overflow | ReceiveStatus::Error
        )
    }
}

/// Why an exchange did not finish.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("reply shorter than the minimum {MIN_REPLY_LEN}-byte header")]
    TruncatedReply,
    #[error("packet error (expected {expected:02X}h, got {received:02X}h)")]
    UnexpectedFunction { expected: u8, received: u8 },
    #[error("data overflow: reply exceeded the {capacity}-byte receive buffer")]
    Overflow { capacity: usize },
    #[error("no reply from the device within {0:?}")]
    Timeout(Duration),
    #[error("exchange signaled in unexpected state {0:?}")]
    UnexpectedState(ReceiveStatus),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Invoked on the driver thread after each accepted packet and on every
/// terminal transition, with the current status and byte count.
pub type ProgressFn = Arc<dyn Fn(ReceiveStatus, usize) + Send + Sync>;

struct SessionState {
    status: ReceiveStatus,
    expected_function: u8,
    received_function: Option<u8>,
    capacity: usize,
    buffer: Vec<u8>,
    token: Option<RegistrationToken>,
}

struct Shared {
    state: Mutex<SessionState>,
    event: SignalEvent,
    registry: Arc<CallbackRegistry>,
    progress: Mutex<Option<ProgressFn>>,
}

impl Shared {
    /// State machine step, run for every buffered packet the registry
    /// dispatches while this session's handler is registered.
    fn on_packet(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        match state.status {
            ReceiveStatus::Waiting => {
                if bytes.len() < MIN_REPLY_LEN {
                    state.status = ReceiveStatus::Error;
                    return self.finalize(state);
                }
                let function = bytes[FUNCTION_INDEX];
                state.received_function = Some(function);
                if function != state.expected_function {
                    state.status = ReceiveStatus::Error;
                    return self.finalize(state);
                }
                if state.capacity == 0 {
                    // Nothing to capture for this exchange.
                    state.status = ReceiveStatus::Finished;
                    return self.finalize(state);
                }
                state.status = ReceiveStatus::Receiving;
            }
            ReceiveStatus::Receiving => {}
            // Idle or terminal: a packet this session no longer cares about.
            _ => return,
        }

        // Copy what fits, framing included; excess bytes from an oversized
        // packet are dropped rather than treated as an error.
        let room = state.capacity - state.buffer.len();
        let take = bytes.len().min(room);
        state.buffer.extend_from_slice(&bytes[..take]);

        if bytes.last() == Some(&SYSEX_END) {
            state.status = ReceiveStatus::Finished;
        } else if state.buffer.len() == state.capacity {
            state.status = ReceiveStatus::Overflow;
        }

        if state.status == ReceiveStatus::Receiving {
            let received = state.buffer.len();
            drop(state);
            self.report_progress(ReceiveStatus::Receiving, received);
        } else {
            self.finalize(state);
        }
    }

    /// Terminal transition: deregister, report, then signal exactly once.
    fn finalize(&self, mut state: MutexGuard<'_, SessionState>) {
        let status = state.status;
        let received = state.buffer.len();
        let token = state.token.take();
        drop(state);

        if let Some(token) = token {
            self.registry.remove(token);
        }
        debug!("exchange reached {:?} after {} bytes", status, received);
        self.report_progress(status, received);
        self.event.signal();
    }

    fn report_progress(&self, status: ReceiveStatus, received: usize) {
        let progress = self.progress.lock().clone();
        if let Some(progress) = progress {
            progress(status, received);
        }
    }
}

/// One in-flight request/response exchange.
///
/// Reusable: `begin` re-arms the session for the next exchange once the
/// previous outcome has been observed.
pub struct ReceiveSession {
    shared: Arc<Shared>,
}

impl ReceiveSession {
    pub fn new(registry: Arc<CallbackRegistry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState {
                    status: ReceiveStatus::Idle,
                    expected_function: 0,
                    received_function: None,
                    capacity: 0,
                    buffer: Vec::new(),
                    token: None,
                }),
                event: SignalEvent::new("send-receive"),
                registry,
                progress: Mutex::new(None),
            }),
        }
    }

    /// Install a progress callback, shared by all subsequent exchanges.
    pub fn set_progress(&self, progress: ProgressFn) {
        *self.shared.progress.lock() = Some(progress);
    }

    pub fn status(&self) -> ReceiveStatus {
        self.shared.state.lock().status
    }

    pub fn bytes_received(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    pub fn received_function(&self) -> Option<u8> {
        self.shared.state.lock().received_function
    }

    /// Move the accumulated reply out of the session.
    pub fn take_payload(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.state.lock().buffer)
    }

    /// Return to `Idle`: drop buffered data, any stale registration, and any
    /// pending signal.
    pub fn reset(&self) {
        let token = {
            let mut state = self.shared.state.lock();
            state.status = ReceiveStatus::Idle;
            state.received_function = None;
            state.buffer = Vec::new();
            state.token.take()
        };
        if let Some(token) = token {
            self.shared.registry.remove(token);
        }
        self.shared.event.clear();
    }

    /// Arm the session and send `command`. The reply's function code must
    /// equal `expected_function`; up to `capacity` reply bytes are captured
    /// (zero means validate-only, no copy).
    ///
    /// The handler is registered before the command leaves so a fast reply
    /// cannot be missed; the session is armed only after the registration is
    /// recorded so unsolicited traffic in that window is ignored.
    pub fn begin(
        &self,
        sink: &mut dyn SysexSink,
        command: &[u8],
        expected_function: u8,
        capacity: usize,
    ) -> Result<(), ExchangeError> {
        self.reset();
        {
            let mut state = self.shared.state.lock();
            state.expected_function = expected_function;
            state.received_function = None;
            state.capacity = capacity;
            state.buffer = Vec::with_capacity(capacity);
        }

        let shared = Arc::clone(&self.shared);
        let token = self.shared.registry.add(Arc::new(move |event, _control| {
            if let MidiEvent::Buffered(bytes) = event {
                shared.on_packet(bytes);
            }
        }));
        {
            let mut state = self.shared.state.lock();
            state.token = Some(token);
            state.status = ReceiveStatus::Waiting;
        }
        trace!(
            "exchange armed: expecting {:02X}h, capacity {}",
            expected_function,
            capacity
        );

        if let Err(err) = sink.send_sysex(command) {
            // No reply can come for a command that never left.
            let token = self.shared.state.lock().token.take();
            if let Some(token) = token {
                self.shared.registry.remove(token);
            }
            self.shared.state.lock().status = ReceiveStatus::Idle;
            return Err(ExchangeError::Transport(err));
        }
        Ok(())
    }

    /// Block until the exchange reaches a terminal state or the timeout
    /// elapses. On success returns the number of captured bytes.
    pub fn wait(&self, timeout: Duration) -> Result<usize, ExchangeError> {
        if !self.shared.event.wait_timeout(timeout) {
            // Pull the handler first so a late reply cannot touch a session
            // the caller is about to re-arm.
            let token = self.shared.state.lock().token.take();
            if let Some(token) = token {
                self.shared.registry.remove(token);
            }
            let status = self.shared.state.lock().status;
            if !status.is_terminal() {
                return Err(ExchangeError::Timeout(timeout));
            }
            // Completion raced the timeout; consume its signal here.
            self.shared.event.clear();
        }

        let state = self.shared.state.lock();
        match state.status {
            ReceiveStatus::Finished => Ok(state.buffer.len()),
            ReceiveStatus::Overflow => Err(ExchangeError::Overflow {
                capacity: state.capacity,
            }),
            ReceiveStatus::Error => match state.received_function {
                Some(received) => Err(ExchangeError::UnexpectedFunction {
                    expected: state.expected_function,
                    received,
                }),
                None => Err(ExchangeError::TruncatedReply),
            },
            status => Err(ExchangeError::UnexpectedState(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysex::{SysexBuilder, FUNC_ACK, FUNC_COMBI_DUMP, MODE_COMBI};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SHORT_WAIT: Duration = Duration::from_millis(20);

    /// Accepts everything; replies are injected by dispatching into the
    /// registry directly.
    struct NullSink;

    impl SysexSink for NullSink {
        fn send_sysex(&mut self, _bytes: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct BrokenSink;

    impl SysexSink for BrokenSink {
        fn send_sysex(&mut self, _bytes: &[u8]) -> anyhow::Result<()> {
            Err(anyhow!("port gone"))
        }
    }

    fn armed_session(expect: u8, capacity: usize) -> (Arc<CallbackRegistry>, ReceiveSession) {
        let registry = Arc::new(CallbackRegistry::new());
        let session = ReceiveSession::new(registry.clone());
        let command = SysexBuilder::new(0).mode_change(MODE_COMBI);
        session
            .begin(&mut NullSink, &command, expect, capacity)
            .unwrap();
        (registry, session)
    }

    fn dispatch(registry: &CallbackRegistry, bytes: &[u8]) {
        registry.dispatch(&MidiEvent::Buffered(bytes.to_vec()));
    }

    #[test]
    fn ack_exchange_finishes_without_capture() {
        let (registry, session) = armed_session(FUNC_ACK, 0);
        assert_eq!(session.status(), ReceiveStatus::Waiting);

        dispatch(&registry, &[0xF0, 0x42, 0x30, 0x75, 0x24, 0xF7]);

        assert_eq!(session.status(), ReceiveStatus::Finished);
        assert_eq!(session.wait(SHORT_WAIT).unwrap(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn mismatched_function_is_a_packet_error() {
        let (registry, session) = armed_session(FUNC_ACK, 0);

        dispatch(&registry, &[0xF0, 0x42, 0x30, 0x75, 0x73, 0xF7]);

        assert_eq!(session.status(), ReceiveStatus::Error);
        match session.wait(SHORT_WAIT) {
            Err(ExchangeError::UnexpectedFunction { expected, received }) => {
                assert_eq!(expected, 0x24);
                assert_eq!(received, 0x73);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The terminal signal was consumed; a re-armed session must not see
        // a stale one.
        session
            .begin(&mut NullSink, &[0xF0, 0xF7], FUNC_ACK, 0)
            .unwrap();
        assert!(matches!(
            session.wait(SHORT_WAIT),
            Err(ExchangeError::Timeout(_))
        ));
    }

    #[test]
    fn truncated_reply_is_an_error() {
        let (registry, session) = armed_session(FUNC_ACK, 0);

        dispatch(&registry, &[0xF0, 0x42, 0xF7]);

        assert!(matches!(
            session.wait(SHORT_WAIT),
            Err(ExchangeError::TruncatedReply)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn multi_packet_dump_accumulates_across_chunks() {
        let (registry, session) = armed_session(FUNC_COMBI_DUMP, 64);

        dispatch(&registry, &[0xF0, 0x42, 0x30, 0x75, 0x73, 0x01, 0x02]);
        assert_eq!(session.status(), ReceiveStatus::Receiving);
        dispatch(&registry, &[0x03, 0x04, 0x05]);
        assert_eq!(session.status(), ReceiveStatus::Receiving);
        dispatch(&registry, &[0x06, 0xF7]);

        assert_eq!(session.wait(SHORT_WAIT).unwrap(), 12);
        assert_eq!(
            session.take_payload(),
            vec![0xF0, 0x42, 0x30, 0x75, 0x73, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xF7]
        );
    }

    #[test]
    fn exact_capacity_with_terminator_finishes() {
        let (registry, session) = armed_session(FUNC_COMBI_DUMP, 10);

        dispatch(
            &registry,
            &[0xF0, 0x42, 0x30, 0x75, 0x73, 0x00, 0x00, 0x00, 0x00, 0xF7],
        );

        assert_eq!(session.status(), ReceiveStatus::Finished);
        assert_eq!(session.wait(SHORT_WAIT).unwrap(), 10);
    }

    #[test]
    fn unterminated_stream_overflows_at_capacity() {
        let (registry, session) = armed_session(FUNC_COMBI_DUMP, 8);

        dispatch(&registry, &[0xF0, 0x42, 0x30, 0x75, 0x73, 0x01]);
        dispatch(&registry, &[0x02, 0x03, 0x04, 0x05]);

        assert_eq!(session.status(), ReceiveStatus::Overflow);
        assert_eq!(session.bytes_received(), 8);
        assert!(matches!(
            session.wait(SHORT_WAIT),
            Err(ExchangeError::Overflow { capacity: 8 })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn oversized_terminated_packet_is_clamped_but_finishes() {
        // Excess bytes are dropped; the terminator still ends the exchange.
        let (registry, session) = armed_session(FUNC_COMBI_DUMP, 6);

        dispatch(
            &registry,
            &[0xF0, 0x42, 0x30, 0x75, 0x73, 0x01, 0x02, 0x03, 0x04, 0xF7],
        );

        assert_eq!(session.status(), ReceiveStatus::Finished);
        assert_eq!(session.wait(SHORT_WAIT).unwrap(), 6);
    }

    #[test]
    fn stale_packets_after_terminal_are_ignored() {
        let (registry, session) = armed_session(FUNC_ACK, 0);

        dispatch(&registry, &[0xF0, 0x42, 0x30, 0x75, 0x24, 0xF7]);
        assert_eq!(session.wait(SHORT_WAIT).unwrap(), 0);

        // The handler is already deregistered; even dispatching straight at
        // the registry must not revive the session or signal again.
        dispatch(&registry, &[0xF0, 0x42, 0x30, 0x75, 0x24, 0xF7]);
        assert_eq!(session.status(), ReceiveStatus::Finished);
        assert!(matches!(
            session.wait(SHORT_WAIT),
            Err(ExchangeError::Timeout(_))
        ));
    }

    #[test]
    fn timeout_deregisters_the_handler() {
        let (registry, session) = armed_session(FUNC_ACK, 0);

        assert!(matches!(
            session.wait(SHORT_WAIT),
            Err(ExchangeError::Timeout(_))
        ));
        assert!(registry.is_empty());

        // A late reply must not signal the next exchange.
        dispatch(&registry, &[0xF0, 0x42, 0x30, 0x75, 0x24, 0xF7]);
        session
            .begin(&mut NullSink, &[0xF0, 0xF7], FUNC_ACK, 0)
            .unwrap();
        assert!(matches!(
            session.wait(SHORT_WAIT),
            Err(ExchangeError::Timeout(_))
        ));
    }

    #[test]
    fn send_failure_unwinds_the_registration() {
        let registry = Arc::new(CallbackRegistry::new());
        let session = ReceiveSession::new(registry.clone());

        let result = session.begin(&mut BrokenSink, &[0xF0, 0xF7], FUNC_ACK, 0);
        assert!(matches!(result, Err(ExchangeError::Transport(_))));
        assert!(registry.is_empty());
        assert_eq!(session.status(), ReceiveStatus::Idle);
    }

    #[test]
    fn progress_reports_each_packet_and_the_terminal() {
        let (registry, session) = armed_session(FUNC_COMBI_DUMP, 64);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        session.set_progress(Arc::new(move |_status, _received| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        dispatch(&registry, &[0xF0, 0x42, 0x30, 0x75, 0x73, 0x01]);
        dispatch(&registry, &[0x02, 0x03]);
        dispatch(&registry, &[0x04, 0xF7]);

        session.wait(SHORT_WAIT).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
