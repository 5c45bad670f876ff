//! The request engine: a cooperative state machine multiplexing logical
//! requests over single-in-flight control transfers.
//!
//! A single driver routine (the pump) owns all transitions. Work enters via
//! `submit` and timers; the pump advances one action at a time, picking the
//! next by strict priority: reset-all, per-slot RESET, CHECK, INIT, close.
//! The `busy` flag guards the USB endpoint, the sole shared resource.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::request::{LogicalRequest, Outcome, PollingPolicy, Reply, ReplyData, RequestData};
use crate::error::{Error, Result};
use crate::protocol::{
    MAX_PAYLOAD_SIZE, ServiceReply, Status, check_setup, init_setup, recv_setup, reset_setup,
    send_setup,
};
use crate::transport::UsbTransport;

/// What a single pump step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// An action ran; call the pump again.
    Worked,
    /// Nothing runnable until the given delay elapses.
    Waiting(Duration),
    /// No live requests and no pending close.
    Idle,
}

pub struct RequestEngine<T: UsbTransport> {
    transport: T,

    next_id: u32,
    requests: HashMap<u32, LogicalRequest>,
    outcomes: HashMap<u32, Outcome>,

    /// Submitted, not yet INIT'd. Submission order.
    pending: VecDeque<u32>,
    /// Hold a proto id and need a CHECK transfer.
    checking: VecDeque<u32>,
    /// Terminated but still occupying a device-side slot.
    resetting: VecDeque<u32>,

    active_count: u16,
    /// Device-side concurrency cap; `None` until learned from a BUSY INIT
    /// reply or supplied at open time. Never raised once set.
    max_active: Option<u16>,

    /// True while a transfer is outstanding on the endpoint.
    busy: bool,
    reset_all: bool,
    want_close: bool,
    close_deadline: Option<Instant>,
    closed: bool,
}

impl<T: UsbTransport> RequestEngine<T> {
    pub fn new(transport: T, max_active: Option<u16>) -> Self {
        Self {
            transport,
            next_id: 1,
            requests: HashMap::new(),
            outcomes: HashMap::new(),
            pending: VecDeque::new(),
            checking: VecDeque::new(),
            resetting: VecDeque::new(),
            active_count: 0,
            max_active,
            busy: false,
            reset_all: false,
            want_close: false,
            close_deadline: None,
            closed: false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn active_count(&self) -> u16 {
        self.active_count
    }

    pub fn max_active(&self) -> Option<u16> {
        self.max_active
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reclaim any slots left on the device by a previous host session.
    /// Scheduled once per open lifetime, right after a successful open.
    pub fn schedule_reset_all(&mut self) {
        self.reset_all = true;
    }

    /// Submit a logical request. Returns the id the caller later passes to
    /// [`wait`](Self::wait).
    pub fn submit(
        &mut self,
        request_type: u16,
        data: Option<RequestData>,
        timeout: Duration,
        polling: Arc<dyn PollingPolicy>,
    ) -> Result<u32> {
        if self.want_close || self.closed {
            return Err(Error::State("Device is being closed".to_string()));
        }
        let payload_len = data.as_ref().map(RequestData::len).unwrap_or(0);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(Error::Device("Request payload is too large".to_string()));
        }

        let id = self.next_id;
        self.next_id += 1;
        let request = LogicalRequest {
            id,
            request_type,
            data,
            proto_id: None,
            data_sent: false,
            check_count: 0,
            deadline: Instant::now() + timeout,
            next_check_at: None,
            done: false,
            polling,
        };
        trace!(id, request_type, payload_len, "Request submitted");
        self.requests.insert(id, request);
        self.pending.push_back(id);
        Ok(id)
    }

    /// Drive the engine until the given request completes, then hand out its
    /// outcome.
    pub fn wait(&mut self, id: u32) -> Result<Reply> {
        loop {
            if let Some(outcome) = self.outcomes.remove(&id) {
                return outcome;
            }
            match self.pump_step() {
                Progress::Worked => {}
                Progress::Waiting(delay) => thread::sleep(delay),
                Progress::Idle => {
                    return Err(Error::Internal(format!("request {id} is not in flight")));
                }
            }
        }
    }

    /// Pump until no more immediate work is runnable.
    pub fn pump_until_quiet(&mut self) {
        while self.pump_step() == Progress::Worked {}
    }

    /// Request close. With `process_pending` false, all unfinished requests
    /// are rejected immediately; otherwise they run to completion first. The
    /// optional timeout bounds the drain.
    pub fn begin_close(&mut self, process_pending: bool, timeout: Option<Duration>) {
        if self.closed {
            return;
        }
        self.want_close = true;
        if !process_pending {
            self.reject_all_unfinished();
        }
        if let Some(timeout) = timeout {
            self.close_deadline = Some(Instant::now() + timeout);
        }
    }

    /// Drive the pump until the transport is closed.
    pub fn drive_close(&mut self) {
        while !self.closed {
            match self.pump_step() {
                Progress::Worked => {}
                Progress::Waiting(delay) => thread::sleep(delay),
                Progress::Idle => {
                    // Nothing left to drain but the close action did not run;
                    // should be unreachable while want_close is set.
                    warn!("Close pump went idle before closing");
                    break;
                }
            }
        }
    }

    /// Advance the engine by at most one action.
    pub fn pump_step(&mut self) -> Progress {
        debug_assert!(!self.busy, "pump re-entered with a transfer in flight");
        if self.closed {
            return Progress::Idle;
        }

        let now = Instant::now();
        self.expire_deadlines(now);
        if let Some(deadline) = self.close_deadline
            && now >= deadline
        {
            debug!("Close timeout elapsed, rejecting unfinished requests");
            self.close_deadline = None;
            self.reject_all_unfinished();
        }
        self.promote_due_checks(now);

        // 1. Global reset, reclaiming every device-side slot.
        if self.reset_all {
            self.run_reset_all();
            return Progress::Worked;
        }

        // 2. Per-slot RESET for requests that terminated without completing.
        if let Some(id) = self.resetting.pop_front() {
            self.run_reset(id);
            return Progress::Worked;
        }

        // 3. CHECK the first live request whose poll timer fired.
        while let Some(id) = self.checking.pop_front() {
            if !self.is_live(id) {
                continue;
            }
            self.run_check(id);
            return Progress::Worked;
        }

        // 4. INIT the oldest pending request, subject to the concurrency cap.
        if self.can_admit() {
            while let Some(id) = self.pending.pop_front() {
                if !self.is_live(id) {
                    self.requests.remove(&id);
                    continue;
                }
                self.run_init(id);
                return Progress::Worked;
            }
        }

        // 5. Close once drained.
        if self.want_close && self.active_count == 0 && !self.has_live_requests() {
            if let Err(err) = self.transport.close() {
                warn!(error = %err, "USB close failed");
            }
            info!("Transport closed");
            self.closed = true;
            return Progress::Worked;
        }

        match self.earliest_wakeup() {
            Some(at) => Progress::Waiting(at.saturating_duration_since(now)),
            None => Progress::Idle,
        }
    }

    fn is_live(&self, id: u32) -> bool {
        self.requests.get(&id).is_some_and(|r| !r.done)
    }

    fn has_live_requests(&self) -> bool {
        self.requests.values().any(|r| !r.done)
    }

    fn can_admit(&self) -> bool {
        match self.max_active {
            Some(max) => self.active_count < max,
            None => true,
        }
    }

    fn earliest_wakeup(&self) -> Option<Instant> {
        let request_timers = self
            .requests
            .values()
            .filter(|r| !r.done)
            .flat_map(|r| [Some(r.deadline), r.next_check_at])
            .flatten();
        request_timers.chain(self.close_deadline).min()
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn expire_deadlines(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .requests
            .values()
            .filter(|r| !r.done && r.deadline <= now)
            .map(|r| r.id)
            .collect();
        for id in expired {
            debug!(id, "Request deadline elapsed");
            let proto_id = self.requests[&id].proto_id;
            if proto_id.is_some() {
                self.complete_keep_for_reset(id, Err(Error::Timeout));
            } else {
                self.complete_and_retire(id, Err(Error::Timeout));
            }
        }
    }

    fn promote_due_checks(&mut self, now: Instant) {
        let due: Vec<u32> = self
            .requests
            .values()
            .filter(|r| !r.done && r.next_check_at.is_some_and(|at| at <= now))
            .map(|r| r.id)
            .collect();
        for id in due {
            if let Some(request) = self.requests.get_mut(&id) {
                request.next_check_at = None;
            }
            self.checking.push_back(id);
        }
    }

    fn arm_poll_timer(&mut self, id: u32) {
        if let Some(request) = self.requests.get_mut(&id) {
            let delay = request.polling.next_delay(request.check_count);
            request.next_check_at = Some(Instant::now() + delay);
            trace!(id, delay_ms = delay.as_millis() as u64, "Poll timer armed");
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn complete(&mut self, id: u32, outcome: Outcome) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.done = true;
            request.next_check_at = None;
        }
        self.outcomes.insert(id, outcome);
    }

    /// Complete a request that holds no device-side slot.
    fn complete_and_retire(&mut self, id: u32, outcome: Outcome) {
        self.complete(id, outcome);
        self.requests.remove(&id);
    }

    /// Complete a request whose slot must still be reclaimed via RESET.
    fn complete_keep_for_reset(&mut self, id: u32, outcome: Outcome) {
        self.complete(id, outcome);
        self.resetting.push_back(id);
    }

    fn reject_all_unfinished(&mut self) {
        let live: Vec<u32> = self
            .requests
            .values()
            .filter(|r| !r.done)
            .map(|r| r.id)
            .collect();
        let had_active = self.active_count > 0;
        for id in live {
            self.complete(id, Err(Error::State("Device is being closed".to_string())));
        }
        self.requests.clear();
        self.pending.clear();
        self.checking.clear();
        self.resetting.clear();
        if had_active {
            // Return the slots in one sweep before closing.
            self.reset_all = true;
        } else {
            self.active_count = 0;
        }
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    fn run_reset_all(&mut self) {
        debug!("Issuing global RESET");
        self.busy = true;
        let result = self.transport.transfer_out(&reset_setup(0), &[]);
        self.busy = false;
        if let Err(err) = result {
            warn!(error = %err, "Global RESET failed");
        }
        // Cleared regardless of the outcome.
        self.reset_all = false;
        self.active_count = 0;
    }

    fn run_reset(&mut self, id: u32) {
        let Some(proto_id) = self.requests.get(&id).and_then(|r| r.proto_id) else {
            self.requests.remove(&id);
            return;
        };
        debug!(id, proto_id, "Releasing slot");
        self.busy = true;
        let result = self.transport.transfer_out(&reset_setup(proto_id), &[]);
        self.busy = false;
        if let Err(err) = result {
            warn!(id, proto_id, error = %err, "Slot RESET failed");
        }
        self.active_count = self.active_count.saturating_sub(1);
        self.requests.remove(&id);
    }

    fn run_init(&mut self, id: u32) {
        let request = &self.requests[&id];
        let request_type = request.request_type;
        let payload_len = request.payload_len() as u16;
        let has_payload = payload_len > 0;

        self.busy = true;
        let result = self.transport.transfer_in(&init_setup(request_type, payload_len));
        self.busy = false;

        let frame = match result {
            Ok(frame) => frame,
            Err(err) => {
                self.complete_and_retire(id, Err(err.into()));
                return;
            }
        };
        let reply = match ServiceReply::from_bytes(&frame) {
            Ok(reply) => reply,
            Err(err) => {
                self.complete_and_retire(id, Err(Error::Protocol(err.to_string())));
                return;
            }
        };
        trace!(id, reply = %reply, "INIT reply");

        match reply.status {
            Status::Ok => {
                let Some(proto_id) = reply.id else {
                    self.complete_and_retire(
                        id,
                        Err(Error::Protocol("INIT reply carries no id".to_string())),
                    );
                    return;
                };
                debug!(id, proto_id, request_type, "Slot opened");
                self.requests.get_mut(&id).unwrap().proto_id = Some(proto_id);
                self.active_count += 1;
                if has_payload {
                    self.send_payload(id, proto_id);
                } else {
                    self.requests.get_mut(&id).unwrap().data_sent = true;
                    self.arm_poll_timer(id);
                }
            }
            Status::Pending => {
                // The device has not allocated a payload buffer yet; only
                // valid when there is a payload to deliver.
                match (reply.id, has_payload) {
                    (Some(proto_id), true) => {
                        debug!(id, proto_id, "Slot opened, payload buffer pending");
                        self.requests.get_mut(&id).unwrap().proto_id = Some(proto_id);
                        self.active_count += 1;
                        self.arm_poll_timer(id);
                    }
                    (Some(proto_id), false) => {
                        self.requests.get_mut(&id).unwrap().proto_id = Some(proto_id);
                        self.active_count += 1;
                        self.complete_keep_for_reset(
                            id,
                            Err(Error::Protocol(
                                "PENDING reply for a request without payload".to_string(),
                            )),
                        );
                    }
                    (None, _) => {
                        self.complete_and_retire(
                            id,
                            Err(Error::Protocol("PENDING reply carries no id".to_string())),
                        );
                    }
                }
            }
            Status::Busy => {
                if self.active_count == 0 {
                    // Snapping a zero cap would gate INIT forever.
                    self.complete_and_retire(
                        id,
                        Err(Error::Protocol(
                            "BUSY reply with no active requests".to_string(),
                        )),
                    );
                    return;
                }
                info!(max_active = self.active_count, "Concurrency limit learned");
                self.max_active = Some(self.active_count);
                self.pending.push_front(id);
            }
            Status::NoMemory => {
                self.complete_and_retire(id, Err(Error::Memory));
            }
            other => {
                self.complete_and_retire(
                    id,
                    Err(Error::Protocol(format!("Unexpected INIT status: {other}"))),
                );
            }
        }
    }

    fn run_check(&mut self, id: u32) {
        let Some(proto_id) = self.requests.get(&id).and_then(|r| r.proto_id) else {
            self.complete_and_retire(
                id,
                Err(Error::Internal("CHECK without a proto id".to_string())),
            );
            return;
        };

        self.busy = true;
        let result = self.transport.transfer_in(&check_setup(proto_id));
        self.busy = false;
        self.requests.get_mut(&id).unwrap().check_count += 1;

        let frame = match result {
            Ok(frame) => frame,
            Err(err) => {
                self.complete_keep_for_reset(id, Err(err.into()));
                return;
            }
        };
        let reply = match ServiceReply::from_bytes(&frame) {
            Ok(reply) => reply,
            Err(err) => {
                self.complete_keep_for_reset(id, Err(Error::Protocol(err.to_string())));
                return;
            }
        };
        trace!(id, proto_id, reply = %reply, "CHECK reply");

        let data_sent = self.requests[&id].data_sent;
        match reply.status {
            Status::Ok if data_sent => self.finish_request(id, proto_id, &reply),
            Status::Ok => {
                // Payload buffer allocated; deliver the deferred payload.
                self.requests.get_mut(&id).unwrap().check_count = 0;
                self.send_payload(id, proto_id);
            }
            Status::Pending => self.arm_poll_timer(id),
            Status::NoMemory => self.complete_keep_for_reset(id, Err(Error::Memory)),
            Status::NotFound => {
                // The slot no longer exists; nothing left to reclaim.
                self.active_count = self.active_count.saturating_sub(1);
                self.complete_and_retire(
                    id,
                    Err(Error::Device("Request was cancelled".to_string())),
                );
            }
            other => {
                self.complete_keep_for_reset(
                    id,
                    Err(Error::Protocol(format!("Unexpected CHECK status: {other}"))),
                );
            }
        }
    }

    /// Upload the payload in a single OUT data stage and restart polling.
    fn send_payload(&mut self, id: u32, proto_id: u16) {
        let request = &self.requests[&id];
        let payload = request
            .data
            .as_ref()
            .map(|d| d.as_bytes().to_vec())
            .unwrap_or_default();

        self.busy = true;
        let result = self
            .transport
            .transfer_out(&send_setup(proto_id, payload.len() as u16), &payload);
        self.busy = false;

        match result {
            Ok(()) => {
                let request = self.requests.get_mut(&id).unwrap();
                request.data_sent = true;
                self.arm_poll_timer(id);
            }
            Err(err) => self.complete_keep_for_reset(id, Err(err.into())),
        }
    }

    /// Terminal OK CHECK: download the reply payload if any and resolve.
    /// The device frees the slot on a terminal CHECK, so the request retires
    /// without a RESET.
    fn finish_request(&mut self, id: u32, proto_id: u16, reply: &ServiceReply) {
        let result_code = reply.result.unwrap_or(0);
        let size = reply.size.unwrap_or(0);
        self.active_count = self.active_count.saturating_sub(1);

        let data = if size > 0 {
            if size as usize > MAX_PAYLOAD_SIZE {
                self.complete_and_retire(
                    id,
                    Err(Error::Protocol(format!("Reply payload too large: {size}"))),
                );
                return;
            }
            self.busy = true;
            let result = self.transport.transfer_in(&recv_setup(proto_id, size as u16));
            self.busy = false;
            let bytes = match result {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.complete_and_retire(id, Err(err.into()));
                    return;
                }
            };
            if bytes.len() != size as usize {
                self.complete_and_retire(
                    id,
                    Err(Error::Protocol(format!(
                        "Reply payload size mismatch: expected {size}, got {}",
                        bytes.len()
                    ))),
                );
                return;
            }
            if self.requests[&id].wants_text_reply() {
                Some(ReplyData::Text(String::from_utf8_lossy(&bytes).into_owned()))
            } else {
                Some(ReplyData::Bytes(bytes))
            }
        } else {
            None
        };

        debug!(id, proto_id, result = result_code, size, "Request resolved");
        self.complete_and_retire(
            id,
            Ok(Reply {
                result: result_code,
                data,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::request::ConstantPolling;
    use crate::protocol::ServiceKind;
    use crate::transport::{MockBehavior, MockTransport};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn engine(mock: &MockTransport) -> RequestEngine<MockTransport> {
        let mut transport = mock.clone();
        transport.open().unwrap();
        RequestEngine::new(transport, None)
    }

    fn fast_poll() -> Arc<dyn PollingPolicy> {
        Arc::new(ConstantPolling(Duration::from_millis(1)))
    }

    #[test]
    fn test_requests_init_in_submission_order() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);

        let first = engine.submit(20, None, TIMEOUT, fast_poll()).unwrap();
        let second = engine.submit(30, None, TIMEOUT, fast_poll()).unwrap();
        let third = engine.submit(40, None, TIMEOUT, fast_poll()).unwrap();
        for id in [first, second, third] {
            engine.wait(id).unwrap();
        }

        let init_types: Vec<u16> = mock
            .service_transfers()
            .iter()
            .filter(|(k, _)| *k == ServiceKind::Init)
            .map(|(_, s)| s.w_value)
            .collect();
        assert_eq!(init_types, vec![20, 30, 40]);
    }

    #[test]
    fn test_deferred_allocation_sends_payload_after_ok() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        mock.set_behavior(10, MockBehavior::DeferredAlloc { alloc_checks: 2 });

        let id = engine
            .submit(
                10,
                Some(RequestData::Bytes(b"deferred".to_vec())),
                TIMEOUT,
                fast_poll(),
            )
            .unwrap();
        let reply = engine.wait(id).unwrap();
        assert_eq!(reply.result, 0);
        assert_eq!(
            reply.data,
            Some(ReplyData::Bytes(b"deferred".to_vec()))
        );

        let kinds: Vec<ServiceKind> = mock.service_transfers().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                ServiceKind::Init,
                ServiceKind::Check,
                ServiceKind::Check,
                ServiceKind::Send,
                ServiceKind::Check,
                ServiceKind::Recv,
            ]
        );
    }

    #[test]
    fn test_pending_without_payload_is_protocol_error() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        mock.set_behavior(10, MockBehavior::DeferredAlloc { alloc_checks: 1 });

        let id = engine.submit(10, None, TIMEOUT, fast_poll()).unwrap();
        let err = engine.wait(id).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        // The allocated slot is still reclaimed.
        engine.pump_until_quiet();
        assert_eq!(mock.count_of(ServiceKind::Reset), 1);
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn test_vanished_slot_reports_cancellation() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        mock.set_behavior(10, MockBehavior::VanishAfter { checks: 1 });

        let id = engine.submit(10, None, TIMEOUT, fast_poll()).unwrap();
        let err = engine.wait(id).unwrap_err();
        match err {
            Error::Device(msg) => assert_eq!(msg, "Request was cancelled"),
            other => panic!("unexpected error: {other:?}"),
        }
        engine.pump_until_quiet();
        // Nothing left to reclaim.
        assert_eq!(mock.count_of(ServiceKind::Reset), 0);
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn test_no_memory_on_init() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        mock.set_behavior(10, MockBehavior::NoMemoryOnInit);

        let id = engine.submit(10, None, TIMEOUT, fast_poll()).unwrap();
        let err = engine.wait(id).unwrap_err();
        assert!(matches!(err, Error::Memory));
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn test_truncated_reply_payload_is_protocol_error() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        mock.set_behavior(
            10,
            MockBehavior::Reply {
                result: 0,
                data: vec![1, 2, 3, 4],
                checks: 0,
            },
        );
        mock.set_truncate_recv(2);

        let id = engine.submit(10, None, TIMEOUT, fast_poll()).unwrap();
        let err = engine.wait(id).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_zero_delay_polling_still_yields_per_check() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        mock.set_behavior(
            10,
            MockBehavior::Reply {
                result: 0,
                data: Vec::new(),
                checks: 2,
            },
        );

        let id = engine
            .submit(10, None, TIMEOUT, Arc::new(ConstantPolling(Duration::ZERO)))
            .unwrap();
        engine.wait(id).unwrap();
        assert_eq!(mock.count_of(ServiceKind::Check), 3);
    }

    #[test]
    fn test_reset_all_runs_before_other_work() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        engine.schedule_reset_all();
        engine.submit(40, None, TIMEOUT, fast_poll()).unwrap();
        engine.pump_until_quiet();

        let transfers = mock.service_transfers();
        assert_eq!(transfers[0].0, ServiceKind::Reset);
        assert_eq!(transfers[0].1.w_value, 0);
        assert_eq!(transfers[1].0, ServiceKind::Init);
    }

    #[test]
    fn test_submission_rejected_once_closing() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        engine.begin_close(true, None);
        let err = engine.submit(40, None, TIMEOUT, fast_poll()).unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[test]
    fn test_close_timeout_rejects_stuck_requests() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        mock.set_behavior(10, MockBehavior::NeverComplete);

        let id = engine.submit(10, None, TIMEOUT, fast_poll()).unwrap();
        // Get the request onto the device first.
        engine.pump_step();
        engine.begin_close(true, Some(Duration::from_millis(50)));
        engine.drive_close();

        assert!(engine.is_closed());
        let err = engine.wait(id).unwrap_err();
        assert!(matches!(err, Error::State(_)));
        // The active slot was swept by a global RESET before closing.
        let resets: Vec<u16> = mock
            .service_transfers()
            .iter()
            .filter(|(k, _)| *k == ServiceKind::Reset)
            .map(|(_, s)| s.w_value)
            .collect();
        assert_eq!(resets, vec![0]);
    }
}
