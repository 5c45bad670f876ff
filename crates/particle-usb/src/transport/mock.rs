//! Mock USB transport for testing.
//!
//! Models the device side of the service protocol: slots, per-request-type
//! behaviors, and a transfer log for bit-exact assertions. All state sits
//! behind an `Arc` so tests can keep a handle while the engine owns the
//! transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::{
    STATUS_BUSY, STATUS_NO_MEMORY, STATUS_NOT_FOUND, STATUS_OK, STATUS_PENDING, ServiceKind,
    SetupPacket, encode_reply,
};

/// Scripted device-side behavior for one request type.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Reply PENDING to `checks` CHECK polls, then complete with the given
    /// result and reply payload.
    Reply {
        result: i32,
        data: Vec<u8>,
        checks: u32,
    },
    /// Like `Reply`, but the reply payload echoes the request payload.
    Echo { checks: u32 },
    /// INIT replies PENDING; the payload buffer is allocated after
    /// `alloc_checks` CHECK polls, then the request completes echoing.
    DeferredAlloc { alloc_checks: u32 },
    /// Reply PENDING forever.
    NeverComplete,
    /// INIT replies NO_MEMORY.
    NoMemoryOnInit,
    /// The slot disappears (NOT_FOUND) after `checks` CHECK polls.
    VanishAfter { checks: u32 },
}

impl Default for MockBehavior {
    fn default() -> Self {
        MockBehavior::Reply {
            result: 0,
            data: Vec::new(),
            checks: 0,
        }
    }
}

#[derive(Debug)]
struct Slot {
    behavior: MockBehavior,
    data: Option<Vec<u8>>,
    alloc_pending: bool,
    alloc_checks_seen: u32,
    pending_replies: u32,
    terminal: bool,
    reply_data: Vec<u8>,
    result: i32,
}

/// One captured control transfer.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub setup: SetupPacket,
    /// OUT data stage, if any.
    pub data: Option<Vec<u8>>,
}

#[derive(Debug)]
struct MockState {
    vid: u16,
    pid: u16,
    serial: Option<String>,
    opened: bool,
    connected: bool,
    next_proto_id: u16,
    slots: HashMap<u16, Slot>,
    behaviors: HashMap<u16, MockBehavior>,
    /// Device-side concurrency cap; INIT replies BUSY past it.
    capacity: Option<usize>,
    /// Truncate RECV data stages to this length, to provoke size mismatches.
    truncate_recv: Option<usize>,
    log: Vec<Transfer>,
}

/// Mock transport for unit testing the request engine.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                vid: 0x2B04,
                pid: 0xC006,
                serial: Some("E00FCE68F1D2A3B4C5D6E7F8".to_string()),
                opened: false,
                connected: true,
                next_proto_id: 1,
                slots: HashMap::new(),
                behaviors: HashMap::new(),
                capacity: None,
                truncate_recv: None,
                log: Vec::new(),
            })),
        }
    }

    /// Script the behavior for a request type.
    pub fn set_behavior(&self, request_type: u16, behavior: MockBehavior) {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .insert(request_type, behavior);
    }

    /// Cap concurrent slots; INIT replies BUSY past the cap.
    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().unwrap().capacity = Some(capacity);
    }

    /// Control the next assigned slot id.
    pub fn set_next_proto_id(&self, proto_id: u16) {
        self.state.lock().unwrap().next_proto_id = proto_id;
    }

    pub fn set_serial(&self, serial: Option<&str>) {
        self.state.lock().unwrap().serial = serial.map(str::to_string);
    }

    pub fn set_truncate_recv(&self, len: usize) {
        self.state.lock().unwrap().truncate_recv = Some(len);
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().connected = false;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().opened
    }

    /// All captured transfers.
    pub fn transfers(&self) -> Vec<Transfer> {
        self.state.lock().unwrap().log.clone()
    }

    /// Captured service transfers as (kind, setup) pairs.
    pub fn service_transfers(&self) -> Vec<(ServiceKind, SetupPacket)> {
        self.transfers()
            .into_iter()
            .filter_map(|t| t.setup.service_kind().map(|k| (k, t.setup)))
            .collect()
    }

    /// Number of captured transfers of one service kind.
    pub fn count_of(&self, kind: ServiceKind) -> usize {
        self.service_transfers()
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    /// Live device-side slots (allocated, not yet terminal).
    pub fn live_slots(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .slots
            .values()
            .filter(|s| !s.terminal)
            .count()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn handle_init(state: &mut MockState, setup: &SetupPacket) -> Vec<u8> {
    let request_type = setup.w_value;
    let behavior = state
        .behaviors
        .get(&request_type)
        .cloned()
        .unwrap_or_default();

    if matches!(behavior, MockBehavior::NoMemoryOnInit) {
        return encode_reply(STATUS_NO_MEMORY, 0, 0, 0);
    }
    let live = state.slots.values().filter(|s| !s.terminal).count();
    if state.capacity.is_some_and(|cap| live >= cap) {
        return encode_reply(STATUS_BUSY, 0, 0, 0);
    }

    let proto_id = state.next_proto_id;
    state.next_proto_id += 1;
    let alloc_pending = matches!(behavior, MockBehavior::DeferredAlloc { .. });
    state.slots.insert(
        proto_id,
        Slot {
            behavior,
            data: None,
            alloc_pending,
            alloc_checks_seen: 0,
            pending_replies: 0,
            terminal: false,
            reply_data: Vec::new(),
            result: 0,
        },
    );
    let status = if alloc_pending { STATUS_PENDING } else { STATUS_OK };
    encode_reply(status, proto_id, 0, 0)
}

fn handle_check(state: &mut MockState, setup: &SetupPacket) -> Vec<u8> {
    let proto_id = setup.w_value;

    enum Outcome {
        NotFound,
        Pending,
        AllocReady,
        Terminal { size: u32, result: i32 },
        Vanish,
        Complete { size: u32, result: i32 },
    }

    let outcome = match state.slots.get_mut(&proto_id) {
        None => Outcome::NotFound,
        Some(slot) => {
            if slot.alloc_pending {
                slot.alloc_checks_seen += 1;
                let MockBehavior::DeferredAlloc { alloc_checks } = slot.behavior else {
                    unreachable!();
                };
                if slot.alloc_checks_seen >= alloc_checks {
                    slot.alloc_pending = false;
                    Outcome::AllocReady
                } else {
                    Outcome::Pending
                }
            } else if slot.terminal {
                Outcome::Terminal {
                    size: slot.reply_data.len() as u32,
                    result: slot.result,
                }
            } else if let MockBehavior::VanishAfter { checks } = slot.behavior {
                slot.pending_replies += 1;
                if slot.pending_replies > checks {
                    Outcome::Vanish
                } else {
                    Outcome::Pending
                }
            } else {
                let (result, data, checks) = match &slot.behavior {
                    MockBehavior::Reply {
                        result,
                        data,
                        checks,
                    } => (*result, data.clone(), *checks),
                    MockBehavior::Echo { checks } => {
                        (0, slot.data.clone().unwrap_or_default(), *checks)
                    }
                    MockBehavior::DeferredAlloc { .. } => {
                        (0, slot.data.clone().unwrap_or_default(), 0)
                    }
                    MockBehavior::NeverComplete => (0, Vec::new(), u32::MAX),
                    MockBehavior::VanishAfter { .. } | MockBehavior::NoMemoryOnInit => {
                        unreachable!()
                    }
                };
                if slot.pending_replies < checks {
                    slot.pending_replies += 1;
                    Outcome::Pending
                } else {
                    slot.terminal = true;
                    slot.result = result;
                    let size = data.len() as u32;
                    slot.reply_data = data;
                    Outcome::Complete { size, result }
                }
            }
        }
    };

    match outcome {
        Outcome::NotFound => encode_reply(STATUS_NOT_FOUND, proto_id, 0, 0),
        Outcome::Pending => encode_reply(STATUS_PENDING, proto_id, 0, 0),
        Outcome::AllocReady => encode_reply(STATUS_OK, proto_id, 0, 0),
        Outcome::Terminal { size, result } => encode_reply(STATUS_OK, proto_id, size, result),
        Outcome::Vanish => {
            state.slots.remove(&proto_id);
            encode_reply(STATUS_NOT_FOUND, proto_id, 0, 0)
        }
        Outcome::Complete { size, result } => {
            if size == 0 {
                // Nothing to RECV; the slot is gone once the host sees this.
                state.slots.remove(&proto_id);
            }
            encode_reply(STATUS_OK, proto_id, size, result)
        }
    }
}

fn handle_recv(state: &mut MockState, setup: &SetupPacket) -> Result<Vec<u8>, TransportError> {
    let proto_id = setup.w_value;
    let Some(slot) = state.slots.get(&proto_id) else {
        return Err(TransportError::TransferFailed(format!(
            "RECV for unknown slot {proto_id}"
        )));
    };
    if !slot.terminal {
        return Err(TransportError::TransferFailed(format!(
            "RECV before completion of slot {proto_id}"
        )));
    }
    let mut data = slot.reply_data.clone();
    if let Some(len) = state.truncate_recv {
        data.truncate(len);
    }
    state.slots.remove(&proto_id);
    Ok(data)
}

impl UsbTransport for MockTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::OpenFailed("device is gone".to_string()));
        }
        state.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().opened = false;
        Ok(())
    }

    fn transfer_in(&self, setup: &SetupPacket) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if !state.opened {
            return Err(TransportError::TransferFailed("device is not open".to_string()));
        }
        state.log.push(Transfer {
            setup: *setup,
            data: None,
        });
        match setup.service_kind() {
            Some(ServiceKind::Init) => Ok(handle_init(&mut state, setup)),
            Some(ServiceKind::Check) => Ok(handle_check(&mut state, setup)),
            Some(ServiceKind::Recv) => handle_recv(&mut state, setup),
            _ => Err(TransportError::TransferFailed(format!(
                "unsupported IN transfer: {setup}"
            ))),
        }
    }

    fn transfer_out(&self, setup: &SetupPacket, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if !state.opened {
            return Err(TransportError::TransferFailed("device is not open".to_string()));
        }
        state.log.push(Transfer {
            setup: *setup,
            data: Some(data.to_vec()),
        });
        match setup.service_kind() {
            Some(ServiceKind::Send) => {
                let proto_id = setup.w_value;
                match state.slots.get_mut(&proto_id) {
                    Some(slot) => {
                        slot.data = Some(data.to_vec());
                        Ok(())
                    }
                    None => Err(TransportError::TransferFailed(format!(
                        "SEND for unknown slot {proto_id}"
                    ))),
                }
            }
            Some(ServiceKind::Reset) => {
                if setup.w_value == 0 {
                    state.slots.clear();
                } else {
                    state.slots.remove(&setup.w_value);
                }
                Ok(())
            }
            _ => Err(TransportError::TransferFailed(format!(
                "unsupported OUT transfer: {setup}"
            ))),
        }
    }

    fn serial_number(&self) -> Option<String> {
        self.state.lock().unwrap().serial.clone()
    }

    fn vendor_id(&self) -> u16 {
        self.state.lock().unwrap().vid
    }

    fn product_id(&self) -> u16 {
        self.state.lock().unwrap().pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServiceReply, Status, check_setup, init_setup, reset_setup, send_setup};

    fn open_mock() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.open().unwrap();
        mock
    }

    #[test]
    fn test_init_assigns_slot_ids() {
        let mock = open_mock();
        mock.set_next_proto_id(7);

        let frame = mock.transfer_in(&init_setup(40, 0)).unwrap();
        let reply = ServiceReply::from_bytes(&frame).unwrap();
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.id, Some(7));
    }

    #[test]
    fn test_echo_completes_after_send() {
        let mock = open_mock();
        mock.set_behavior(112, MockBehavior::Echo { checks: 0 });

        let frame = mock.transfer_in(&init_setup(112, 5)).unwrap();
        let proto_id = ServiceReply::from_bytes(&frame).unwrap().id.unwrap();
        mock.transfer_out(&send_setup(proto_id, 5), b"hello").unwrap();

        let frame = mock.transfer_in(&check_setup(proto_id)).unwrap();
        let reply = ServiceReply::from_bytes(&frame).unwrap();
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.size, Some(5));
    }

    #[test]
    fn test_capacity_replies_busy() {
        let mock = open_mock();
        mock.set_capacity(1);
        mock.set_behavior(40, MockBehavior::NeverComplete);

        let frame = mock.transfer_in(&init_setup(40, 0)).unwrap();
        assert_eq!(ServiceReply::from_bytes(&frame).unwrap().status, Status::Ok);

        let frame = mock.transfer_in(&init_setup(40, 0)).unwrap();
        assert_eq!(ServiceReply::from_bytes(&frame).unwrap().status, Status::Busy);
    }

    #[test]
    fn test_reset_all_clears_slots() {
        let mock = open_mock();
        mock.set_behavior(40, MockBehavior::NeverComplete);
        let frame = mock.transfer_in(&init_setup(40, 0)).unwrap();
        let proto_id = ServiceReply::from_bytes(&frame).unwrap().id.unwrap();
        assert_eq!(mock.live_slots(), 1);

        mock.transfer_out(&reset_setup(0), &[]).unwrap();
        assert_eq!(mock.live_slots(), 0);

        let frame = mock.transfer_in(&check_setup(proto_id)).unwrap();
        assert_eq!(
            ServiceReply::from_bytes(&frame).unwrap().status,
            Status::NotFound
        );
    }

    #[test]
    fn test_disconnect_fails_transfers() {
        let mock = open_mock();
        mock.disconnect();
        assert!(mock.transfer_in(&init_setup(40, 0)).is_err());
    }
}
