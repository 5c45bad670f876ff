//! Device façade.
//!
//! Stateful wrapper owning the transport and the request engine, holding
//! device identity while open, and emitting lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::OpenOptions;
use crate::device_type::DeviceType;
use crate::dfu::DfuClient;
use crate::engine::RequestEngine;
use crate::engine::request::{DefaultPolling, PollingPolicy, Reply, RequestData};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, DeviceObserver, TracingObserver};
use crate::protocol::{REQUEST_SYSTEM_VERSION, RESULT_OK};
use crate::transport::{NusbTransport, UsbTransport};

/// Lifecycle state of a device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Per-request options for [`Device::send_request`].
#[derive(Clone)]
pub struct SendRequestOptions {
    /// Deadline for the whole logical request. `None` uses the open-time
    /// default.
    pub timeout: Option<Duration>,
    /// CHECK polling schedule.
    pub polling: Arc<dyn PollingPolicy>,
    /// Return the reply even when `result` is non-OK instead of failing.
    pub dont_throw: bool,
}

impl Default for SendRequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            polling: Arc::new(DefaultPolling),
            dont_throw: false,
        }
    }
}

/// Options for [`Device::close`].
#[derive(Debug, Clone)]
pub struct CloseOptions {
    /// Let outstanding requests finish before closing. When false, they are
    /// rejected immediately.
    pub process_pending: bool,
    /// Bound on the drain; on expiry unfinished requests are rejected.
    pub timeout: Option<Duration>,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self {
            process_pending: true,
            timeout: None,
        }
    }
}

/// A handle to one device.
pub struct Device<T: UsbTransport> {
    engine: RequestEngine<T>,
    state: DeviceState,
    device_type: DeviceType,
    dfu_mode: bool,
    device_id: Option<String>,
    firmware_version: Option<String>,
    options: OpenOptions,
    observer: Arc<dyn DeviceObserver>,
}

impl<T: UsbTransport> Device<T> {
    pub fn new(transport: T, device_type: DeviceType, dfu_mode: bool) -> Self {
        Self::with_options(transport, device_type, dfu_mode, OpenOptions::default())
    }

    pub fn with_options(
        mut transport: T,
        device_type: DeviceType,
        dfu_mode: bool,
        options: OpenOptions,
    ) -> Self {
        transport.set_transfer_timeout(Duration::from_millis(options.control_transfer_timeout_ms));
        Self {
            engine: RequestEngine::new(transport, options.max_active),
            state: DeviceState::Closed,
            device_type,
            dfu_mode,
            device_id: None,
            firmware_version: None,
            options,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Replace the event observer.
    pub fn set_observer(&mut self, observer: Arc<dyn DeviceObserver>) {
        self.observer = observer;
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Lowercase device id, from the USB serial-number descriptor.
    pub fn id(&self) -> Option<&str> {
        match self.state {
            DeviceState::Open => self.device_id.as_deref(),
            _ => None,
        }
    }

    pub fn firmware_version(&self) -> Option<&str> {
        match self.state {
            DeviceState::Open => self.firmware_version.as_deref(),
            _ => None,
        }
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        match self.state {
            DeviceState::Open => Some(self.device_type),
            _ => None,
        }
    }

    pub fn is_in_dfu_mode(&self) -> Option<bool> {
        match self.state {
            DeviceState::Open => Some(self.dfu_mode),
            _ => None,
        }
    }

    /// Learned or configured device-side concurrency cap.
    pub fn max_active(&self) -> Option<u16> {
        self.engine.max_active()
    }

    /// Requests currently holding a device-side slot.
    pub fn active_count(&self) -> u16 {
        self.engine.active_count()
    }

    /// Open the device: USB open, serial-number read, slot cleanup, and a
    /// tolerant firmware-version query.
    #[instrument(level = "info", skip(self), fields(device_type = %self.device_type))]
    pub fn open(&mut self) -> Result<()> {
        if self.state != DeviceState::Closed {
            return Err(Error::State("Device is already open".to_string()));
        }
        self.state = DeviceState::Opening;
        match self.do_open() {
            Ok(device_id) => {
                self.device_id = Some(device_id.clone());
                self.state = DeviceState::Open;
                self.observer.on_event(&DeviceEvent::Open { device_id });
                Ok(())
            }
            Err(err) => {
                self.state = DeviceState::Closed;
                self.device_id = None;
                self.firmware_version = None;
                Err(err)
            }
        }
    }

    fn do_open(&mut self) -> Result<String> {
        self.engine.transport_mut().open()?;
        let serial = self
            .engine
            .transport()
            .serial_number()
            .ok_or_else(|| Error::Device("Device has no serial number".to_string()))?;
        let device_id = serial.to_lowercase();

        if !self.dfu_mode {
            // Reclaim slots left on the device by a previous host session
            // before any work is accepted.
            self.engine.schedule_reset_all();
            self.engine.pump_until_quiet();

            match self.query_version() {
                Ok(version) => self.firmware_version = version,
                Err(err) => {
                    debug!(error = %err, "Firmware version query failed");
                    self.firmware_version = None;
                }
            }
        }
        Ok(device_id)
    }

    fn query_version(&mut self) -> Result<Option<String>> {
        let id = self.engine.submit(
            REQUEST_SYSTEM_VERSION,
            None,
            Duration::from_millis(self.options.default_request_timeout_ms),
            Arc::new(DefaultPolling),
        )?;
        let reply = self.engine.wait(id)?;
        if reply.result != RESULT_OK {
            return Err(Error::from_result(reply.result));
        }
        Ok(reply
            .data
            .map(|data| String::from_utf8_lossy(data.as_bytes()).into_owned()))
    }

    fn ensure_open_for_requests(&self) -> Result<()> {
        match self.state {
            DeviceState::Open => {}
            DeviceState::Closing => {
                return Err(Error::State("Device is being closed".to_string()));
            }
            _ => return Err(Error::State("Device is not open".to_string())),
        }
        if self.dfu_mode {
            return Err(Error::State("Device is in DFU mode".to_string()));
        }
        Ok(())
    }

    /// Submit a logical request without waiting. Combine with
    /// [`wait_request`](Self::wait_request) to multiplex requests.
    pub fn submit_request(
        &mut self,
        request_type: u16,
        payload: Option<RequestData>,
        options: &SendRequestOptions,
    ) -> Result<u32> {
        self.ensure_open_for_requests()?;
        let timeout = options
            .timeout
            .unwrap_or(Duration::from_millis(self.options.default_request_timeout_ms));
        self.engine
            .submit(request_type, payload, timeout, options.polling.clone())
    }

    /// Drive the engine until the given request completes.
    pub fn wait_request(&mut self, id: u32) -> Result<Reply> {
        self.engine.wait(id)
    }

    /// Give the engine a chance to run queued work (slot reclaims and polls
    /// for multiplexed requests) without waiting on any particular request.
    pub fn pump(&mut self) {
        self.engine.pump_until_quiet();
    }

    /// Submit a request and wait for the reply.
    ///
    /// Unless `dont_throw` is set, a non-OK `result` fails the call with a
    /// message from the known-code table.
    pub fn send_request(
        &mut self,
        request_type: u16,
        payload: Option<RequestData>,
        options: &SendRequestOptions,
    ) -> Result<Reply> {
        let id = self.submit_request(request_type, payload, options)?;
        let reply = self.wait_request(id)?;
        if !options.dont_throw && reply.result != RESULT_OK {
            return Err(Error::from_result(reply.result));
        }
        Ok(reply)
    }

    /// Drive the DFU state machine to leave bootloader mode. The device
    /// resets itself afterwards; the handle must only be closed.
    pub fn leave_dfu_mode(&mut self) -> Result<()> {
        if self.state != DeviceState::Open {
            return Err(Error::State("Device is not open".to_string()));
        }
        if !self.dfu_mode {
            return Err(Error::State("Device is not in DFU mode".to_string()));
        }
        DfuClient::new(self.engine.transport()).leave()
    }

    /// Close the device, draining or rejecting outstanding requests per the
    /// options.
    #[instrument(level = "info", skip(self))]
    pub fn close(&mut self, options: &CloseOptions) -> Result<()> {
        if self.state == DeviceState::Closed {
            return Ok(());
        }
        self.state = DeviceState::Closing;
        self.engine
            .begin_close(options.process_pending, options.timeout);
        self.engine.drive_close();

        self.state = DeviceState::Closed;
        let device_id = self.device_id.take().unwrap_or_default();
        self.firmware_version = None;
        info!(device_id = %device_id, "Handle closed");
        self.observer.on_event(&DeviceEvent::Closed { device_id });
        Ok(())
    }
}

/// Enumerate all plugged devices matching the static device table.
pub fn list_devices() -> Result<Vec<Device<NusbTransport>>> {
    let transports = NusbTransport::enumerate()?;
    Ok(transports
        .into_iter()
        .map(|transport| {
            let entry = transport.device_entry();
            let dfu_mode = transport.is_dfu_mode();
            Device::new(transport, entry.device_type, dfu_mode)
        })
        .collect())
}

/// Open the device with the given id: enumerate, open each candidate,
/// compare the lowercase serial number, and close the others.
pub fn open_device_by_id(id: &str) -> Result<Device<NusbTransport>> {
    let wanted = id.to_lowercase();
    let mut found = None;
    for mut device in list_devices()? {
        if let Err(err) = device.open() {
            warn!(error = %err, "Skipping device that failed to open");
            continue;
        }
        if found.is_none() && device.id() == Some(wanted.as_str()) {
            found = Some(device);
        } else {
            device.close(&CloseOptions::default())?;
        }
    }
    found.ok_or_else(|| Error::NotFound(format!("Device not found: {wanted}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::engine::request::ConstantPolling;
    use crate::protocol::ServiceKind;
    use crate::transport::{MockBehavior, MockTransport};

    fn fast_options() -> SendRequestOptions {
        SendRequestOptions {
            timeout: Some(Duration::from_secs(5)),
            polling: Arc::new(ConstantPolling(Duration::from_millis(1))),
            dont_throw: false,
        }
    }

    fn open_device(mock: &MockTransport) -> Device<MockTransport> {
        let mut device = Device::new(mock.clone(), DeviceType::Photon, false);
        device.open().unwrap();
        mock.clear_log();
        device
    }

    #[test]
    fn test_open_reads_lowercase_id_and_resets_slots() {
        let mock = MockTransport::new();
        let mut device = Device::new(mock.clone(), DeviceType::Photon, false);
        device.open().unwrap();

        assert_eq!(device.id(), Some("e00fce68f1d2a3b4c5d6e7f8"));
        assert_eq!(device.device_type(), Some(DeviceType::Photon));
        assert_eq!(device.is_in_dfu_mode(), Some(false));

        // The first transfer of the open cycle reclaims all slots.
        let transfers = mock.service_transfers();
        assert_eq!(transfers[0].0, ServiceKind::Reset);
        assert_eq!(transfers[0].1.w_value, 0);
    }

    #[test]
    fn test_open_twice_fails() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        let err = device.open().unwrap_err();
        match err {
            Error::State(msg) => assert_eq!(msg, "Device is already open"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_version_query_failure_is_tolerated() {
        let mock = MockTransport::new();
        mock.set_behavior(
            crate::protocol::REQUEST_SYSTEM_VERSION,
            MockBehavior::Reply {
                result: crate::protocol::RESULT_NOT_SUPPORTED,
                data: Vec::new(),
                checks: 0,
            },
        );
        let mut device = Device::new(mock.clone(), DeviceType::Photon, false);
        device.open().unwrap();
        assert_eq!(device.firmware_version(), None);
    }

    #[test]
    fn test_version_query_populates_version() {
        let mock = MockTransport::new();
        mock.set_behavior(
            crate::protocol::REQUEST_SYSTEM_VERSION,
            MockBehavior::Reply {
                result: 0,
                data: b"1.5.2".to_vec(),
                checks: 0,
            },
        );
        let mut device = Device::new(mock.clone(), DeviceType::Photon, false);
        device.open().unwrap();
        assert_eq!(device.firmware_version(), Some("1.5.2"));
    }

    #[test]
    fn test_happy_path_without_payload() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        mock.set_next_proto_id(7);

        let reply = device.send_request(40, None, &fast_options()).unwrap();
        assert_eq!(reply.result, 0);
        assert!(reply.data.is_none());

        let kinds: Vec<ServiceKind> = mock.service_transfers().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![ServiceKind::Init, ServiceKind::Check]);
        let transfers = mock.service_transfers();
        assert_eq!(transfers[0].1.w_value, 40);
        assert_eq!(transfers[1].1.w_value, 7);
        assert_eq!(device.active_count(), 0);
    }

    #[test]
    fn test_request_with_payload_and_reply() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        mock.set_next_proto_id(11);
        let reply_bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
        mock.set_behavior(
            112,
            MockBehavior::Reply {
                result: 0,
                data: reply_bytes.clone(),
                checks: 1,
            },
        );

        let payload: Vec<u8> = (0..16).collect();
        let reply = device
            .send_request(112, Some(RequestData::Bytes(payload.clone())), &fast_options())
            .unwrap();
        assert_eq!(reply.result, 0);
        assert_eq!(
            reply.data,
            Some(crate::engine::request::ReplyData::Bytes(reply_bytes))
        );

        let transfers = mock.transfers();
        let kinds: Vec<ServiceKind> = mock.service_transfers().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                ServiceKind::Init,
                ServiceKind::Send,
                ServiceKind::Check,
                ServiceKind::Check,
                ServiceKind::Recv,
            ]
        );
        // SEND carries the whole payload in one data stage.
        let send = transfers
            .iter()
            .find(|t| t.setup.service_kind() == Some(ServiceKind::Send))
            .unwrap();
        assert_eq!(send.data.as_deref(), Some(payload.as_slice()));
        assert_eq!(send.setup.w_value, 11);
        // RECV asks for exactly the advertised reply size.
        let recv = transfers
            .iter()
            .find(|t| t.setup.service_kind() == Some(ServiceKind::Recv))
            .unwrap();
        assert_eq!(recv.setup.w_length, 4);
    }

    #[test]
    fn test_text_round_trip() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        mock.set_behavior(10, MockBehavior::Echo { checks: 0 });

        let reply = device
            .send_request(10, Some(RequestData::from("loopback µ")), &fast_options())
            .unwrap();
        match reply.data {
            Some(crate::engine::request::ReplyData::Text(text)) => {
                assert_eq!(text, "loopback µ");
            }
            other => panic!("expected text reply, got {other:?}"),
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        mock.set_behavior(10, MockBehavior::Echo { checks: 0 });

        let payload = vec![0u8, 1, 255, 7];
        let reply = device
            .send_request(10, Some(RequestData::Bytes(payload.clone())), &fast_options())
            .unwrap();
        assert_eq!(
            reply.data,
            Some(crate::engine::request::ReplyData::Bytes(payload))
        );
    }

    #[test]
    fn test_busy_learns_concurrency_cap() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        mock.set_capacity(3);
        mock.set_behavior(
            90,
            MockBehavior::Reply {
                result: 0,
                data: Vec::new(),
                checks: 4,
            },
        );

        let options = SendRequestOptions {
            timeout: Some(Duration::from_secs(10)),
            polling: Arc::new(ConstantPolling(Duration::from_millis(10))),
            dont_throw: false,
        };
        let ids: Vec<u32> = (0..4)
            .map(|_| device.submit_request(90, None, &options).unwrap())
            .collect();
        for id in &ids {
            device.wait_request(*id).unwrap();
        }

        assert_eq!(device.max_active(), Some(3));
        assert_eq!(device.active_count(), 0);
        // Three INITs succeed, the fourth bounces off BUSY and is attempted
        // again once a slot frees up.
        let init_count = mock.count_of(ServiceKind::Init);
        assert!(init_count >= 5, "expected a re-attempted INIT, saw {init_count}");
    }

    #[test]
    fn test_timeout_reclaims_slot() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        mock.set_behavior(100, MockBehavior::NeverComplete);

        let options = SendRequestOptions {
            timeout: Some(Duration::from_millis(100)),
            polling: Arc::new(ConstantPolling(Duration::from_millis(5))),
            dont_throw: false,
        };
        let err = device.send_request(100, None, &options).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        device.pump();

        let transfers = mock.service_transfers();
        let check = transfers
            .iter()
            .find(|(k, _)| *k == ServiceKind::Check)
            .expect("at least one CHECK before the timeout");
        let proto_id = check.1.w_value;
        let reset = transfers
            .iter()
            .find(|(k, _)| *k == ServiceKind::Reset)
            .expect("slot RESET after timeout");
        assert_eq!(reset.1.w_value, proto_id);
        assert_ne!(proto_id, 0);
        assert_eq!(device.active_count(), 0);
        assert_eq!(mock.live_slots(), 0);
    }

    #[test]
    fn test_zero_timeout_rejects_without_transfers() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);

        let options = SendRequestOptions {
            timeout: Some(Duration::ZERO),
            ..fast_options()
        };
        let err = device.send_request(40, None, &options).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(mock.transfers().is_empty());
    }

    #[test]
    fn test_oversized_payload_rejected_synchronously() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);

        let err = device
            .send_request(
                10,
                Some(RequestData::Bytes(vec![0u8; 65536])),
                &fast_options(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Device(_)));
        assert!(mock.transfers().is_empty());
    }

    #[test]
    fn test_max_payload_accepted() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        mock.set_behavior(10, MockBehavior::Reply { result: 0, data: Vec::new(), checks: 0 });

        let payload = vec![0x5A; 65535];
        device
            .send_request(10, Some(RequestData::Bytes(payload.clone())), &fast_options())
            .unwrap();
        let transfers = mock.transfers();
        let send = transfers
            .iter()
            .find(|t| t.setup.service_kind() == Some(ServiceKind::Send))
            .unwrap();
        assert_eq!(send.setup.w_length, 65535);
        assert_eq!(send.data.as_ref().unwrap().len(), 65535);
    }

    #[test]
    fn test_non_ok_result_fails_unless_dont_throw() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        mock.set_behavior(
            70,
            MockBehavior::Reply {
                result: crate::protocol::RESULT_INVALID_STATE,
                data: Vec::new(),
                checks: 0,
            },
        );

        let err = device.send_request(70, None, &fast_options()).unwrap_err();
        match err {
            Error::Request { result, message } => {
                assert_eq!(result, -210);
                assert_eq!(message, "Invalid state");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let options = SendRequestOptions {
            dont_throw: true,
            ..fast_options()
        };
        let reply = device.send_request(70, None, &options).unwrap();
        assert_eq!(reply.result, -210);
    }

    #[test]
    fn test_close_cancels_pending_requests() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        mock.set_behavior(100, MockBehavior::NeverComplete);

        let options = fast_options();
        let first = device.submit_request(100, None, &options).unwrap();
        let second = device.submit_request(100, None, &options).unwrap();

        device
            .close(&CloseOptions {
                process_pending: false,
                timeout: None,
            })
            .unwrap();

        for id in [first, second] {
            let err = device.wait_request(id).unwrap_err();
            match err {
                Error::State(msg) => assert_eq!(msg, "Device is being closed"),
                other => panic!("unexpected error: {other:?}"),
            }
        }
        assert!(!mock.is_open());
        // Neither request reached the wire.
        assert_eq!(mock.count_of(ServiceKind::Init), 0);
        assert_eq!(device.id(), None);
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn test_close_drains_outstanding_requests() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        mock.set_behavior(
            90,
            MockBehavior::Reply {
                result: 0,
                data: Vec::new(),
                checks: 2,
            },
        );

        let id = device.submit_request(90, None, &fast_options()).unwrap();
        device.close(&CloseOptions::default()).unwrap();

        let reply = device.wait_request(id).unwrap();
        assert_eq!(reply.result, 0);
        assert!(!mock.is_open());
    }

    #[test]
    fn test_submission_after_close_fails() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        device.close(&CloseOptions::default()).unwrap();
        let err = device
            .send_request(40, None, &fast_options())
            .unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[test]
    fn test_events_fire_once_per_open_cycle() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);
        impl DeviceObserver for Recorder {
            fn on_event(&self, event: &DeviceEvent) {
                self.0.lock().unwrap().push(event.to_string());
            }
        }

        let mock = MockTransport::new();
        let recorder = Arc::new(Recorder::default());
        let mut device = Device::new(mock.clone(), DeviceType::Photon, false);
        device.set_observer(recorder.clone());

        device.open().unwrap();
        device.close(&CloseOptions::default()).unwrap();
        // Second close is a no-op.
        device.close(&CloseOptions::default()).unwrap();

        let events = recorder.0.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "open(e00fce68f1d2a3b4c5d6e7f8)".to_string(),
                "closed(e00fce68f1d2a3b4c5d6e7f8)".to_string(),
            ]
        );
    }

    #[test]
    fn test_accessors_are_none_when_closed() {
        let mock = MockTransport::new();
        let mut device = open_device(&mock);
        device.close(&CloseOptions::default()).unwrap();
        assert_eq!(device.id(), None);
        assert_eq!(device.firmware_version(), None);
        assert_eq!(device.device_type(), None);
        assert_eq!(device.is_in_dfu_mode(), None);
    }

    #[test]
    fn test_dfu_handle_rejects_service_requests() {
        let mock = MockTransport::new();
        let mut device = Device::new(mock.clone(), DeviceType::Photon, true);
        device.open().unwrap();
        // No service traffic during a DFU-mode open.
        assert!(mock.transfers().is_empty());
        let err = device
            .send_request(40, None, &fast_options())
            .unwrap_err();
        match err {
            Error::State(msg) => assert_eq!(msg, "Device is in DFU mode"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
