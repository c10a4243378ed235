use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use usbmidi_host_core::{
    EndpointRecord, EndpointRole, MidiErrorKind, MidiSession, SessionState, TransportError,
    TransportErrorKind, TransportResult, UsbTransport,
};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    FetchDevice,
    FetchConfig { index: u8, len: usize },
    Allocate,
    Free(u8),
    SetAddress(u8),
    Bind(Vec<EndpointRecord>),
    SetConfiguration(u8),
    In { endpoint: u8, len: usize },
    Out { endpoint: u8, data: Vec<u8> },
}

struct MockTransport {
    log: Rc<RefCell<Vec<Call>>>,
    default_ready: bool,
    device: Vec<u8>,
    configs: Vec<Vec<u8>>,
    address: Option<u8>,
    fail_device_descriptor: bool,
    fail_set_address: bool,
    fail_bind_at: Option<usize>,
    binds: usize,
    fail_set_configuration: bool,
    overreport: usize,
    fail_out_at: Option<usize>,
    outs: usize,
    frames: VecDeque<Vec<u8>>,
}

impl MockTransport {
    fn new(configs: Vec<Vec<u8>>) -> (Self, Rc<RefCell<Vec<Call>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let transport = Self {
            log: log.clone(),
            default_ready: true,
            device: device_descriptor(configs.len() as u8),
            configs,
            address: Some(5),
            fail_device_descriptor: false,
            fail_set_address: false,
            fail_bind_at: None,
            binds: 0,
            fail_set_configuration: false,
            overreport: 0,
            fail_out_at: None,
            outs: 0,
            frames: VecDeque::new(),
        };
        (transport, log)
    }

    fn record(&self, call: Call) {
        self.log.borrow_mut().push(call);
    }
}

impl UsbTransport for MockTransport {
    fn default_device_ready(&mut self, _low_speed: bool) -> bool {
        self.default_ready
    }

    fn fetch_device_descriptor(&mut self, address: u8, buf: &mut [u8]) -> TransportResult<usize> {
        assert_eq!(address, 0);
        self.record(Call::FetchDevice);
        if self.fail_device_descriptor {
            return Err(TransportError::new(TransportErrorKind::Disconnected));
        }
        let len = buf.len().min(self.device.len());
        buf[..len].copy_from_slice(&self.device[..len]);
        Ok(len + self.overreport)
    }

    fn fetch_config_descriptor(
        &mut self,
        _address: u8,
        config_index: u8,
        buf: &mut [u8],
    ) -> TransportResult<usize> {
        self.record(Call::FetchConfig {
            index: config_index,
            len: buf.len(),
        });
        let config = self
            .configs
            .get(config_index as usize)
            .ok_or_else(|| TransportError::new(TransportErrorKind::Stall))?;
        let len = buf.len().min(config.len());
        buf[..len].copy_from_slice(&config[..len]);
        Ok(len + self.overreport)
    }

    fn allocate_address(&mut self, _parent: u8, _low_speed: bool, _port: u8) -> TransportResult<u8> {
        self.record(Call::Allocate);
        self.address
            .ok_or_else(|| TransportError::with_message(TransportErrorKind::Other, "pool empty"))
    }

    fn free_address(&mut self, address: u8) {
        self.record(Call::Free(address));
    }

    fn set_address(&mut self, address: u8) -> TransportResult<()> {
        self.record(Call::SetAddress(address));
        if self.fail_set_address {
            return Err(TransportError::new(TransportErrorKind::Stall));
        }
        Ok(())
    }

    fn bind_endpoints(&mut self, _address: u8, records: &[EndpointRecord]) -> TransportResult<()> {
        self.record(Call::Bind(records.to_vec()));
        self.binds += 1;
        if self.fail_bind_at == Some(self.binds) {
            return Err(TransportError::new(TransportErrorKind::Protocol));
        }
        Ok(())
    }

    fn set_configuration(&mut self, _address: u8, configuration: u8) -> TransportResult<()> {
        self.record(Call::SetConfiguration(configuration));
        if self.fail_set_configuration {
            return Err(TransportError::new(TransportErrorKind::Stall));
        }
        Ok(())
    }

    fn transfer_in(&mut self, _address: u8, endpoint: u8, buf: &mut [u8]) -> TransportResult<usize> {
        self.record(Call::In {
            endpoint,
            len: buf.len(),
        });
        let frame = self
            .frames
            .pop_front()
            .ok_or_else(|| TransportError::new(TransportErrorKind::Timeout))?;
        let len = buf.len().min(frame.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }

    fn transfer_out(&mut self, _address: u8, endpoint: u8, data: &[u8]) -> TransportResult<()> {
        self.record(Call::Out {
            endpoint,
            data: data.to_vec(),
        });
        self.outs += 1;
        if self.fail_out_at == Some(self.outs) {
            return Err(TransportError::new(TransportErrorKind::Timeout));
        }
        Ok(())
    }
}

fn device_descriptor(num_configurations: u8) -> Vec<u8> {
    vec![
        0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x40, 0x9A, 0x0A, 0x34, 0x12, 0x00, 0x01, 0x01,
        0x02, 0x00, num_configurations,
    ]
}

fn with_total_length(mut buf: Vec<u8>) -> Vec<u8> {
    let len = buf.len() as u16;
    buf[2..4].copy_from_slice(&len.to_le_bytes());
    buf
}

fn midi_config(value: u8) -> Vec<u8> {
    with_total_length(
        [
            &[0x09, 0x02, 0x00, 0x00, 0x02, value, 0x00, 0x80, 0x32][..],
            &[0x09, 0x04, 0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x00],
            &[0x09, 0x04, 0x01, 0x00, 0x02, 0x01, 0x03, 0x00, 0x00],
            &[0x07, 0x24, 0x01, 0x00, 0x01, 0x41, 0x00],
            &[0x09, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00, 0x00, 0x00],
            &[0x05, 0x25, 0x01, 0x01, 0x01],
            &[0x09, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00, 0x00, 0x00],
            &[0x05, 0x25, 0x01, 0x01, 0x03],
        ]
        .concat(),
    )
}

fn vendor_config(value: u8) -> Vec<u8> {
    with_total_length(
        [
            &[0x09, 0x02, 0x00, 0x00, 0x01, value, 0x00, 0x80, 0x32][..],
            &[0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00],
            &[0x07, 0x05, 0x83, 0x02, 0x20, 0x00, 0x00],
            &[0x07, 0x05, 0x04, 0x02, 0x20, 0x00, 0x00],
        ]
        .concat(),
    )
}

fn empty_config(value: u8) -> Vec<u8> {
    with_total_length(
        [
            &[0x09, 0x02, 0x00, 0x00, 0x01, value, 0x00, 0x80, 0x32][..],
            &[0x09, 0x04, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00],
        ]
        .concat(),
    )
}

fn ready_session(configs: Vec<Vec<u8>>) -> (MidiSession<MockTransport>, Rc<RefCell<Vec<Call>>>) {
    let (transport, log) = MockTransport::new(configs);
    let mut session = MidiSession::new(transport);
    session.init(0, 1, false).unwrap();
    log.borrow_mut().clear();
    (session, log)
}

#[test]
fn init_binds_midi_streaming_endpoints() {
    let (transport, log) = MockTransport::new(vec![midi_config(1)]);
    let mut session = MidiSession::new(transport);
    session.init(0, 1, false).unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.is_ready());
    assert_eq!(session.address(), 5);
    assert_eq!(session.vendor_id(), Some(0x0A9A));
    assert_eq!(session.product_id(), Some(0x1234));
    assert!(session.discovery().midi_found);
    assert_eq!(session.discovery().endpoint_count, 3);

    let control = EndpointRecord::new(0, 64);
    assert_eq!(
        *log.borrow(),
        vec![
            Call::FetchDevice,
            Call::Allocate,
            Call::SetAddress(5),
            Call::Bind(vec![control]),
            Call::FetchConfig { index: 0, len: 4 },
            Call::FetchConfig {
                index: 0,
                len: midi_config(1).len()
            },
            Call::Bind(vec![
                control,
                EndpointRecord::new(1, 64),
                EndpointRecord::new(2, 64),
            ]),
            Call::SetConfiguration(1),
        ]
    );
}

#[test]
fn vendor_bulk_endpoints_are_promoted() {
    let (session, _log) = ready_session(vec![vendor_config(2)]);

    assert!(!session.discovery().midi_found);
    let table = session.endpoints();
    assert_eq!(table.get(EndpointRole::MidiIn), EndpointRecord::new(3, 32));
    assert_eq!(table.get(EndpointRole::MidiOut), EndpointRecord::new(4, 32));
    assert_eq!(table.get(EndpointRole::FallbackIn), EndpointRecord::new(3, 32));
}

#[test]
fn scan_stops_after_first_configuration_with_endpoints() {
    let (transport, log) =
        MockTransport::new(vec![empty_config(1), midi_config(2), vendor_config(3)]);
    let mut session = MidiSession::new(transport);
    session.init(0, 1, false).unwrap();

    assert_eq!(session.discovery().configuration, 2);
    let fetched: Vec<u8> = log
        .borrow()
        .iter()
        .filter_map(|call| match call {
            Call::FetchConfig { index, len: 4 } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(fetched, vec![0, 1]);
    assert!(log.borrow().contains(&Call::SetConfiguration(2)));
}

#[test]
fn malformed_configuration_is_skipped() {
    let mut broken = midi_config(1);
    broken[9] = 0;
    let (session, _log) = ready_session(vec![broken, vendor_config(2)]);

    assert_eq!(session.discovery().configuration, 2);
    assert!(!session.discovery().midi_found);
    assert_eq!(
        session.endpoints().get(EndpointRole::MidiOut),
        EndpointRecord::new(4, 32)
    );
}

#[test]
fn oversized_configuration_is_clamped_to_capacity() {
    let mut config = midi_config(1);
    config[2..4].copy_from_slice(&0x0800u16.to_le_bytes());
    let (transport, log) = MockTransport::new(vec![config]);
    let mut session = MidiSession::new(transport);
    session.init(0, 1, false).unwrap();

    assert!(log
        .borrow()
        .contains(&Call::FetchConfig { index: 0, len: 256 }));
}

#[test]
fn missing_configuration_fails_and_frees_address() {
    let (transport, log) = MockTransport::new(Vec::new());
    let mut session = MidiSession::new(transport);
    let err = session.init(0, 1, false).unwrap_err();

    assert_eq!(err.kind(), MidiErrorKind::DeviceNotFound);
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.address(), 0);
    assert!(log.borrow().contains(&Call::Free(5)));
}

#[test]
fn set_configuration_failure_releases_address() {
    let (mut transport, log) = MockTransport::new(vec![midi_config(1)]);
    transport.fail_set_configuration = true;
    let mut session = MidiSession::new(transport);
    let err = session.init(0, 1, false).unwrap_err();

    assert_eq!(
        err.kind(),
        MidiErrorKind::Transport(TransportErrorKind::Stall)
    );
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.discovery().endpoint_count, 1);
    assert_eq!(session.discovery().configuration, 0);
    assert!(!session.discovery().midi_found);
    assert!(!session.endpoints().get(EndpointRole::MidiIn).is_discovered());
    assert!(!session.endpoints().get(EndpointRole::MidiOut).is_discovered());
    assert_eq!(session.device(), None);
    assert_eq!(session.vendor_id(), None);
    assert_eq!(log.borrow().last(), Some(&Call::Free(5)));
    assert_eq!(
        session.send_short(&[0x90, 0x40, 0x7F], 0).unwrap_err().kind(),
        MidiErrorKind::NotReady
    );
}

#[test]
fn device_descriptor_failure_aborts_before_allocation() {
    let (mut transport, log) = MockTransport::new(vec![midi_config(1)]);
    transport.fail_device_descriptor = true;
    let mut session = MidiSession::new(transport);
    let err = session.init(0, 1, false).unwrap_err();

    assert_eq!(
        err.kind(),
        MidiErrorKind::Transport(TransportErrorKind::Disconnected)
    );
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.address(), 0);
    assert_eq!(*log.borrow(), vec![Call::FetchDevice]);
}

#[test]
fn set_address_failure_frees_address() {
    let (mut transport, log) = MockTransport::new(vec![midi_config(1)]);
    transport.fail_set_address = true;
    let mut session = MidiSession::new(transport);
    let err = session.init(0, 1, false).unwrap_err();

    assert_eq!(
        err.kind(),
        MidiErrorKind::Transport(TransportErrorKind::Stall)
    );
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.address(), 0);
    assert_eq!(session.device(), None);
    assert_eq!(
        *log.borrow(),
        vec![
            Call::FetchDevice,
            Call::Allocate,
            Call::SetAddress(5),
            Call::Free(5),
        ]
    );
}

#[test]
fn control_bind_failure_frees_address() {
    let (mut transport, log) = MockTransport::new(vec![midi_config(1)]);
    transport.fail_bind_at = Some(1);
    let mut session = MidiSession::new(transport);
    let err = session.init(0, 1, false).unwrap_err();

    assert_eq!(
        err.kind(),
        MidiErrorKind::Transport(TransportErrorKind::Protocol)
    );
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(log.borrow().last(), Some(&Call::Free(5)));
    assert!(!log
        .borrow()
        .iter()
        .any(|call| matches!(call, Call::FetchConfig { .. })));
}

#[test]
fn endpoint_bind_failure_frees_address_and_clears_discovery() {
    let (mut transport, log) = MockTransport::new(vec![midi_config(1)]);
    transport.fail_bind_at = Some(2);
    let mut session = MidiSession::new(transport);
    let err = session.init(0, 1, false).unwrap_err();

    assert_eq!(
        err.kind(),
        MidiErrorKind::Transport(TransportErrorKind::Protocol)
    );
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.address(), 0);
    assert!(!session.discovery().midi_found);
    assert!(!session.endpoints().get(EndpointRole::MidiIn).is_discovered());
    assert_eq!(log.borrow().last(), Some(&Call::Free(5)));
    assert!(!log
        .borrow()
        .iter()
        .any(|call| matches!(call, Call::SetConfiguration(_))));

    session.transport_mut().fail_bind_at = None;
    session.init(0, 1, false).unwrap();
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn overreported_descriptor_lengths_are_clamped() {
    let (mut transport, _log) = MockTransport::new(vec![midi_config(1)]);
    transport.overreport = 32;
    let mut session = MidiSession::new(transport);
    session.init(0, 1, false).unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.vendor_id(), Some(0x0A9A));
    assert_eq!(
        session.endpoints().get(EndpointRole::MidiIn),
        EndpointRecord::new(1, 64)
    );
}

#[test]
fn exhausted_pool_does_not_free() {
    let (mut transport, log) = MockTransport::new(vec![midi_config(1)]);
    transport.address = None;
    let mut session = MidiSession::new(transport);
    let err = session.init(0, 1, false).unwrap_err();

    assert_eq!(err.kind(), MidiErrorKind::AddressPoolExhausted);
    assert!(!log.borrow().iter().any(|call| matches!(call, Call::Free(_))));
}

#[test]
fn missing_default_device_is_reported() {
    let (mut transport, log) = MockTransport::new(vec![midi_config(1)]);
    transport.default_ready = false;
    let mut session = MidiSession::new(transport);

    assert_eq!(
        session.init(0, 1, false).unwrap_err().kind(),
        MidiErrorKind::EndpointInfoMissing
    );
    assert!(log.borrow().is_empty());
}

#[test]
fn second_init_is_rejected_until_release() {
    let (mut session, log) = ready_session(vec![midi_config(1)]);

    assert_eq!(
        session.init(0, 1, false).unwrap_err().kind(),
        MidiErrorKind::AddressAlreadyBound
    );
    assert_eq!(session.state(), SessionState::Ready);

    session.release().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.is_ready());
    assert_eq!(*log.borrow(), vec![Call::Free(5)]);

    session.init(0, 1, false).unwrap();
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn drop_frees_held_address() {
    let (session, log) = ready_session(vec![midi_config(1)]);
    drop(session);
    assert_eq!(*log.borrow(), vec![Call::Free(5)]);
}

#[test]
fn send_short_writes_one_packet_to_midi_out() {
    let (mut session, log) = ready_session(vec![midi_config(1)]);
    session.send_short(&[0x91, 0x3C, 0x64], 2).unwrap();
    session.send_short(&[0xF8], 0).unwrap();

    assert_eq!(
        *log.borrow(),
        vec![
            Call::Out {
                endpoint: 2,
                data: vec![0x29, 0x91, 0x3C, 0x64]
            },
            Call::Out {
                endpoint: 2,
                data: vec![0x0F, 0xF8, 0x00, 0x00]
            },
        ]
    );
}

#[test]
fn send_short_with_sysex_start_uses_sysex_path() {
    let (mut session, log) = ready_session(vec![midi_config(1)]);
    session
        .send_short(&[0xF0, 0x01, 0x02, 0x03, 0xF7], 0)
        .unwrap();
    assert_eq!(log.borrow().len(), 2);
}

#[test]
fn send_sysex_streams_packets() {
    let (mut session, log) = ready_session(vec![midi_config(1)]);
    session
        .send_sysex(&[0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7], 1)
        .unwrap();

    assert_eq!(
        *log.borrow(),
        vec![
            Call::Out {
                endpoint: 2,
                data: vec![0x14, 0xF0, 0x7E, 0x7F]
            },
            Call::Out {
                endpoint: 2,
                data: vec![0x17, 0x06, 0x01, 0xF7]
            },
        ]
    );
}

#[test]
fn send_sysex_stops_at_first_transport_error() {
    let (mut session, log) = ready_session(vec![midi_config(1)]);
    session.transport_mut().fail_out_at = Some(2);
    let stream = [0xF0, 1, 2, 3, 4, 5, 6, 7, 8, 0xF7];
    let err = session.send_sysex(&stream, 0).unwrap_err();

    assert_eq!(
        err.kind(),
        MidiErrorKind::Transport(TransportErrorKind::Timeout)
    );
    assert_eq!(log.borrow().len(), 2);
    assert!(session.is_ready());
}

#[test]
fn receive_raw_filters_empty_frames() {
    let (mut session, log) = ready_session(vec![midi_config(1)]);
    {
        let frames = &mut session.transport_mut().frames;
        frames.push_back(vec![0; 64]);
        frames.push_back(vec![0x09, 0x90, 0x40, 0x7F]);
        frames.push_back(Vec::new());
    }

    assert_eq!(session.receive_raw().unwrap(), None);
    assert_eq!(session.receive_raw().unwrap(), Some([0x90, 0x40, 0x7F]));
    assert_eq!(session.receive_raw().unwrap(), None);
    assert_eq!(
        session.receive_raw().unwrap_err().kind(),
        MidiErrorKind::Transport(TransportErrorKind::Timeout)
    );
    assert!(log
        .borrow()
        .iter()
        .all(|call| *call == Call::In { endpoint: 1, len: 64 }));
}

#[test]
fn receive_into_returns_whole_transfer() {
    let (mut session, _log) = ready_session(vec![midi_config(1)]);
    session
        .transport_mut()
        .frames
        .push_back(vec![0x09, 0x90, 0x40, 0x7F, 0x08, 0x80, 0x40, 0x00]);

    let mut buf = [0u8; 64];
    let read = session.receive_into(&mut buf).unwrap();
    assert_eq!(&buf[..read], &[0x09, 0x90, 0x40, 0x7F, 0x08, 0x80, 0x40, 0x00]);
}

#[test]
fn io_before_init_is_not_ready() {
    let (transport, _log) = MockTransport::new(vec![midi_config(1)]);
    let mut session = MidiSession::new(transport);
    assert_eq!(
        session.receive_raw().unwrap_err().kind(),
        MidiErrorKind::NotReady
    );
    assert_eq!(
        session.send_sysex(&[0xF0, 0xF7], 0).unwrap_err().kind(),
        MidiErrorKind::NotReady
    );
}
