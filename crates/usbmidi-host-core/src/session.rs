use alloc::{format, string::ToString, vec};
use tracing::{debug, trace, warn};

use crate::{
    descriptor::{
        CONFIG_HEADER_LEN, DEVICE_DESCRIPTOR_LEN, DeviceDescriptor, DiscoveryState, ScanReport,
        config_total_length, scan_configuration,
    },
    endpoint::{EndpointRole, EndpointTable},
    error::{MidiError, MidiErrorKind, MidiResult},
    packet::{SYSEX_START, USB_MIDI_PACKET_LEN, decode, encode_short, encode_sysex},
    transport::UsbTransport,
};

/// Where a [`MidiSession`] is in its connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AddressProbe,
    AddressAssign,
    ConfigScan,
    FallbackCheck,
    Bind,
    Ready,
    Failed,
}

/// Tunables for [`MidiSession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest configuration descriptor fetched; longer ones are truncated to this size.
    pub descriptor_capacity: usize,
    /// Receive size used when the IN endpoint reports a max packet size of zero.
    pub receive_buffer_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            descriptor_capacity: 256,
            receive_buffer_len: 64,
        }
    }
}

/// USB-MIDI class driver instance bound to one device.
///
/// Owns the device address from a successful [`MidiSession::init`] until
/// [`MidiSession::release`]; dropping the session releases it as well.
pub struct MidiSession<T: UsbTransport> {
    transport: T,
    config: SessionConfig,
    state: SessionState,
    address: u8,
    table: EndpointTable,
    discovery: DiscoveryState,
    device: Option<DeviceDescriptor>,
    poll_enabled: bool,
}

impl<T: UsbTransport> MidiSession<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Idle,
            address: 0,
            table: EndpointTable::new(),
            discovery: DiscoveryState::new(),
            device: None,
            poll_enabled: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.poll_enabled
    }

    /// Assigned USB address, 0 when none is held.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.table
    }

    pub fn discovery(&self) -> DiscoveryState {
        self.discovery
    }

    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.device
    }

    pub fn vendor_id(&self) -> Option<u16> {
        self.device.map(|d| d.vendor_id)
    }

    pub fn product_id(&self) -> Option<u16> {
        self.device.map(|d| d.product_id)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Run a connection attempt against the device currently at address 0.
    ///
    /// Any failure after the address was allocated releases it before returning.
    pub fn init(&mut self, parent: u8, port: u8, low_speed: bool) -> MidiResult<()> {
        if self.address != 0 {
            return Err(MidiError::with_message(
                MidiErrorKind::AddressAlreadyBound,
                format!("session already holds address {}", self.address),
            ));
        }
        self.discovery.reset();
        self.table.reset();
        self.device = None;

        match self.connect(parent, port, low_speed) {
            Ok(()) => {
                self.poll_enabled = true;
                self.state = SessionState::Ready;
                debug!(
                    address = self.address,
                    configuration = self.discovery.configuration,
                    midi = self.discovery.midi_found,
                    endpoints = self.discovery.endpoint_count,
                    "usb-midi session ready"
                );
                Ok(())
            }
            Err(err) => {
                warn!(state = ?self.state, %err, "usb-midi init failed");
                self.release()?;
                self.table.reset();
                self.discovery.reset();
                self.device = None;
                self.state = SessionState::Failed;
                Err(err)
            }
        }
    }

    fn connect(&mut self, parent: u8, port: u8, low_speed: bool) -> MidiResult<()> {
        self.state = SessionState::AddressProbe;
        if !self.transport.default_device_ready(low_speed) {
            return Err(MidiError::with_message(
                MidiErrorKind::EndpointInfoMissing,
                "no endpoint info for address 0",
            ));
        }
        let mut buf = [0u8; DEVICE_DESCRIPTOR_LEN];
        let len = self
            .transport
            .fetch_device_descriptor(0, &mut buf)?
            .min(buf.len());
        let device = DeviceDescriptor::parse(&buf[..len])?;
        debug!(
            vendor_id = device.vendor_id,
            product_id = device.product_id,
            configurations = device.num_configurations,
            "device descriptor"
        );
        self.device = Some(device);

        self.state = SessionState::AddressAssign;
        let address = self
            .transport
            .allocate_address(parent, low_speed, port)
            .map_err(|err| {
                MidiError::with_message(MidiErrorKind::AddressPoolExhausted, err.to_string())
            })?;
        if address == 0 {
            return Err(MidiError::new(MidiErrorKind::AddressPoolExhausted));
        }
        self.address = address;
        self.table
            .set_control_packet_size(u16::from(device.max_packet_size0));
        self.transport.set_address(address)?;
        let (records, len) = self.table.records(1);
        self.transport.bind_endpoints(address, &records[..len])?;
        debug!(address, "address assigned");

        self.state = SessionState::ConfigScan;
        self.scan_configurations(device.num_configurations)?;
        if self.discovery.configuration == 0 {
            return Err(MidiError::with_message(
                MidiErrorKind::DeviceNotFound,
                "no usable configuration descriptor",
            ));
        }

        self.state = SessionState::FallbackCheck;
        if !self.discovery.midi_found {
            debug!("no MIDI streaming interface, using vendor bulk endpoints");
            self.table.promote_fallback();
        }

        self.state = SessionState::Bind;
        let (records, len) = self.table.records(usize::from(self.discovery.endpoint_count));
        self.transport.bind_endpoints(address, &records[..len])?;
        self.transport
            .set_configuration(address, self.discovery.configuration)?;
        Ok(())
    }

    fn scan_configurations(&mut self, count: u8) -> MidiResult<()> {
        let mut buf = vec![0u8; self.config.descriptor_capacity.max(CONFIG_HEADER_LEN)];
        for index in 0..count {
            match self.scan_one(index, &mut buf) {
                Ok(report) => trace!(
                    index,
                    len = report.scanned_len,
                    bulk = report.bulk_endpoints,
                    "configuration scanned"
                ),
                Err(err) if err.kind() == MidiErrorKind::MalformedDescriptor => {
                    warn!(index, %err, "skipping malformed configuration");
                }
                Err(err) => return Err(err),
            }
            if self.discovery.has_data_endpoints() {
                break;
            }
        }
        Ok(())
    }

    fn scan_one(&mut self, index: u8, buf: &mut [u8]) -> MidiResult<ScanReport> {
        let header = &mut buf[..CONFIG_HEADER_LEN];
        let len = self
            .transport
            .fetch_config_descriptor(self.address, index, header)?
            .min(CONFIG_HEADER_LEN);
        let declared = config_total_length(&header[..len])?;
        let total = declared.min(buf.len());
        if total < declared {
            warn!(index, declared, capacity = buf.len(), "configuration descriptor truncated");
        }
        let len = self
            .transport
            .fetch_config_descriptor(self.address, index, &mut buf[..total])?
            .min(total);
        scan_configuration(&buf[..len], &mut self.table, &mut self.discovery)
    }

    /// Free the address and return to Idle. Safe to call in any state.
    pub fn release(&mut self) -> MidiResult<()> {
        if self.address != 0 {
            debug!(address = self.address, "releasing usb address");
            self.transport.free_address(self.address);
        }
        self.address = 0;
        self.discovery.endpoint_count = 1;
        self.poll_enabled = false;
        self.state = SessionState::Idle;
        Ok(())
    }

    fn ensure_ready(&self) -> MidiResult<()> {
        if !self.poll_enabled {
            return Err(MidiError::with_message(
                MidiErrorKind::NotReady,
                "session is not connected",
            ));
        }
        Ok(())
    }

    /// Send one short message. A message starting with 0xF0 goes out as SysEx.
    pub fn send_short(&mut self, message: &[u8], cable: u8) -> MidiResult<()> {
        self.ensure_ready()?;
        if message.first() == Some(&SYSEX_START) {
            return self.send_sysex(message, cable);
        }
        let packet = encode_short(message, cable)?;
        let endpoint = self.table.get(EndpointRole::MidiOut).address;
        trace!(endpoint, packet = ?packet.as_bytes(), "bulk-out");
        self.transport
            .transfer_out(self.address, endpoint, packet.as_bytes())?;
        Ok(())
    }

    /// Send a SysEx stream packet by packet, stopping at the first transport error.
    pub fn send_sysex(&mut self, stream: &[u8], cable: u8) -> MidiResult<()> {
        self.ensure_ready()?;
        let packets = encode_sysex(stream, cable)?;
        let endpoint = self.table.get(EndpointRole::MidiOut).address;
        for (sent, packet) in packets.enumerate() {
            if let Err(err) = self
                .transport
                .transfer_out(self.address, endpoint, packet.as_bytes())
            {
                warn!(sent, %err, "sysex transfer aborted");
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Poll the IN endpoint once and return the payload of the first frame, if any.
    pub fn receive_raw(&mut self) -> MidiResult<Option<[u8; 3]>> {
        self.ensure_ready()?;
        let mut buf = vec![0u8; self.receive_len()];
        let read = self.receive_into(&mut buf)?;
        Ok(decode(&buf[..read]))
    }

    /// Poll the IN endpoint once and copy the whole transfer into `buf`.
    ///
    /// At most one max-packet worth of bytes is requested.
    pub fn receive_into(&mut self, buf: &mut [u8]) -> MidiResult<usize> {
        self.ensure_ready()?;
        let len = buf.len().min(self.receive_len());
        let endpoint = self.table.get(EndpointRole::MidiIn).address;
        let read = self
            .transport
            .transfer_in(self.address, endpoint, &mut buf[..len])?;
        trace!(endpoint, read, "bulk-in");
        Ok(read.min(len))
    }

    fn receive_len(&self) -> usize {
        let max_packet = usize::from(self.table.get(EndpointRole::MidiIn).max_packet_size);
        let len = if max_packet == 0 {
            self.config.receive_buffer_len
        } else {
            max_packet
        };
        len.max(USB_MIDI_PACKET_LEN)
    }
}

impl<T: UsbTransport> Drop for MidiSession<T> {
    fn drop(&mut self) {
        if self.address != 0 {
            self.transport.free_address(self.address);
        }
    }
}
