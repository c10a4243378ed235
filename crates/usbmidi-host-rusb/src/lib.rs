use rusb::{
    Context, Device, DeviceHandle, Direction, Recipient, RequestType, TransferType, UsbContext,
};
use std::time::Duration;
use tracing::{debug, trace, warn};
use usbmidi_host_core::{
    EndpointRecord, TransportError, TransportErrorKind, TransportResult, UsbTransport,
    descriptor::{
        DESCRIPTOR_TYPE_CONFIGURATION, DESCRIPTOR_TYPE_DEVICE, USB_CLASS_AUDIO,
        USB_SUBCLASS_MIDI_STREAMING,
    },
};

const GET_DESCRIPTOR: u8 = 0x06;
const ENDPOINT_IN: u8 = 0x80;
const ENDPOINT_NUMBER_MASK: u8 = 0x0F;

/// Configuration for [`RusbTransport`].
#[derive(Clone, Copy, Debug)]
pub struct RusbTransportConfig {
    /// Timeout applied to every control and bulk transfer.
    pub timeout: Duration,
    /// Detach a bound kernel driver (e.g. `snd-usb-audio`) while interfaces are claimed.
    pub detach_kernel_driver: bool,
}

impl Default for RusbTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            detach_kernel_driver: true,
        }
    }
}

/// [`UsbTransport`] backed by libusb.
///
/// libusb enumerates and addresses devices itself, so the address pool operations report the
/// address the OS already assigned and `set_address` is a no-op. Claiming interfaces happens in
/// `set_configuration`, for every interface that owns one of the bound endpoints.
pub struct RusbTransport {
    device: Device<Context>,
    handle: Option<DeviceHandle<Context>>,
    config: RusbTransportConfig,
    bound: Vec<EndpointRecord>,
    claimed: Vec<u8>,
}

impl RusbTransport {
    pub fn new(device: Device<Context>, config: RusbTransportConfig) -> Self {
        Self {
            device,
            handle: None,
            config,
            bound: Vec::new(),
            claimed: Vec::new(),
        }
    }

    /// Open the first device matching the filters. Without filters, the first device exposing a
    /// MIDI streaming interface is used.
    pub fn open_matching(
        vendor_id: Option<u16>,
        product_id: Option<u16>,
        config: RusbTransportConfig,
    ) -> TransportResult<Self> {
        let context = Context::new().map_err(|err| map_rusb_error("create libusb context", err))?;
        let devices = context
            .devices()
            .map_err(|err| map_rusb_error("list devices", err))?;
        for device in devices.iter() {
            let info = match describe_device(&device) {
                Ok(info) => info,
                Err(err) => {
                    debug!(%err, "skipping unreadable device");
                    continue;
                }
            };
            let filtered = vendor_id.is_some() || product_id.is_some();
            if vendor_id.is_some_and(|v| v != info.vendor_id)
                || product_id.is_some_and(|p| p != info.product_id)
                || (!filtered && !info.midi_streaming)
            {
                continue;
            }
            debug!(
                bus = info.bus,
                address = info.address,
                vendor_id = info.vendor_id,
                product_id = info.product_id,
                "selected usb device"
            );
            return Ok(Self::new(device, config));
        }
        Err(TransportError::with_message(
            TransportErrorKind::NotReady,
            "no matching usb device",
        ))
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn device_address(&self) -> u8 {
        self.device.address()
    }

    /// Endpoint records most recently registered through `bind_endpoints`.
    pub fn bound_endpoints(&self) -> &[EndpointRecord] {
        &self.bound
    }

    fn handle(&self) -> TransportResult<&DeviceHandle<Context>> {
        self.handle.as_ref().ok_or_else(not_ready)
    }

    fn handle_mut(&mut self) -> TransportResult<&mut DeviceHandle<Context>> {
        self.handle.as_mut().ok_or_else(not_ready)
    }

    fn read_descriptor(
        &self,
        op: &'static str,
        value: u16,
        buf: &mut [u8],
    ) -> TransportResult<usize> {
        let request_type = rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device);
        let read = self
            .handle()?
            .read_control(request_type, GET_DESCRIPTOR, value, 0, buf, self.config.timeout)
            .map_err(|err| map_rusb_error(op, err))?;
        trace!(op, read, "descriptor read");
        Ok(read)
    }

    fn claim_bound_interfaces(&mut self) -> TransportResult<()> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(|err| map_rusb_error("read active configuration", err))?;
        let mut wanted = Vec::new();
        for interface in config.interfaces() {
            for desc in interface.descriptors() {
                let owns_bound = desc.endpoint_descriptors().any(|ep| {
                    ep.transfer_type() == TransferType::Bulk
                        && self
                            .bound
                            .iter()
                            .skip(1)
                            .any(|rec| rec.is_discovered() && rec.address == ep.number())
                });
                if owns_bound && !wanted.contains(&desc.interface_number()) {
                    wanted.push(desc.interface_number());
                }
            }
        }

        let handle = self.handle.as_mut().ok_or_else(not_ready)?;
        for interface in wanted {
            if self.claimed.contains(&interface) {
                continue;
            }
            handle
                .claim_interface(interface)
                .map_err(|err| map_rusb_error("claim usb interface", err))?;
            debug!(interface, "claimed interface");
            self.claimed.push(interface);
        }
        Ok(())
    }
}

impl UsbTransport for RusbTransport {
    fn default_device_ready(&mut self, low_speed: bool) -> bool {
        if self.handle.is_some() {
            return true;
        }
        match self.device.open() {
            Ok(mut handle) => {
                if self.config.detach_kernel_driver {
                    if let Err(err) = handle.set_auto_detach_kernel_driver(true) {
                        debug!(%err, "rusb: failed to enable kernel driver auto-detach; continuing");
                    }
                }
                trace!(low_speed, speed = ?self.device.speed(), "device opened");
                self.handle = Some(handle);
                true
            }
            Err(err) => {
                warn!(%err, "open usb device");
                false
            }
        }
    }

    fn fetch_device_descriptor(&mut self, _address: u8, buf: &mut [u8]) -> TransportResult<usize> {
        self.read_descriptor(
            "device descriptor",
            u16::from(DESCRIPTOR_TYPE_DEVICE) << 8,
            buf,
        )
    }

    fn fetch_config_descriptor(
        &mut self,
        _address: u8,
        config_index: u8,
        buf: &mut [u8],
    ) -> TransportResult<usize> {
        self.read_descriptor(
            "configuration descriptor",
            u16::from(DESCRIPTOR_TYPE_CONFIGURATION) << 8 | u16::from(config_index),
            buf,
        )
    }

    fn allocate_address(&mut self, _parent: u8, _low_speed: bool, _port: u8) -> TransportResult<u8> {
        match self.device.address() {
            0 => Err(TransportError::with_message(
                TransportErrorKind::NotReady,
                "device has no address yet",
            )),
            address => Ok(address),
        }
    }

    fn free_address(&mut self, address: u8) {
        if let Some(mut handle) = self.handle.take() {
            for interface in self.claimed.drain(..) {
                if let Err(err) = handle.release_interface(interface) {
                    debug!(interface, %err, "release usb interface");
                }
            }
        }
        self.bound.clear();
        debug!(address, "device closed");
    }

    fn set_address(&mut self, address: u8) -> TransportResult<()> {
        trace!(address, "address is managed by the host stack");
        Ok(())
    }

    fn bind_endpoints(&mut self, address: u8, records: &[EndpointRecord]) -> TransportResult<()> {
        trace!(address, count = records.len(), "bind endpoints");
        self.bound = records.to_vec();
        Ok(())
    }

    fn set_configuration(&mut self, _address: u8, configuration: u8) -> TransportResult<()> {
        let handle = self.handle_mut()?;
        let active = handle
            .active_configuration()
            .map_err(|err| map_rusb_error("read active configuration", err))?;
        if active != configuration {
            handle
                .set_active_configuration(configuration)
                .map_err(|err| map_rusb_error("set configuration", err))?;
            debug!(configuration, previous = active, "configuration changed");
        }
        self.claim_bound_interfaces()
    }

    fn transfer_in(&mut self, _address: u8, endpoint: u8, buf: &mut [u8]) -> TransportResult<usize> {
        let endpoint = (endpoint & ENDPOINT_NUMBER_MASK) | ENDPOINT_IN;
        self.handle()?
            .read_bulk(endpoint, buf, self.config.timeout)
            .map_err(|err| map_rusb_error("bulk-in read", err))
    }

    fn transfer_out(&mut self, _address: u8, endpoint: u8, data: &[u8]) -> TransportResult<()> {
        let endpoint = endpoint & ENDPOINT_NUMBER_MASK;
        let written = self
            .handle()?
            .write_bulk(endpoint, data, self.config.timeout)
            .map_err(|err| map_rusb_error("bulk-out write", err))?;
        if written != data.len() {
            return Err(TransportError::with_message(
                TransportErrorKind::Protocol,
                format!(
                    "bulk write truncated (expected {}, wrote {written})",
                    data.len()
                ),
            ));
        }
        Ok(())
    }
}

/// Summary of an attached device, for listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Some configuration has an Audio/MIDI-Streaming interface.
    pub midi_streaming: bool,
    /// Bulk endpoints across all configurations.
    pub bulk_endpoints: usize,
}

/// Describe every attached device without opening it.
pub fn list_devices() -> TransportResult<Vec<DeviceInfo>> {
    let context = Context::new().map_err(|err| map_rusb_error("create libusb context", err))?;
    let devices = context
        .devices()
        .map_err(|err| map_rusb_error("list devices", err))?;
    let mut out = Vec::new();
    for device in devices.iter() {
        match describe_device(&device) {
            Ok(info) => out.push(info),
            Err(err) => debug!(%err, "skipping unreadable device"),
        }
    }
    Ok(out)
}

fn describe_device(device: &Device<Context>) -> TransportResult<DeviceInfo> {
    let desc = device
        .device_descriptor()
        .map_err(|err| map_rusb_error("read device descriptor", err))?;
    let mut info = DeviceInfo {
        bus: device.bus_number(),
        address: device.address(),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        midi_streaming: false,
        bulk_endpoints: 0,
    };
    for index in 0..desc.num_configurations() {
        let config = device
            .config_descriptor(index)
            .map_err(|err| map_rusb_error("read configuration descriptor", err))?;
        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                if alt.class_code() == USB_CLASS_AUDIO
                    && alt.sub_class_code() == USB_SUBCLASS_MIDI_STREAMING
                {
                    info.midi_streaming = true;
                }
                info.bulk_endpoints += alt
                    .endpoint_descriptors()
                    .filter(|ep| ep.transfer_type() == TransferType::Bulk)
                    .count();
            }
        }
    }
    Ok(info)
}

fn map_rusb_error(op: &str, err: rusb::Error) -> TransportError {
    let kind = match err {
        rusb::Error::Timeout => TransportErrorKind::Timeout,
        rusb::Error::Pipe => TransportErrorKind::Stall,
        rusb::Error::NoDevice => TransportErrorKind::Disconnected,
        rusb::Error::Overflow => TransportErrorKind::Protocol,
        rusb::Error::NotSupported => TransportErrorKind::Unsupported,
        _ => TransportErrorKind::Other,
    };
    TransportError::with_message(kind, format!("{op}: {err}"))
}

fn not_ready() -> TransportError {
    TransportError::with_message(TransportErrorKind::NotReady, "device not opened")
}
