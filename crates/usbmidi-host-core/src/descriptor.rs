//! Standard USB descriptor decoding and the configuration scanner that maps bulk endpoints onto
//! [`EndpointRole`]s.
//!
//! The scanner walks a configuration descriptor blob with a bounds-checked cursor. Every step
//! advances by the descriptor's own `bLength`; a zero length or a header that runs past the end
//! of the blob stops the walk with [`MidiErrorKind::MalformedDescriptor`](crate::MidiErrorKind).

use alloc::format;
use byteorder::{ByteOrder, LittleEndian};
use tracing::{trace, warn};

use crate::{
    endpoint::{EndpointRole, EndpointTable},
    error::{MidiError, MidiResult},
};

pub const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;

pub const USB_CLASS_AUDIO: u8 = 0x01;
pub const USB_SUBCLASS_MIDI_STREAMING: u8 = 0x03;

/// Number of bytes in a standard device descriptor.
pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
/// Bytes needed to learn a configuration descriptor's `wTotalLength`.
pub const CONFIG_HEADER_LEN: usize = 4;

const ENDPOINT_DIR_IN: u8 = 0x80;
const ENDPOINT_NUMBER_MASK: u8 = 0x0F;
const TRANSFER_TYPE_MASK: u8 = 0x03;
const TRANSFER_TYPE_BULK: u8 = 0x02;
const MAX_PACKET_SIZE_MASK: u16 = 0x07FF;

/// Fields of the device descriptor the driver cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(buf: &[u8]) -> MidiResult<Self> {
        if buf.len() < DEVICE_DESCRIPTOR_LEN {
            return Err(MidiError::malformed(format!(
                "device descriptor truncated (expected {DEVICE_DESCRIPTOR_LEN}, got {})",
                buf.len()
            )));
        }
        if buf[1] != DESCRIPTOR_TYPE_DEVICE {
            return Err(MidiError::malformed(format!(
                "unexpected descriptor type {:#04x} for device descriptor",
                buf[1]
            )));
        }
        Ok(Self {
            max_packet_size0: buf[7],
            vendor_id: LittleEndian::read_u16(&buf[8..10]),
            product_id: LittleEndian::read_u16(&buf[10..12]),
            num_configurations: buf[17],
        })
    }
}

/// Read `wTotalLength` from the first bytes of a configuration descriptor.
pub fn config_total_length(header: &[u8]) -> MidiResult<usize> {
    if header.len() < CONFIG_HEADER_LEN {
        return Err(MidiError::malformed(format!(
            "configuration header truncated (expected {CONFIG_HEADER_LEN}, got {})",
            header.len()
        )));
    }
    Ok(LittleEndian::read_u16(&header[2..4]) as usize)
}

/// What the scanner has learned across all configurations of one connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscoveryState {
    /// `bConfigurationValue` of the last configuration seen; 0 until one is parsed.
    pub configuration: u8,
    /// Sticky: once set during an attempt it stays set until [`DiscoveryState::reset`].
    pub midi_found: bool,
    /// Starts at 1 for the implicit control endpoint.
    pub endpoint_count: u8,
}

impl Default for DiscoveryState {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryState {
    pub const fn new() -> Self {
        Self {
            configuration: 0,
            midi_found: false,
            endpoint_count: 1,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// More than the control endpoint has been found.
    pub fn has_data_endpoints(&self) -> bool {
        self.endpoint_count > 1
    }
}

/// Summary of a single [`scan_configuration`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Bytes actually walked after clamping `wTotalLength`.
    pub scanned_len: usize,
    pub bulk_endpoints: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Descriptor {
    Configuration {
        value: u8,
    },
    Interface {
        number: u8,
        class: u8,
        subclass: u8,
    },
    Endpoint {
        address: u8,
        attributes: u8,
        max_packet_size: u16,
    },
    Other,
}

struct DescriptorCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> DescriptorCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }

    fn fail(&mut self, message: alloc::string::String) -> Option<MidiResult<Descriptor>> {
        self.failed = true;
        Some(Err(MidiError::malformed(message)))
    }
}

impl Iterator for DescriptorCursor<'_> {
    type Item = MidiResult<Descriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let pos = self.pos;
        if pos + 2 > self.buf.len() {
            return self.fail(format!("descriptor header truncated at offset {pos}"));
        }
        let length = self.buf[pos] as usize;
        if length == 0 {
            return self.fail(format!("zero-length descriptor at offset {pos}"));
        }
        let descriptor_type = self.buf[pos + 1];
        let end = (pos + length).min(self.buf.len());
        let body = &self.buf[pos..end];

        let needed = match descriptor_type {
            DESCRIPTOR_TYPE_CONFIGURATION => 6,
            DESCRIPTOR_TYPE_INTERFACE => 7,
            DESCRIPTOR_TYPE_ENDPOINT => 6,
            _ => 0,
        };
        if body.len() < needed {
            return self.fail(format!(
                "descriptor type {descriptor_type:#04x} at offset {pos} truncated \
                 (need {needed} bytes, have {})",
                body.len()
            ));
        }

        let descriptor = match descriptor_type {
            DESCRIPTOR_TYPE_CONFIGURATION => Descriptor::Configuration { value: body[5] },
            DESCRIPTOR_TYPE_INTERFACE => Descriptor::Interface {
                number: body[2],
                class: body[5],
                subclass: body[6],
            },
            DESCRIPTOR_TYPE_ENDPOINT => Descriptor::Endpoint {
                address: body[2],
                attributes: body[3],
                max_packet_size: LittleEndian::read_u16(&body[4..6]),
            },
            _ => Descriptor::Other,
        };
        self.pos = pos + length;
        Some(Ok(descriptor))
    }
}

/// Walk one configuration descriptor blob and register its bulk endpoints.
///
/// `buf` must start with the configuration descriptor header. The declared `wTotalLength` is
/// clamped to `buf.len()`. Bulk endpoints inside an Audio/MIDI-Streaming interface land in
/// the `Midi*` roles, all others in the `Fallback*` roles. On a malformed descriptor the walk
/// stops; records written before that point are kept and later ones are left untouched.
pub fn scan_configuration(
    buf: &[u8],
    table: &mut EndpointTable,
    state: &mut DiscoveryState,
) -> MidiResult<ScanReport> {
    let declared = config_total_length(buf)?;
    let total = declared.min(buf.len());
    if total < declared {
        warn!(declared, available = buf.len(), "configuration descriptor clamped");
    }

    let mut report = ScanReport {
        scanned_len: total,
        bulk_endpoints: 0,
    };
    let mut in_midi_interface = false;

    for descriptor in DescriptorCursor::new(&buf[..total]) {
        match descriptor? {
            Descriptor::Configuration { value } => {
                state.configuration = value;
            }
            Descriptor::Interface {
                number,
                class,
                subclass,
            } => {
                in_midi_interface =
                    class == USB_CLASS_AUDIO && subclass == USB_SUBCLASS_MIDI_STREAMING;
                if in_midi_interface {
                    state.midi_found = true;
                }
                trace!(number, class, subclass, midi = in_midi_interface, "interface");
            }
            Descriptor::Endpoint {
                address,
                attributes,
                max_packet_size,
            } => {
                if attributes & TRANSFER_TYPE_MASK != TRANSFER_TYPE_BULK {
                    continue;
                }
                let is_in = address & ENDPOINT_DIR_IN != 0;
                let role = match (in_midi_interface, is_in) {
                    (true, true) => EndpointRole::MidiIn,
                    (true, false) => EndpointRole::MidiOut,
                    (false, true) => EndpointRole::FallbackIn,
                    (false, false) => EndpointRole::FallbackOut,
                };
                let number = address & ENDPOINT_NUMBER_MASK;
                let size = max_packet_size & MAX_PACKET_SIZE_MASK;
                table.set(role, number, size);
                state.endpoint_count = state.endpoint_count.saturating_add(1);
                report.bulk_endpoints += 1;
                trace!(?role, number, max_packet_size = size, "bulk endpoint registered");
            }
            Descriptor::Other => {}
        }
    }

    Ok(report)
}
