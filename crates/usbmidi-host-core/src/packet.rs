//! USB-MIDI 1.0 Event Packet codec.
//!
//! ```text
//! +--------+--------+--------+--------+
//! | CN|CIN | MIDI_0 | MIDI_1 | MIDI_2 |
//! +--------+--------+--------+--------+
//! ```
//!
//! The high nibble of byte 0 is the cable number, the low nibble the Code Index Number. Payload
//! bytes beyond the CIN's length are zero.

use alloc::format;

use crate::error::{MidiError, MidiResult};

pub const USB_MIDI_PACKET_LEN: usize = 4;
pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;
pub const MAX_CABLE: u8 = 0x0F;

/// Code Index Number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cin {
    MiscFunction = 0x0,
    CableEvent = 0x1,
    TwoByteSysCom = 0x2,
    ThreeByteSysCom = 0x3,
    SysExStartOrContinue = 0x4,
    SingleByteSysComOrSysExEnd = 0x5,
    TwoByteSysExEnd = 0x6,
    ThreeByteSysExEnd = 0x7,
    NoteOff = 0x8,
    NoteOn = 0x9,
    PolyKeypress = 0xA,
    ControlChange = 0xB,
    ProgramChange = 0xC,
    ChannelPressure = 0xD,
    PitchbendChange = 0xE,
    SingleByte = 0xF,
}

impl Cin {
    /// Decode the low nibble of `value`.
    pub fn from_nibble(value: u8) -> Cin {
        match value & 0x0F {
            0x0 => Self::MiscFunction,
            0x1 => Self::CableEvent,
            0x2 => Self::TwoByteSysCom,
            0x3 => Self::ThreeByteSysCom,
            0x4 => Self::SysExStartOrContinue,
            0x5 => Self::SingleByteSysComOrSysExEnd,
            0x6 => Self::TwoByteSysExEnd,
            0x7 => Self::ThreeByteSysExEnd,
            0x8 => Self::NoteOff,
            0x9 => Self::NoteOn,
            0xA => Self::PolyKeypress,
            0xB => Self::ControlChange,
            0xC => Self::ProgramChange,
            0xD => Self::ChannelPressure,
            0xE => Self::PitchbendChange,
            _ => Self::SingleByte,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Number of meaningful MIDI bytes carried by a packet with this CIN.
    ///
    /// The reserved codes 0x0 and 0x1 may carry 1 to 3 bytes; all 3 are reported.
    pub fn payload_len(self) -> usize {
        match self {
            Cin::MiscFunction | Cin::CableEvent => 3,
            Cin::SingleByteSysComOrSysExEnd | Cin::SingleByte => 1,
            Cin::TwoByteSysCom
            | Cin::TwoByteSysExEnd
            | Cin::ProgramChange
            | Cin::ChannelPressure => 2,
            Cin::ThreeByteSysCom
            | Cin::SysExStartOrContinue
            | Cin::ThreeByteSysExEnd
            | Cin::NoteOff
            | Cin::NoteOn
            | Cin::PolyKeypress
            | Cin::ControlChange
            | Cin::PitchbendChange => 3,
        }
    }
}

/// One 4-byte USB-MIDI Event Packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UsbMidiPacket([u8; USB_MIDI_PACKET_LEN]);

impl UsbMidiPacket {
    /// Build a packet, copying at most `cin.payload_len()` bytes of `payload`.
    pub fn new(cable: u8, cin: Cin, payload: &[u8]) -> Self {
        let mut bytes = [0u8; USB_MIDI_PACKET_LEN];
        bytes[0] = (cable & MAX_CABLE) << 4 | cin.as_u8();
        let len = payload.len().min(cin.payload_len());
        bytes[1..1 + len].copy_from_slice(&payload[..len]);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; USB_MIDI_PACKET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn cable(&self) -> u8 {
        self.0[0] >> 4
    }

    pub fn cin(&self) -> Cin {
        Cin::from_nibble(self.0[0])
    }

    /// Payload trimmed to the length implied by the CIN.
    pub fn payload(&self) -> &[u8] {
        &self.0[1..1 + self.cin().payload_len()]
    }

    pub fn as_bytes(&self) -> &[u8; USB_MIDI_PACKET_LEN] {
        &self.0
    }
}

fn check_cable(cable: u8) -> MidiResult<()> {
    if cable > MAX_CABLE {
        return Err(MidiError::invalid_message(format!(
            "cable number {cable} out of range"
        )));
    }
    Ok(())
}

fn short_layout(status: u8) -> MidiResult<Cin> {
    match status {
        0x80..=0xEF => Ok(Cin::from_nibble(status >> 4)),
        0xF1 | 0xF3 => Ok(Cin::TwoByteSysCom),
        0xF2 => Ok(Cin::ThreeByteSysCom),
        SYSEX_START => Err(MidiError::invalid_message(
            "SysEx start is not a short message",
        )),
        0xF4..=0xFF => Ok(Cin::SingleByte),
        data => Err(MidiError::invalid_message(format!(
            "data byte {data:#04x} in status position"
        ))),
    }
}

/// Encode a short (non-SysEx) MIDI message into a single packet.
///
/// Missing data bytes are zero-padded and bytes beyond the status' length are dropped.
pub fn encode_short(message: &[u8], cable: u8) -> MidiResult<UsbMidiPacket> {
    check_cable(cable)?;
    let status = *message
        .first()
        .ok_or_else(|| MidiError::invalid_message("empty MIDI message"))?;
    let cin = short_layout(status)?;
    Ok(UsbMidiPacket::new(cable, cin, message))
}

/// Split a SysEx stream into packets.
///
/// `stream` must start with 0xF0 and contain a 0xF7 terminator; bytes after the terminator are
/// never read.
pub fn encode_sysex(stream: &[u8], cable: u8) -> MidiResult<SysexPackets<'_>> {
    check_cable(cable)?;
    if stream.first() != Some(&SYSEX_START) {
        return Err(MidiError::invalid_message("SysEx stream must start with 0xF0"));
    }
    let end = stream
        .iter()
        .position(|&b| b == SYSEX_END)
        .ok_or_else(|| MidiError::invalid_message("SysEx stream has no 0xF7 terminator"))?;
    Ok(SysexPackets {
        stream: &stream[..=end],
        pos: 0,
        cable,
    })
}

/// Iterator over the packets of one SysEx stream, see [`encode_sysex`].
#[derive(Clone, Debug)]
pub struct SysexPackets<'a> {
    stream: &'a [u8],
    pos: usize,
    cable: u8,
}

impl Iterator for SysexPackets<'_> {
    type Item = UsbMidiPacket;

    fn next(&mut self) -> Option<UsbMidiPacket> {
        if self.pos >= self.stream.len() {
            return None;
        }
        let group = &self.stream[self.pos..(self.pos + 3).min(self.stream.len())];
        self.pos += group.len();
        let cin = match group.iter().position(|&b| b == SYSEX_END) {
            Some(0) => Cin::SingleByteSysComOrSysExEnd,
            Some(1) => Cin::TwoByteSysExEnd,
            Some(_) => Cin::ThreeByteSysExEnd,
            None => Cin::SysExStartOrContinue,
        };
        Some(UsbMidiPacket::new(self.cable, cin, group))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.stream.len() - self.pos).div_ceil(3);
        (left, Some(left))
    }
}

impl ExactSizeIterator for SysexPackets<'_> {}

/// Extract the MIDI bytes of the first frame in a received buffer.
///
/// Returns `None` when the first four bytes are all zero, which is how an empty read shows up.
/// A genuine packet with cable 0, CIN 0x0 and an all-zero payload is indistinguishable from
/// that and is dropped as well. Short buffers are zero-filled. The header byte is discarded and
/// all three payload bytes are returned regardless of CIN.
pub fn decode(frame: &[u8]) -> Option<[u8; 3]> {
    let mut packet = [0u8; USB_MIDI_PACKET_LEN];
    let len = frame.len().min(USB_MIDI_PACKET_LEN);
    packet[..len].copy_from_slice(&frame[..len]);
    if packet == [0u8; USB_MIDI_PACKET_LEN] {
        return None;
    }
    Some([packet[1], packet[2], packet[3]])
}
