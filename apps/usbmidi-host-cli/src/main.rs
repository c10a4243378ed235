use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::time::Duration;
use tracing::{info, warn};
use usbmidi_host_core::{
    MidiErrorKind, MidiSession, TransportErrorKind, USB_MIDI_PACKET_LEN, UsbMidiPacket,
};
use usbmidi_host_rusb::{RusbTransport, RusbTransportConfig, list_devices};

#[derive(Debug, Parser)]
#[command(name = "usbmidi-host-cli")]
#[command(about = "USB-MIDI host for class-compliant and vendor bulk MIDI devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List attached USB devices with MIDI streaming or bulk endpoints
    List {
        /// Include devices without any bulk endpoint
        #[arg(long)]
        all: bool,
    },
    /// Print incoming USB-MIDI event packets
    Monitor {
        #[command(flatten)]
        device: DeviceArgs,
        /// Stop after this many packets
        #[arg(long)]
        count: Option<usize>,
    },
    /// Send one message; a leading F0 sends it as SysEx
    Send {
        #[command(flatten)]
        device: DeviceArgs,
        /// Cable number (0-15)
        #[arg(long, default_value_t = 0)]
        cable: u8,
        /// Message bytes in hex, e.g. `90 3c 64`
        #[arg(required = true, value_parser = parse_hex_byte)]
        bytes: Vec<u8>,
    },
}

#[derive(Debug, ClapArgs)]
struct DeviceArgs {
    /// USB vendor ID of the device (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    vendor_id: Option<u16>,
    /// USB product ID of the device (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    product_id: Option<u16>,
    /// Bulk/control transfer timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
    /// Leave kernel drivers bound to the device interfaces
    #[arg(long)]
    no_detach: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::List { all } => list(all),
        Command::Monitor { device, count } => monitor(&device, count),
        Command::Send {
            device,
            cable,
            bytes,
        } => send(&device, cable, &bytes),
    }
}

fn list(all: bool) -> Result<()> {
    let devices = list_devices().context("enumerate usb devices")?;
    for dev in devices
        .iter()
        .filter(|d| all || d.midi_streaming || d.bulk_endpoints > 0)
    {
        println!(
            "bus {:03} addr {:03} {:04x}:{:04x} midi={} bulk_endpoints={}",
            dev.bus, dev.address, dev.vendor_id, dev.product_id, dev.midi_streaming, dev.bulk_endpoints
        );
    }
    Ok(())
}

fn connect(args: &DeviceArgs) -> Result<MidiSession<RusbTransport>> {
    let config = RusbTransportConfig {
        timeout: Duration::from_millis(args.timeout_ms),
        detach_kernel_driver: !args.no_detach,
    };
    let transport = RusbTransport::open_matching(args.vendor_id, args.product_id, config)
        .context("open usb device")?;
    let mut session = MidiSession::new(transport);
    session.init(0, 0, false).context("usb-midi init")?;
    let discovery = session.discovery();
    info!(
        vendor_id = session.vendor_id().unwrap_or_default(),
        product_id = session.product_id().unwrap_or_default(),
        configuration = discovery.configuration,
        midi = discovery.midi_found,
        "connected to usb-midi device"
    );
    if !discovery.midi_found {
        warn!("no MIDI streaming interface; talking to vendor bulk endpoints");
    }
    Ok(session)
}

fn monitor(args: &DeviceArgs, count: Option<usize>) -> Result<()> {
    let mut session = connect(args)?;
    let mut buf = vec![0u8; 512];
    let mut seen = 0usize;
    while count.map_or(true, |limit| seen < limit) {
        let read = match session.receive_into(&mut buf) {
            Ok(read) => read,
            Err(err) if err.kind() == MidiErrorKind::Transport(TransportErrorKind::Timeout) => {
                continue;
            }
            Err(err) => return Err(err).context("bulk-in"),
        };
        for frame in buf[..read].chunks_exact(USB_MIDI_PACKET_LEN) {
            let mut bytes = [0u8; USB_MIDI_PACKET_LEN];
            bytes.copy_from_slice(frame);
            if bytes == [0u8; USB_MIDI_PACKET_LEN] {
                continue;
            }
            let packet = UsbMidiPacket::from_bytes(bytes);
            println!(
                "cable {:x} cin {:x} {}",
                packet.cable(),
                packet.cin().as_u8(),
                hex(packet.payload())
            );
            seen += 1;
        }
    }
    session.release().context("release session")?;
    Ok(())
}

fn send(args: &DeviceArgs, cable: u8, bytes: &[u8]) -> Result<()> {
    if cable > 0x0F {
        bail!("cable number {cable} out of range (0-15)");
    }
    let mut session = connect(args)?;
    session
        .send_short(bytes, cable)
        .with_context(|| format!("send {}", hex(bytes)))?;
    info!(bytes = bytes.len(), cable, "message sent");
    session.release().context("release session")?;
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_hex_byte(s: &str) -> Result<u8, String> {
    let s = s.trim_start_matches("0x");
    u8::from_str_radix(s, 16).map_err(|err| format!("invalid hex byte `{s}`: {err}"))
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let s = s.trim_start_matches("0x");
    u16::from_str_radix(s, 16).map_err(|err| format!("invalid hex id `{s}`: {err}"))
}
