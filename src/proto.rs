//! Control-channel vocabulary and transport.
//!
//! The monitor app listens on a virtual MIDI port and maps a handful of
//! control-change numbers to its own controls. Messages flow one way:
//! the app never reports state back on this channel.

use crate::errors::TransportError;
use crate::midi::{format_hex, MidiMessage};
use midir::{MidiOutput, MidiOutputConnection};
use tracing::{debug, info};

/// CC numbers the monitor app maps in its control settings.
pub mod cc {
    /// Absolute volume, 0-127.
    pub const VOLUME_ABS: u8 = 20;
    /// Mute on/off (127/0).
    pub const MUTE: u8 = 23;
    /// Dim on/off (127/0).
    pub const DIM: u8 = 24;
    /// System power toggle trigger (momentary 127).
    pub const POWER: u8 = 28;
}

/// A command on the monitor app's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// Set volume to an absolute 0-127 value.
    VolumeAbsolute(u8),
    /// Drive mute to an explicit state.
    Mute(bool),
    /// Drive dim to an explicit state.
    Dim(bool),
    /// Fire the power toggle. The channel has no way to say "on" or "off".
    PowerToggle,
}

impl ProtocolMessage {
    pub fn to_midi(self, channel: u8) -> MidiMessage {
        let (cc, value) = match self {
            ProtocolMessage::VolumeAbsolute(v) => (cc::VOLUME_ABS, v.min(127)),
            ProtocolMessage::Mute(on) => (cc::MUTE, if on { 127 } else { 0 }),
            ProtocolMessage::Dim(on) => (cc::DIM, if on { 127 } else { 0 }),
            ProtocolMessage::PowerToggle => (cc::POWER, 127),
        };
        MidiMessage::ControlChange { channel, cc, value }
    }
}

impl std::fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolMessage::VolumeAbsolute(v) => write!(f, "Volume={v}"),
            ProtocolMessage::Mute(on) => write!(f, "Mute={}", if *on { "on" } else { "off" }),
            ProtocolMessage::Dim(on) => write!(f, "Dim={}", if *on { "on" } else { "off" }),
            ProtocolMessage::PowerToggle => write!(f, "PowerToggle"),
        }
    }
}

/// Write side of the control channel.
///
/// Exactly one task (the command emitter) writes through this, so
/// messages never interleave.
pub trait ProtocolTransport: Send {
    fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError>;
    fn reconnect(&mut self) -> Result<(), TransportError>;
}

/// midir-backed transport. Finds the port by case-insensitive substring
/// match, which survives the index reshuffling Windows does to MIDI port
/// names.
pub struct MidiTransport {
    port_pattern: String,
    channel: u8,
    conn: Option<MidiOutputConnection>,
}

impl MidiTransport {
    pub fn new(port_pattern: impl Into<String>, channel: u8) -> Self {
        Self {
            port_pattern: port_pattern.into(),
            channel: channel & 0x0F,
            conn: None,
        }
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        let midi_out = MidiOutput::new("volknob-gw")
            .map_err(|e| TransportError::Reconnect(e.to_string()))?;

        let pattern = self.port_pattern.to_lowercase();
        let mut found = None;
        for port in midi_out.ports() {
            if let Ok(name) = midi_out.port_name(&port) {
                if name.to_lowercase().contains(&pattern) {
                    debug!("found port '{}' matching pattern '{}'", name, self.port_pattern);
                    found = Some((port, name));
                    break;
                }
            }
        }

        let (port, name) = found.ok_or_else(|| {
            TransportError::PortNotFound(self.port_pattern.clone())
        })?;

        let conn = midi_out
            .connect(&port, "volknob-gw")
            .map_err(|e| TransportError::Reconnect(e.to_string()))?;

        info!("connected to control channel '{}'", name);
        self.conn = Some(conn);
        Ok(())
    }
}

impl ProtocolTransport for MidiTransport {
    fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
        if self.conn.is_none() {
            self.connect()?;
        }

        let data = message.to_midi(self.channel).encode();
        let conn = self.conn.as_mut().ok_or_else(|| {
            TransportError::WriteFailed("not connected".into())
        })?;

        match conn.send(&data) {
            Ok(()) => {
                debug!("TX {} | {}", format_hex(&data), message);
                Ok(())
            }
            Err(e) => {
                // A failed write usually means the virtual port went away;
                // drop the connection so the next attempt redials.
                self.conn = None;
                Err(TransportError::WriteFailed(e.to_string()))
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.conn = None;
        self.connect()
    }
}

/// Print available MIDI output ports (for `--list-ports`).
pub fn print_output_ports() {
    use colored::*;

    println!("\n{}", "=== MIDI Output Ports ===".bold().cyan());
    match MidiOutput::new("volknob-gw-scanner") {
        Ok(midi_out) => {
            let ports = midi_out.ports();
            if ports.is_empty() {
                println!("  {}", "(none found)".yellow());
            }
            for (i, port) in ports.iter().enumerate() {
                if let Ok(name) = midi_out.port_name(port) {
                    println!("  {}: {}", i, name.green());
                }
            }
        }
        Err(e) => println!("  {} {}", "error:".red(), e),
    }
    println!();
}
