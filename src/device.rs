//! MIDI device access
//!
//! Wraps midir port discovery and connections for the two M3 ports: the
//! input (KEYBOARD) port feeding the callback registry, and the output
//! (SOUND) port commands are sent to. Ports are matched by case-insensitive
//! substring so the tool works with the slightly different names each OS
//! reports.

use anyhow::{anyhow, Context, Result};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::midi::{format_hex, MidiEvent, SystemMessageType};
use crate::registry::CallbackRegistry;

/// Output seam the protocol engine sends through. Lets tests stand in a
/// loopback for the physical port.
pub trait SysexSink {
    fn send_sysex(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Port discovery utilities
pub mod discovery {
    use super::*;
    use colored::*;

    /// Information about a MIDI port
    #[derive(Debug, Clone)]
    pub struct PortInfo {
        pub index: usize,
        pub name: String,
    }

    /// Discover input ports
    pub fn input_ports() -> Result<Vec<PortInfo>> {
        let midi_in = MidiInput::new("m3combi-discovery")?;

        let mut infos = Vec::new();
        for (index, port) in midi_in.ports().iter().enumerate() {
            if let Ok(name) = midi_in.port_name(port) {
                infos.push(PortInfo { index, name });
            }
        }
        Ok(infos)
    }

    /// Discover output ports
    pub fn output_ports() -> Result<Vec<PortInfo>> {
        let midi_out = MidiOutput::new("m3combi-discovery")?;

        let mut infos = Vec::new();
        for (index, port) in midi_out.ports().iter().enumerate() {
            if let Ok(name) = midi_out.port_name(port) {
                infos.push(PortInfo { index, name });
            }
        }
        Ok(infos)
    }

    /// Print discovered ports for the --list-ports mode
    pub fn print_ports() {
        println!("\n{}", "=== Available MIDI Ports ===".bold().cyan());

        println!("\n{}", "Input Ports:".bold());
        match input_ports() {
            Ok(ports) if ports.is_empty() => println!("  {}", "No input ports found".dimmed()),
            Ok(ports) => {
                for port in ports {
                    println!("  [{}] {}", port.index, port.name);
                }
            }
            Err(e) => println!("  {} {}", "Error:".red(), e),
        }

        println!("\n{}", "Output Ports:".bold());
        match output_ports() {
            Ok(ports) if ports.is_empty() => println!("  {}", "No output ports found".dimmed()),
            Ok(ports) => {
                for port in ports {
                    println!("  [{}] {}", port.index, port.name);
                }
            }
            Err(e) => println!("  {} {}", "Error:".red(), e),
        }

        println!();
    }
}

/// Find an input port by substring match (case-insensitive)
fn find_input_port(midi_in: &MidiInput, pattern: &str) -> Option<(midir::MidiInputPort, String)> {
    for port in midi_in.ports() {
        if let Ok(name) = midi_in.port_name(&port) {
            if name.to_lowercase().contains(&pattern.to_lowercase()) {
                debug!("Found port '{}' matching pattern '{}'", name, pattern);
                return Some((port, name));
            }
        }
    }
    None
}

/// Find an output port by substring match (case-insensitive)
fn find_output_port(
    midi_out: &MidiOutput,
    pattern: &str,
) -> Option<(midir::MidiOutputPort, String)> {
    for port in midi_out.ports() {
        if let Ok(name) = midi_out.port_name(&port) {
            if name.to_lowercase().contains(&pattern.to_lowercase()) {
                debug!("Found port '{}' matching pattern '{}'", name, pattern);
                return Some((port, name));
            }
        }
    }
    None
}

/// The M3's KEYBOARD port. Owns the callback registry every inbound event
/// is dispatched through.
pub struct InputDevice {
    port_pattern: String,
    port_name: Option<String>,
    conn: Option<MidiInputConnection<()>>,
    registry: Arc<CallbackRegistry>,
}

impl InputDevice {
    pub fn new(port_pattern: impl Into<String>) -> Self {
        Self {
            port_pattern: port_pattern.into(),
            port_name: None,
            conn: None,
            registry: Arc::new(CallbackRegistry::new()),
        }
    }

    /// The registry handlers are registered with; shared with sessions.
    pub fn registry(&self) -> Arc<CallbackRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Resolved port name after a successful open.
    pub fn name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Connect to the first port matching the configured pattern.
    pub fn open(&mut self) -> Result<()> {
        let midi_in = Self::create_backend()?;
        let (port, name) = find_input_port(&midi_in, &self.port_pattern)
            .ok_or_else(|| anyhow!("Input port '{}' not found", self.port_pattern))?;
        self.connect(midi_in, port, name)
    }

    /// Connect to a port by enumeration index (interactive fallback).
    pub fn open_index(&mut self, index: usize) -> Result<()> {
        let midi_in = Self::create_backend()?;
        let port = midi_in
            .ports()
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow!("No input port at index {}", index))?;
        let name = midi_in
            .port_name(&port)
            .unwrap_or_else(|_| format!("input #{}", index));
        self.connect(midi_in, port, name)
    }

    fn create_backend() -> Result<MidiInput> {
        let mut midi_in = MidiInput::new("m3combi-in").context("Failed to create MIDI input")?;
        // SysEx must come through unfiltered.
        midi_in.ignore(Ignore::None);
        Ok(midi_in)
    }

    fn connect(
        &mut self,
        midi_in: MidiInput,
        port: midir::MidiInputPort,
        name: String,
    ) -> Result<()> {
        self.close();
        info!("Connecting to input port: {}", name);

        let registry = Arc::clone(&self.registry);
        let conn = midi_in
            .connect(
                &port,
                "m3combi",
                move |_timestamp, data, _| {
                    let event = MidiEvent::from_raw(data);
                    // Clock and active-sensing would flood the trace log.
                    let chatter = matches!(
                        &event,
                        MidiEvent::Short(msg) if matches!(
                            msg.system_type(),
                            Some(SystemMessageType::TimingClock)
                                | Some(SystemMessageType::ActiveSensing)
                        )
                    );
                    if !chatter {
                        trace!("recv: {}", format_hex(data));
                    }
                    registry.dispatch(&event);
                },
                (),
            )
            .map_err(|e| anyhow!("Failed to connect to input port '{}': {}", name, e))?;

        self.conn = Some(conn);
        self.port_name = Some(name);
        Ok(())
    }

    /// Drop the connection. Idempotent.
    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            info!("Input device closed");
        }
    }
}

/// The M3's SOUND port, commands go out here.
pub struct OutputDevice {
    port_pattern: String,
    port_name: Option<String>,
    conn: Option<MidiOutputConnection>,
}

impl OutputDevice {
    pub fn new(port_pattern: impl Into<String>) -> Self {
        Self {
            port_pattern: port_pattern.into(),
            port_name: None,
            conn: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Connect to the first port matching the configured pattern.
    pub fn open(&mut self) -> Result<()> {
        let midi_out = MidiOutput::new("m3combi-out").context("Failed to create MIDI output")?;
        let (port, name) = find_output_port(&midi_out, &self.port_pattern)
            .ok_or_else(|| anyhow!("Output port '{}' not found", self.port_pattern))?;
        self.connect(midi_out, port, name)
    }

    /// Connect to a port by enumeration index (interactive fallback).
    pub fn open_index(&mut self, index: usize) -> Result<()> {
        let midi_out = MidiOutput::new("m3combi-out").context("Failed to create MIDI output")?;
        let port = midi_out
            .ports()
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow!("No output port at index {}", index))?;
        let name = midi_out
            .port_name(&port)
            .unwrap_or_else(|_| format!("output #{}", index));
        self.connect(midi_out, port, name)
    }

    fn connect(
        &mut self,
        midi_out: MidiOutput,
        port: midir::MidiOutputPort,
        name: String,
    ) -> Result<()> {
        self.close();
        info!("Connecting to output port: {}", name);

        let conn = midi_out
            .connect(&port, "m3combi")
            .map_err(|e| anyhow!("Failed to connect to output port '{}': {}", name, e))?;

        self.conn = Some(conn);
        self.port_name = Some(name);
        Ok(())
    }

    /// Drop the connection. Idempotent.
    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            info!("Output device closed");
        }
    }
}

impl SysexSink for OutputDevice {
    fn send_sysex(&mut self, bytes: &[u8]) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| anyhow!("Output device not open"))?;
        conn.send(bytes).context("Failed to send SysEx message")?;
        debug!("sent: {}", format_hex(bytes));
        Ok(())
    }
}
