//! Serial console: the 2SIO style status/data port pairs wired to the local
//! terminal, a Telnet line, or an input file.

use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::mpsc;
use std::thread;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::io::bus::IoDevice;
use crate::io::telnet::Multiplexor;
use crate::io::BackingStore;
use crate::vm::memory::Memory;

/// Terminal lines reachable through the port table.
pub const LINES: usize = 4;

pub const CONTROL_C: u8 = 0x03;
pub const CONTROL_E: u8 = 0x05;
const BELL: u8 = 0x07;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7F;

const KBD_HAS_CHAR: u8 = 0x40;
const KBD_HAS_NO_CHAR: u8 = 0x01;
const SIO_CAN_READ: u8 = 0x01;
const SIO_CAN_WRITE: u8 = 0x02;
const SIO_RESET: u8 = 0x03;
const VGSIO_CAN_READ: u8 = 0x02;
const VGSIO_CAN_WRITE: u8 = 0x01;

/// How one I/O port maps onto a terminal line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortEntry {
    pub port: u8,
    pub line: usize,
    pub can_read: u8,
    pub cannot_read: u8,
    pub can_write: u8,
    /// Status write that discards a pending character.
    pub reset_command: Option<u8>,
    pub has_out: bool,
    pub builtin: bool,
}

impl PortEntry {
    const fn builtin(port: u8, line: usize, can_read: u8, cannot_read: u8, can_write: u8, reset: bool, has_out: bool) -> Self {
        Self {
            port,
            line,
            can_read,
            cannot_read,
            can_write,
            reset_command: if reset { Some(SIO_RESET) } else { None },
            has_out,
            builtin: true,
        }
    }

    /// Data ports carry characters; the rest report status.
    pub fn is_data_port(&self) -> bool {
        self.has_out || (self.can_read == 0 && self.cannot_read == 0 && self.can_write == 0)
    }
}

#[rustfmt::skip]
pub const BUILTIN_PORTS: [PortEntry; 12] = [
    PortEntry::builtin(0x00, 0, KBD_HAS_CHAR, KBD_HAS_NO_CHAR, SIO_CAN_WRITE, false, false),
    PortEntry::builtin(0x01, 0, 0, 0, 0, false, false),
    PortEntry::builtin(0x02, 0, VGSIO_CAN_READ, 0, VGSIO_CAN_WRITE, false, true),
    PortEntry::builtin(0x03, 0, VGSIO_CAN_READ, 0, VGSIO_CAN_WRITE, false, false),
    PortEntry::builtin(0x10, 0, SIO_CAN_READ, 0, SIO_CAN_WRITE, true, false),
    PortEntry::builtin(0x14, 1, SIO_CAN_READ, 0, SIO_CAN_WRITE, true, false),
    PortEntry::builtin(0x16, 2, SIO_CAN_READ, 0, SIO_CAN_WRITE, true, false),
    PortEntry::builtin(0x18, 3, SIO_CAN_READ, 0, SIO_CAN_WRITE, true, false),
    PortEntry::builtin(0x11, 0, SIO_CAN_READ, 0, SIO_CAN_WRITE, true, true),
    PortEntry::builtin(0x15, 1, SIO_CAN_READ, 0, SIO_CAN_WRITE, true, true),
    PortEntry::builtin(0x17, 2, SIO_CAN_READ, 0, SIO_CAN_WRITE, true, true),
    PortEntry::builtin(0x19, 3, SIO_CAN_READ, 0, SIO_CAN_WRITE, true, true),
];

impl fmt::Display for PortEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tf = |b: bool| if b { 'T' } else { 'F' };
        write!(
            f,
            "({:02x}/{}/{:02x}/{:02x}/{:02x}/{}/{:02x}/{})",
            self.port,
            self.line,
            self.can_read,
            self.cannot_read,
            self.can_write,
            tf(self.reset_command.is_some()),
            self.reset_command.unwrap_or(0),
            tf(self.has_out)
        )
    }
}

/// A port table edit: `port/line/read/notread/write/T|F/reset/T|F` adds or
/// replaces a mapping, a bare hex port removes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMapping {
    Set(PortEntry),
    Remove(u8),
}

impl FromStr for PortMapping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::PortMapping(s.to_string());
        let hex = |field: &str| u32::from_str_radix(field, 16).map_err(|_| bad());
        let flag = |field: &str| match field {
            "T" => Ok(true),
            "F" => Ok(false),
            _ => Err(bad()),
        };
        let byte = |field: &str| hex(field).and_then(|v| u8::try_from(v).map_err(|_| bad()));

        let fields: Vec<&str> = s.trim().split('/').collect();
        match fields.as_slice() {
            [port] => Ok(PortMapping::Remove(byte(port)?)),
            [port, line, can_read, cannot_read, can_write, has_reset, reset, has_out] => {
                let raw = hex(port)?;
                if raw > 0xFF {
                    info!("Truncating port 0x{:x} to 0x{:02x}.", raw, raw & 0xFF);
                }
                let line: usize = line.parse().map_err(|_| bad())?;
                if line >= LINES {
                    return Err(bad());
                }
                let reset = byte(reset)?;
                Ok(PortMapping::Set(PortEntry {
                    port: (raw & 0xFF) as u8,
                    line,
                    can_read: byte(can_read)?,
                    cannot_read: byte(cannot_read)?,
                    can_write: byte(can_write)?,
                    reset_command: flag(has_reset)?.then_some(reset),
                    has_out: flag(has_out)?,
                    builtin: false,
                }))
            }
            _ => Err(bad()),
        }
    }
}

/// Terminal behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SioOptions {
    /// Strip bit 7 on output.
    pub ansi: bool,
    pub upper: bool,
    /// Apply backspace/delete mapping (and upper-casing) to input.
    pub map: bool,
    /// Map BS to DEL instead of DEL to BS.
    pub backspace: bool,
    /// Swallow BEL on output.
    pub quiet_bell: bool,
    pub verbose: bool,
}

impl Default for SioOptions {
    fn default() -> Self {
        Self {
            ansi: false,
            upper: false,
            map: true,
            backspace: false,
            quiet_bell: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(u8),
    /// The stop character: halt the simulation, do not deliver it.
    Stop,
}

pub trait Console {
    fn poll(&mut self) -> Option<Key>;
    fn put(&mut self, byte: u8);
}

/// Local terminal through crossterm. Keys are read on a helper thread and
/// picked up without blocking.
pub struct TerminalConsole {
    rx: mpsc::Receiver<Key>,
    out: io::Stdout,
}

impl TerminalConsole {
    pub fn new(stop_char: u8) -> Self {
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || loop {
            if let Ok(Event::Key(key)) = event::read() {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let Some(byte) = key_to_byte(&key) else {
                    continue;
                };
                let key = if byte == stop_char { Key::Stop } else { Key::Char(byte) };
                if tx.send(key).is_err() {
                    break;
                }
            }
        });

        Self { rx, out: io::stdout() }
    }
}

fn key_to_byte(key: &KeyEvent) -> Option<u8> {
    match key.code {
        KeyCode::Char(c) if c.is_ascii() => {
            if key.modifiers.contains(KeyModifiers::CONTROL) {
                Some(c.to_ascii_uppercase() as u8 & 0x1F)
            } else {
                Some(c as u8)
            }
        }
        KeyCode::Enter => Some(0x0D),
        KeyCode::Tab => Some(0x09),
        KeyCode::Backspace => Some(BACKSPACE),
        KeyCode::Delete => Some(DELETE),
        KeyCode::Esc => Some(0x1B),
        _ => None,
    }
}

impl Console for TerminalConsole {
    fn poll(&mut self) -> Option<Key> {
        self.rx.try_recv().ok()
    }

    fn put(&mut self, byte: u8) {
        if let Err(e) = self.out.write_all(&[byte]).and_then(|_| self.out.flush()) {
            error!("console output failed: {}", e);
        }
    }
}

/// Console for machines whose terminal lives elsewhere, e.g. on Telnet.
pub struct NullConsole;

impl Console for NullConsole {
    fn poll(&mut self) -> Option<Key> {
        None
    }

    fn put(&mut self, _byte: u8) {}
}

enum Input {
    Console,
    Telnet(Rc<RefCell<Multiplexor>>),
    File { store: Box<dyn BackingStore>, eof: bool },
}

pub struct Sio {
    ports: Vec<PortEntry>,
    pub options: SioOptions,
    input: Input,
    console: Box<dyn Console>,
    /// Character taken from the console by a status read.
    buffered: Option<u8>,
    stop_requested: bool,
}

impl Sio {
    pub fn new(console: Box<dyn Console>) -> Self {
        Self {
            ports: BUILTIN_PORTS.to_vec(),
            options: SioOptions::default(),
            input: Input::Console,
            console,
            buffered: None,
            stop_requested: false,
        }
    }

    pub fn ports(&self) -> &[PortEntry] {
        &self.ports
    }

    pub fn port(&self, port: u8) -> Option<&PortEntry> {
        self.ports.iter().find(|e| e.port == port)
    }

    /// Add or replace the mapping for `entry.port`; returns the old one.
    pub fn set_port(&mut self, entry: PortEntry) -> Option<PortEntry> {
        match self.ports.iter_mut().find(|e| e.port == entry.port) {
            Some(old) => {
                let previous = *old;
                if self.options.verbose {
                    info!("Replacing mapping for port 0x{:02x}. {} -> {}", entry.port, previous, entry);
                }
                *old = entry;
                Some(previous)
            }
            None => {
                if self.options.verbose {
                    info!("Adding mapping for port 0x{:02x}. {}", entry.port, entry);
                }
                self.ports.push(entry);
                None
            }
        }
    }

    pub fn remove_port(&mut self, port: u8) -> Result<PortEntry> {
        let Some(i) = self.ports.iter().position(|e| e.port == port) else {
            return Err(Error::PortMapping(format!("no mapping for port 0x{:02x} exists", port)));
        };
        let old = self.ports.remove(i);
        if self.options.verbose {
            info!("Removing mapping for port 0x{:02x}. {}", port, old);
        }
        Ok(old)
    }

    /// Mappings added on top of the built-in table.
    pub fn extra_ports(&self) -> impl Iterator<Item = &PortEntry> {
        self.ports.iter().filter(|e| !e.builtin)
    }

    pub fn attach_telnet(&mut self, mux: Rc<RefCell<Multiplexor>>) {
        self.buffered = None;
        self.input = Input::Telnet(mux);
    }

    pub fn attach_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|source| Error::Open { path: path.to_path_buf(), source })?;
        self.attach_store(Box::new(file));
        Ok(())
    }

    /// Take console input from `store`; output still goes to the console.
    pub fn attach_store(&mut self, store: Box<dyn BackingStore>) {
        self.buffered = None;
        self.input = Input::File { store, eof: false };
    }

    pub fn detach(&mut self) -> Result<()> {
        self.buffered = None;
        match std::mem::replace(&mut self.input, Input::Console) {
            Input::Console => Err(Error::NotAttached { device: "SIO", unit: 0 }),
            Input::Telnet(mux) => {
                mux.borrow_mut().close();
                Ok(())
            }
            Input::File { .. } => Ok(()),
        }
    }

    pub fn is_telnet(&self) -> bool {
        matches!(self.input, Input::Telnet(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.input, Input::File { .. })
    }

    pub fn reset(&mut self) {
        self.buffered = None;
        match &mut self.input {
            Input::File { store, eof } => {
                if let Err(e) = store.seek(SeekFrom::Start(0)) {
                    error!("SIO: cannot rewind input file: {}", e);
                }
                *eof = false;
            }
            Input::Telnet(mux) => mux.borrow_mut().reset_lines(),
            Input::Console => {}
        }
    }

    /// Whether the stop key was typed since the last call.
    pub fn take_stop(&mut self) -> bool {
        std::mem::take(&mut self.stop_requested)
    }

    pub fn map_character(&self, ch: u8) -> u8 {
        if !self.options.map {
            return ch;
        }
        match (self.options.backspace, ch) {
            (true, BACKSPACE) => DELETE,
            (false, DELETE) => BACKSPACE,
            _ if self.options.upper => ch.to_ascii_uppercase(),
            _ => ch,
        }
    }

    /// Accept pending connections and move telnet traffic.
    pub fn poll_connection(&mut self) {
        let Input::Telnet(mux) = &self.input else {
            return;
        };
        let mut mux = mux.borrow_mut();
        if let Some(i) = mux.poll_connections() {
            if let Some(line) = mux.line_mut(i) {
                line.receive_enabled = true;
            }
        }
        mux.poll_rx();
        mux.poll_tx();
    }

    fn detach_at_eof(&mut self) {
        if let Input::File { eof: true, .. } = self.input {
            debug!("SIO: input file exhausted, back to console");
            self.input = Input::Console;
            self.buffered = None;
        }
    }

    fn status_in(&mut self, entry: &PortEntry) -> u8 {
        self.detach_at_eof();
        match &self.input {
            Input::File { .. } => entry.can_read | entry.can_write,
            Input::Telnet(mux) => {
                let mux = mux.borrow();
                let Some(line) = mux.line(entry.line) else {
                    return entry.cannot_read;
                };
                let read = if line.rx_queue_len() > 0 { entry.can_read } else { entry.cannot_read };
                let write = if line.is_connected() && line.transmit_enabled() { entry.can_write } else { 0 };
                read | write
            }
            Input::Console => {
                if self.buffered.is_some() {
                    return entry.can_read | entry.can_write;
                }
                match self.console.poll() {
                    Some(Key::Stop) => {
                        self.stop_requested = true;
                        entry.can_write | entry.cannot_read
                    }
                    Some(Key::Char(ch)) => {
                        self.buffered = Some(ch);
                        entry.can_read | entry.can_write
                    }
                    None => entry.can_write | entry.cannot_read,
                }
            }
        }
    }

    fn status_out(&mut self, entry: &PortEntry, data: u8) {
        if entry.reset_command == Some(data) {
            self.buffered = None;
        }
    }

    fn data_in(&mut self, entry: &PortEntry) -> u8 {
        if let Input::File { eof: true, .. } = self.input {
            self.detach_at_eof();
            return CONTROL_C;
        }
        let ch = match &mut self.input {
            Input::File { store, eof } => {
                let mut byte = [0u8; 1];
                match store.read(&mut byte) {
                    Ok(1) => byte[0],
                    result => {
                        if let Err(e) = result {
                            error!("SIO: input file read failed: {}", e);
                        }
                        *eof = true;
                        return CONTROL_C;
                    }
                }
            }
            Input::Telnet(mux) => mux
                .borrow_mut()
                .line_mut(entry.line)
                .and_then(|line| line.getc())
                .map_or(0, |r| r.byte),
            Input::Console => self.buffered.take().unwrap_or(0),
        };
        self.map_character(ch)
    }

    fn data_out(&mut self, entry: &PortEntry, data: u8) {
        if !entry.has_out {
            return;
        }
        let ch = if self.options.ansi { data & 0x7F } else { data };
        if ch == BELL && self.options.quiet_bell {
            return;
        }
        match &self.input {
            Input::Telnet(mux) => {
                if let Some(line) = mux.borrow_mut().line_mut(entry.line) {
                    line.putc(ch);
                }
            }
            _ => self.console.put(ch),
        }
    }
}

impl IoDevice for Sio {
    fn port_in_byte(&mut self, port: u8, _mem: &mut dyn Memory) -> u8 {
        let Some(entry) = self.port(port).copied() else {
            return 0xFF;
        };
        self.poll_connection();
        if entry.is_data_port() {
            self.data_in(&entry)
        } else {
            self.status_in(&entry)
        }
    }

    fn port_out_byte(&mut self, port: u8, value: u8, _mem: &mut dyn Memory) {
        let Some(entry) = self.port(port).copied() else {
            return;
        };
        self.poll_connection();
        if entry.is_data_port() {
            self.data_out(&entry, value)
        } else {
            self.status_out(&entry, value)
        }
    }

    fn name(&self) -> &'static str {
        "SIO"
    }
}
