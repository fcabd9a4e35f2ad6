use std::fmt::Write as _;
use std::io::{ErrorKind, Read, Write};
use std::time::Instant;

use log::debug;

use super::{Connection, BRK, IAC, OPT_BINARY, WILL, WONT};

pub const BUFFER_SIZE: usize = 128;
/// Receive space kept back for negotiation sequences split across reads;
/// also the transmit high-water mark.
pub const GUARD: usize = 12;

const CR: u8 = 0o15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Normal,
    Iac,
    Will,
    Wont,
    /// Drop the next byte.
    Skip,
}

/// A destuffed character, with the break condition it arrived with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub byte: u8,
    pub brk: bool,
}

/// One terminal line of the multiplexor.
pub struct Line {
    rx: [u8; BUFFER_SIZE],
    rx_break: [bool; BUFFER_SIZE],
    rx_read: usize,
    rx_write: usize,
    tx: [u8; BUFFER_SIZE],
    tx_read: usize,
    tx_write: usize,
    state: ParseState,
    binary: bool,
    pub receive_enabled: bool,
    transmit_enabled: bool,
    conn: Option<Box<dyn Connection>>,
    peer: Option<String>,
    connected_at: Option<Instant>,
    rx_count: u64,
    tx_count: u64,
}

impl Line {
    pub fn new() -> Self {
        Self {
            rx: [0; BUFFER_SIZE],
            rx_break: [false; BUFFER_SIZE],
            rx_read: 0,
            rx_write: 0,
            tx: [0; BUFFER_SIZE],
            tx_read: 0,
            tx_write: 0,
            state: ParseState::Normal,
            binary: true,
            receive_enabled: false,
            transmit_enabled: true,
            conn: None,
            peer: None,
            connected_at: None,
            rx_count: 0,
            tx_count: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn binary(&self) -> bool {
        self.binary
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn transmit_enabled(&self) -> bool {
        self.transmit_enabled
    }

    /// Characters waiting to be read by the device.
    pub fn rx_queue_len(&self) -> usize {
        self.rx_write - self.rx_read
    }

    /// Bytes waiting to be sent to the peer.
    pub fn tx_queue_len(&self) -> usize {
        self.tx_write - self.tx_read
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.rx_count, self.tx_count)
    }

    /// Take over a freshly accepted connection.
    pub(super) fn connect(&mut self, conn: Box<dyn Connection>) {
        self.peer = conn.peer();
        self.conn = Some(conn);
        self.connected_at = Some(Instant::now());
        self.rx_read = 0;
        self.rx_write = 0;
        self.tx_read = 0;
        self.tx_write = 0;
        self.rx_count = 0;
        self.tx_count = 0;
        self.state = ParseState::Normal;
        self.transmit_enabled = true;
        self.binary = true;
        self.receive_enabled = false;
    }

    /// Send `msg` straight to the peer, bypassing the transmit buffer.
    pub(super) fn message(&mut self, msg: &[u8]) {
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = conn.write_all(msg) {
                debug!("telnet: message to {:?} failed: {}", self.peer, e);
            }
        }
    }

    /// Drop the connection and return the line to its idle state.
    pub fn reset(&mut self) {
        if let Some(peer) = self.peer.take() {
            debug!("telnet: {} disconnected", peer);
        }
        self.conn = None;
        self.connected_at = None;
        self.state = ParseState::Normal;
        self.rx_read = 0;
        self.rx_write = 0;
        self.tx_read = 0;
        self.tx_write = 0;
        self.transmit_enabled = true;
        self.binary = true;
    }

    /// Next destuffed character, if any.
    pub fn getc(&mut self) -> Option<Received> {
        let mut value = None;
        if self.conn.is_some() && self.receive_enabled && self.rx_read < self.rx_write {
            value = Some(Received {
                byte: self.rx[self.rx_read],
                brk: self.rx_break[self.rx_read],
            });
            self.rx_read += 1;
        }
        if self.rx_read == self.rx_write {
            self.rx_read = 0;
            self.rx_write = 0;
        }
        value
    }

    /// Queue a character for the peer. Callers check `transmit_enabled`
    /// before writing more.
    pub fn putc(&mut self, byte: u8) {
        if self.conn.is_none() {
            return;
        }
        if self.tx_write < BUFFER_SIZE {
            self.tx[self.tx_write] = byte;
            self.tx_write += 1;
            if byte == IAC && self.tx_write < BUFFER_SIZE {
                self.tx[self.tx_write] = IAC;
                self.tx_write += 1;
            }
            if self.tx_write > BUFFER_SIZE - GUARD {
                self.transmit_enabled = false;
            }
        } else {
            self.transmit_enabled = false;
        }
    }

    pub(super) fn poll_rx(&mut self) {
        if !self.receive_enabled {
            return;
        }
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let limit = if self.rx_write == 0 {
            BUFFER_SIZE - GUARD
        } else if self.state != ParseState::Normal {
            BUFFER_SIZE
        } else {
            return;
        };
        if self.rx_write >= limit {
            return;
        }
        match conn.read(&mut self.rx[self.rx_write..limit]) {
            Ok(0) => self.reset(),
            Ok(n) => {
                let start = self.rx_write;
                self.rx_break[start..start + n].fill(false);
                self.rx_write += n;
                self.rx_count += n as u64;
                self.destuff(start);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("telnet: receive from {:?} failed: {}", self.peer, e);
                self.reset();
            }
        }
        if self.rx_read == self.rx_write {
            self.rx_read = 0;
            self.rx_write = 0;
        }
    }

    pub(super) fn poll_tx(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let mut pending = self.tx_write - self.tx_read;
        if pending > 0 {
            match conn.write(&self.tx[self.tx_read..self.tx_write]) {
                Ok(sent) => {
                    self.tx_read += sent;
                    self.tx_count += sent as u64;
                    pending -= sent;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("telnet: transmit to {:?} failed: {}", self.peer, e);
                    self.reset();
                    return;
                }
            }
        }
        if pending == 0 {
            self.transmit_enabled = true;
            self.tx_read = 0;
            self.tx_write = 0;
        }
    }

    /// Strip negotiation from the bytes received at `start..rx_write`.
    fn destuff(&mut self, mut j: usize) {
        while j < self.rx_write {
            let byte = self.rx[j];
            match self.state {
                ParseState::Normal => {
                    if byte == IAC {
                        self.state = ParseState::Iac;
                        self.remove(j);
                        continue;
                    }
                    if byte == CR && !self.binary {
                        self.state = ParseState::Skip;
                    }
                    j += 1;
                }
                ParseState::Iac => {
                    if byte == IAC && self.binary {
                        self.state = ParseState::Normal;
                        j += 1;
                        continue;
                    }
                    if byte == BRK {
                        self.state = ParseState::Normal;
                        self.rx[j] = 0;
                        self.rx_break[j] = true;
                        j += 1;
                        continue;
                    }
                    self.state = match byte {
                        WILL => ParseState::Will,
                        WONT => ParseState::Wont,
                        _ => ParseState::Skip,
                    };
                    self.remove(j);
                }
                ParseState::Will | ParseState::Wont => {
                    if byte == OPT_BINARY {
                        self.binary = self.state == ParseState::Wont;
                    }
                    self.state = ParseState::Normal;
                    self.remove(j);
                }
                ParseState::Skip => {
                    self.state = ParseState::Normal;
                    self.remove(j);
                }
            }
        }
    }

    fn remove(&mut self, p: usize) {
        self.rx.copy_within(p + 1..self.rx_write, p);
        self.rx_break.copy_within(p + 1..self.rx_write, p);
        self.rx_write -= 1;
    }

    /// One-line description of who is connected and for how long.
    pub fn connection_summary(&self, index: usize) -> String {
        let mut out = format!("line {}: ", index);
        match (&self.conn, &self.connected_at) {
            (Some(_), Some(at)) => {
                let _ = write!(out, "peer {}", self.peer.as_deref().unwrap_or("unknown"));
                let secs = at.elapsed().as_secs();
                if secs > 0 {
                    let _ = write!(out, ", connected {:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60);
                }
            }
            _ => out.push_str("line disconnected"),
        }
        out
    }

    /// Queue depths and byte totals in both directions.
    pub fn statistics(&self, index: usize) -> String {
        if !self.is_connected() {
            return format!("line {}: line disconnected", index);
        }
        let onoff = |b: bool| if b { "on" } else { "off" };
        format!(
            "line {}: input ({}) queued/total = {}/{}, output ({}) queued/total = {}/{}",
            index,
            onoff(self.receive_enabled),
            self.rx_queue_len(),
            self.rx_count,
            onoff(self.transmit_enabled),
            self.tx_queue_len(),
            self.tx_count
        )
    }
}

impl Default for Line {
    fn default() -> Self {
        Self::new()
    }
}
