//! Telnet terminal multiplexor: a listening socket plus a fixed set of
//! lines, each running its own option-negotiation state machine. Everything
//! is polled from the simulation loop; sockets never block.

mod line;

#[cfg(test)]
mod tests;

use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

use log::{debug, info};

use crate::error::{Error, Result};

pub use self::line::{Line, ParseState, Received, BUFFER_SIZE, GUARD};

pub const IAC: u8 = 0xFF;
pub const DONT: u8 = 0xFE;
pub const DO: u8 = 0xFD;
pub const WONT: u8 = 0xFC;
pub const WILL: u8 = 0xFB;
pub const BRK: u8 = 0xF3;

pub const OPT_BINARY: u8 = 0;
pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_LINE: u8 = 34;

/// Options announced to every new connection.
#[rustfmt::skip]
pub const NEGOTIATION: [u8; 15] = [
    IAC, WILL, OPT_LINE,
    IAC, WILL, OPT_SGA,
    IAC, WILL, OPT_ECHO,
    IAC, WILL, OPT_BINARY,
    IAC, DO, OPT_BINARY,
];

pub const BUSY_MESSAGE: &str = "All connections busy\r\n";

/// A non-blocking byte stream to a remote terminal. Reads and writes that
/// cannot make progress fail with `WouldBlock`; a read of 0 means the peer
/// closed the connection.
pub trait Connection: Read + Write {
    fn peer(&self) -> Option<String>;
}

pub trait Listener {
    /// A pending connection, or `None` if nobody is waiting.
    fn accept(&mut self) -> io::Result<Option<Box<dyn Connection>>>;
}

impl Connection for TcpStream {
    fn peer(&self) -> Option<String> {
        self.peer_addr().ok().map(|addr| addr.to_string())
    }
}

pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    pub fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|source| Error::Listen { port, source })?;
        listener.set_nonblocking(true).map_err(|source| Error::Listen { port, source })?;
        Ok(Self { listener })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }
}

impl Listener for TcpTransport {
    fn accept(&mut self) -> io::Result<Option<Box<dyn Connection>>> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                Ok(Some(Box::new(stream)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub struct Multiplexor {
    lines: Vec<Line>,
    listener: Option<Box<dyn Listener>>,
    name: String,
}

impl Multiplexor {
    /// `name` is the simulator name used in the greeting banners.
    pub fn new(lines: usize, name: &str) -> Self {
        Self {
            lines: (0..lines).map(|_| Line::new()).collect(),
            listener: None,
            name: name.to_string(),
        }
    }

    pub fn lines(&self) -> usize {
        self.lines.len()
    }

    pub fn line(&self, index: usize) -> Option<&Line> {
        self.lines.get(index)
    }

    pub fn line_mut(&mut self, index: usize) -> Option<&mut Line> {
        self.lines.get_mut(index)
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Start accepting Telnet connections on `port`.
    pub fn open(&mut self, port: u16) -> Result<()> {
        let transport = TcpTransport::bind(port)?;
        info!("Listening on port {}", port);
        self.listen(Box::new(transport));
        Ok(())
    }

    pub fn listen(&mut self, listener: Box<dyn Listener>) {
        for line in &mut self.lines {
            line.reset();
        }
        self.listener = Some(listener);
    }

    /// Accept at most one waiting connection. Returns the line it was
    /// assigned to.
    pub fn poll_connections(&mut self) -> Option<usize> {
        let listener = self.listener.as_mut()?;
        let mut conn = match listener.accept() {
            Ok(Some(conn)) => conn,
            Ok(None) => return None,
            Err(e) => {
                debug!("telnet: accept failed: {}", e);
                return None;
            }
        };
        let Some(index) = self.lines.iter().position(|line| !line.is_connected()) else {
            debug!("telnet: refusing {:?}, all lines busy", conn.peer());
            let _ = conn.write_all(BUSY_MESSAGE.as_bytes());
            return None;
        };
        debug!("telnet: {:?} connected on line {}", conn.peer(), index);
        let banner = format!("\n\r\nConnected to the {} simulator\r\n\n", self.name);
        let line = &mut self.lines[index];
        line.connect(conn);
        line.message(&NEGOTIATION);
        line.message(banner.as_bytes());
        Some(index)
    }

    pub fn poll_rx(&mut self) {
        for line in &mut self.lines {
            line.poll_rx();
        }
    }

    pub fn poll_tx(&mut self) {
        for line in &mut self.lines {
            line.poll_tx();
        }
    }

    /// Drop every connection without notice; the listener stays open.
    pub fn reset_lines(&mut self) {
        for line in &mut self.lines {
            if line.is_connected() {
                line.reset();
            }
        }
    }

    /// Operator-initiated disconnect of one line.
    pub fn disconnect(&mut self, index: usize) -> Result<()> {
        let line = self
            .lines
            .get_mut(index)
            .ok_or(Error::NoSuchUnit { device: "line", unit: index })?;
        if line.is_connected() {
            line.message(b"\r\nOperator disconnected line\r\n\n");
            line.reset();
        }
        Ok(())
    }

    /// Say goodbye on every connected line and stop listening.
    pub fn close(&mut self) {
        let notice = format!("\r\nDisconnected from the {} simulator\r\n\n", self.name);
        for line in &mut self.lines {
            if line.is_connected() {
                line.message(notice.as_bytes());
                line.reset();
            }
        }
        self.listener = None;
    }

    pub fn connection_summaries(&self) -> Vec<String> {
        self.lines.iter().enumerate().map(|(i, line)| line.connection_summary(i)).collect()
    }

    pub fn statistics(&self) -> Vec<String> {
        self.lines.iter().enumerate().map(|(i, line)| line.statistics(i)).collect()
    }
}
