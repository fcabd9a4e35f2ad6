use log::warn;
use num_traits::FromPrimitive;

/// Command state shared by the multi-byte port protocols.
///
/// The first byte written while idle selects the command; each following
/// write is a parameter at `position`; reads walk an independent result
/// cursor. Bytes that do not decode to a known command are remembered raw
/// and leave the device idle, so the next write is taken as a new command.
#[derive(Debug)]
pub struct Sequencer<C> {
    command: Option<C>,
    raw: u8,
    position: usize,
    cursor: usize,
}

impl<C: FromPrimitive + Copy> Sequencer<C> {
    pub fn new() -> Self {
        Self {
            command: None,
            raw: 0,
            position: 0,
            cursor: 0,
        }
    }

    pub fn command(&self) -> Option<C> {
        self.command
    }

    /// Last command byte as written by the guest.
    pub fn raw(&self) -> u8 {
        self.raw
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn begin(&mut self, byte: u8) -> Option<C> {
        self.raw = byte;
        self.command = C::from_u8(byte);
        self.position = 0;
        self.cursor = 0;
        self.command
    }

    /// Index of the parameter being written, then advance.
    pub fn accept_param(&mut self) -> usize {
        let index = self.position;
        self.position += 1;
        index
    }

    /// Index of the result byte being read, then advance.
    pub fn next_result(&mut self) -> usize {
        let index = self.cursor;
        self.cursor += 1;
        index
    }

    pub fn restart_results(&mut self) {
        self.cursor = 0;
    }

    /// Command completed or abandoned.
    pub fn finish(&mut self) {
        self.command = None;
        self.position = 0;
        self.cursor = 0;
    }

    /// Result of a read that no command asked for.
    pub fn out_of_order(&self, device: &str, port: u8, verbose: bool) -> u8 {
        if verbose {
            warn!(
                "{}: illegal IN command detected (port={:02X}h, cmd={}, pos={})",
                device, port, self.raw, self.position
            );
        }
        0x00
    }
}

impl<C: FromPrimitive + Copy> Default for Sequencer<C> {
    fn default() -> Self {
        Self::new()
    }
}
