//! Paper tape reader and punch on ports 0x12 (status) and 0x13 (data). The
//! host bridge attaches and detaches tapes through the same shared state.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::io::bus::{IoDevice, WARN_LEVEL};
use crate::io::BackingStore;
use crate::utils::number::WarnBudget;
use crate::vm::memory::Memory;

pub const PTR_STATUS_PORT: u8 = 0x12;
pub const PTR_DATA_PORT: u8 = 0x13;

const CAN_READ: u8 = 0x01;
const CAN_WRITE: u8 = 0x02;
const RESET: u8 = 0x03;
const CONTROL_Z: u8 = 0x1A;

pub struct PaperTape {
    reader: Option<Box<dyn BackingStore>>,
    punch: Option<Box<dyn Write>>,
    eof: bool,
    pub verbose: bool,
    unattached_reader: WarnBudget,
    reader_eof: WarnBudget,
    unattached_punch: WarnBudget,
}

impl PaperTape {
    pub fn new() -> Self {
        Self {
            reader: None,
            punch: None,
            eof: false,
            verbose: false,
            unattached_reader: WarnBudget::new(WARN_LEVEL),
            reader_eof: WarnBudget::new(WARN_LEVEL),
            unattached_punch: WarnBudget::new(WARN_LEVEL),
        }
    }

    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn reader_attached(&self) -> bool {
        self.reader.is_some()
    }

    pub fn punch_attached(&self) -> bool {
        self.punch.is_some()
    }

    pub fn at_eof(&self) -> bool {
        self.eof
    }

    pub fn attach_reader(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|source| Error::Open { path: path.to_path_buf(), source })?;
        self.attach_reader_store(Box::new(file));
        Ok(())
    }

    pub fn attach_reader_store(&mut self, store: Box<dyn BackingStore>) {
        self.reader = Some(store);
        self.eof = false;
    }

    pub fn detach_reader(&mut self) -> Result<()> {
        self.reader.take().map(|_| ()).ok_or(Error::NotAttached { device: "PTR", unit: 0 })
    }

    /// Open the punch output, truncating any previous contents.
    pub fn attach_punch(&mut self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| Error::Open { path: path.to_path_buf(), source })?;
        self.attach_punch_writer(Box::new(file));
        Ok(())
    }

    pub fn attach_punch_writer(&mut self, writer: Box<dyn Write>) {
        self.punch = Some(writer);
    }

    pub fn detach_punch(&mut self) -> Result<()> {
        let Some(mut punch) = self.punch.take() else {
            return Err(Error::NotAttached { device: "PTP", unit: 0 });
        };
        punch.flush()?;
        Ok(())
    }

    /// Rewind the reader and clear EOF.
    pub fn reset(&mut self) {
        self.reset_warnings();
        self.eof = false;
        if let Some(reader) = self.reader.as_mut() {
            if let Err(e) = reader.seek(SeekFrom::Start(0)) {
                error!("PTR: cannot rewind: {}", e);
            }
        }
    }

    pub fn reset_warnings(&mut self) {
        self.unattached_reader.reset();
        self.reader_eof.reset();
        self.unattached_punch.reset();
    }

    fn warn_with(verbose: bool, budget: &mut WarnBudget, msg: impl FnOnce() -> String) {
        if verbose && budget.allow() {
            warn!("{}", msg());
        }
    }

    pub fn status(&mut self, port: u8) -> u8 {
        if self.reader.is_none() {
            Self::warn_with(self.verbose, &mut self.unattached_reader, || {
                format!("Attempt to test status of unattached PTR[0x{:02x}]. 0x02 returned.", port)
            });
            return CAN_WRITE;
        }
        if self.eof {
            CAN_WRITE
        } else {
            CAN_READ | CAN_WRITE
        }
    }

    pub fn control(&mut self, data: u8) {
        if data == RESET {
            self.eof = false;
        }
    }

    pub fn read(&mut self, port: u8) -> u8 {
        if self.eof {
            Self::warn_with(self.verbose, &mut self.reader_eof, || {
                format!("PTR[0x{:02x}] attempted to read past EOF. 0x00 returned.", port)
            });
            return 0;
        }
        let Some(reader) = self.reader.as_mut() else {
            Self::warn_with(self.verbose, &mut self.unattached_reader, || {
                format!("Attempt to read from unattached PTR[0x{:02x}]. 0x00 returned.", port)
            });
            return 0;
        };
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(1) => byte[0],
            result => {
                if let Err(e) = result {
                    error!("PTR: read failed: {}", e);
                }
                debug!("PTR: end of tape");
                self.eof = true;
                CONTROL_Z
            }
        }
    }

    pub fn punch(&mut self, port: u8, data: u8) {
        match self.punch.as_mut() {
            Some(punch) => {
                if let Err(e) = punch.write_all(&[data]) {
                    error!("PTP: write failed: {}", e);
                }
            }
            None => Self::warn_with(self.verbose, &mut self.unattached_punch, || {
                format!("Attempt to output '0x{:02x}' to unattached PTP[0x{:02x}] - ignored.", data, port)
            }),
        }
    }
}

impl Default for PaperTape {
    fn default() -> Self {
        Self::new()
    }
}

/// Port front end of the shared paper tape.
pub struct PaperTapePorts {
    tape: Rc<RefCell<PaperTape>>,
}

impl PaperTapePorts {
    pub fn new(tape: Rc<RefCell<PaperTape>>) -> Self {
        Self { tape }
    }
}

impl IoDevice for PaperTapePorts {
    fn port_in_byte(&mut self, port: u8, _mem: &mut dyn Memory) -> u8 {
        let mut tape = self.tape.borrow_mut();
        match port {
            PTR_STATUS_PORT => tape.status(port),
            PTR_DATA_PORT => tape.read(port),
            _ => 0xFF,
        }
    }

    fn port_out_byte(&mut self, port: u8, value: u8, _mem: &mut dyn Memory) {
        let mut tape = self.tape.borrow_mut();
        match port {
            PTR_STATUS_PORT => tape.control(value),
            PTR_DATA_PORT => tape.punch(port, value),
            _ => {}
        }
    }

    fn name(&self) -> &'static str {
        "PTR"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::testing::SharedStore;
    use crate::vm::memory::FlatMemory;

    fn ports() -> (PaperTapePorts, Rc<RefCell<PaperTape>>, FlatMemory) {
        let tape = PaperTape::shared();
        (PaperTapePorts::new(tape.clone()), tape, FlatMemory::new())
    }

    #[test]
    fn unattached_reader_reports_write_only() {
        let (mut ptr, tape, mut mem) = ports();
        tape.borrow_mut().verbose = true;
        assert_eq!(ptr.port_in_byte(PTR_STATUS_PORT, &mut mem), CAN_WRITE);
        assert_eq!(ptr.port_in_byte(PTR_DATA_PORT, &mut mem), 0);
    }

    #[test]
    fn reader_delivers_bytes_then_control_z() {
        let (mut ptr, tape, mut mem) = ports();
        tape.borrow_mut().attach_reader_store(Box::new(SharedStore::new(vec![0x41, 0x42])));
        assert_eq!(ptr.port_in_byte(PTR_STATUS_PORT, &mut mem), CAN_READ | CAN_WRITE);
        assert_eq!(ptr.port_in_byte(PTR_DATA_PORT, &mut mem), 0x41);
        assert_eq!(ptr.port_in_byte(PTR_DATA_PORT, &mut mem), 0x42);
        assert_eq!(ptr.port_in_byte(PTR_DATA_PORT, &mut mem), CONTROL_Z);
        assert_eq!(ptr.port_in_byte(PTR_STATUS_PORT, &mut mem), CAN_WRITE);
        assert_eq!(ptr.port_in_byte(PTR_DATA_PORT, &mut mem), 0);

        // a reset command only clears the flag; the tape stays at its end
        ptr.port_out_byte(PTR_STATUS_PORT, RESET, &mut mem);
        assert!(!tape.borrow().at_eof());
        assert_eq!(ptr.port_in_byte(PTR_DATA_PORT, &mut mem), CONTROL_Z);

        tape.borrow_mut().reset();
        assert_eq!(ptr.port_in_byte(PTR_DATA_PORT, &mut mem), 0x41);
    }

    #[test]
    fn punch_collects_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ptp");
        let (mut ptr, tape, mut mem) = ports();
        ptr.port_out_byte(PTR_DATA_PORT, 0x55, &mut mem);
        tape.borrow_mut().attach_punch(&path).unwrap();
        for b in b"PUNCH" {
            ptr.port_out_byte(PTR_DATA_PORT, *b, &mut mem);
        }
        tape.borrow_mut().detach_punch().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"PUNCH".to_vec());
        assert!(matches!(tape.borrow_mut().detach_punch(), Err(Error::NotAttached { .. })));
    }

    #[test]
    fn attach_missing_reader_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut tape = PaperTape::new();
        assert!(matches!(tape.attach_reader(&dir.path().join("none")), Err(Error::Open { .. })));
        assert!(tape.detach_reader().is_err());
    }
}
