pub mod frame;


use std::fs::OpenOptions;
use std::io::{self, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use log::{debug, error};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::{Error, Result};
use crate::io::BackingStore;
use crate::vm::memory::{WordMemory, CORE_ADDR_MASK, WORD_MASK};
use crate::vm::scheduler::EventQueue;

use self::frame::{Header, Packing, LENGTH_WORD};

pub const UNITS: usize = 8;
pub const DEFAULT_LATENCY: u64 = 10;

/// In-core word count register (two's complement).
pub const WC_ADDR: u32 = 0o32;
/// In-core memory address register, incremented before each transfer.
pub const MA_ADDR: u32 = 0o33;
const DBSIZE: u32 = 1 << 12;
const DBMASK: u32 = DBSIZE - 1;

// command/unit register fields
const CU_V_UNIT: u32 = 15;
const CU_M_UNIT: u32 = 0o7;
pub const CU_PARITY: u32 = 0o040000;
pub const CU_DUMP: u32 = 0o020000;
pub const CU_ERASE: u32 = 0o010000;
const CU_V_CMD: u32 = 9;
const CU_M_CMD: u32 = 0o7;
/// Set to hold off the interrupt request.
pub const CU_INTERRUPT_MASK: u32 = 0o000400;
const CU_V_TYPE: u32 = 6;
const CU_M_TYPE: u32 = 0o3;
pub const TYPE_9TRACK: u32 = 3;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u32 {
        const ERR = 0o400000;
        /// Rewinding.
        const REW = 0o200000;
        /// Beginning of tape.
        const BOT = 0o100000;
        /// Illegal command.
        const ILL = 0o040000;
        const PAR = 0o020000;
        const EOF = 0o010000;
        const EOT = 0o004000;
        /// Compare error.
        const CPE = 0o002000;
        /// Record length error.
        const RLE = 0o001000;
        /// Data late.
        const DLT = 0o000400;
        const BAD = 0o000200;
        const DON = 0o000100;

        /// Kept per unit.
        const DYN = Self::REW.bits() | Self::BOT.bits() | Self::EOF.bits() | Self::EOT.bits();
        const ERRORS = Self::BOT.bits() | Self::ILL.bits() | Self::PAR.bits() | Self::EOF.bits()
            | Self::EOT.bits() | Self::CPE.bits() | Self::RLE.bits() | Self::DLT.bits() | Self::BAD.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Function {
    Nop = 0,
    Rewind = 1,
    Read = 2,
    Compare = 3,
    Write = 4,
    WriteMark = 5,
    SpaceForward = 6,
    SpaceReverse = 7,
}

/// Build a command word for `unit`.
pub fn command_word(unit: usize, function: Function, drive_type: u32) -> u32 {
    ((unit as u32 & CU_M_UNIT) << CU_V_UNIT)
        | ((function as u32) << CU_V_CMD)
        | ((drive_type & CU_M_TYPE) << CU_V_TYPE)
}

/// IOT pulse result: the new AC and whether the next instruction is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iot {
    pub ac: u32,
    pub skip: bool,
}

impl Iot {
    fn value(ac: u32) -> Self {
        Self { ac, skip: false }
    }

    fn skip_if(cond: bool, ac: u32) -> Self {
        Self { ac, skip: cond }
    }
}

#[derive(Default)]
pub struct TapeUnit {
    store: Option<Box<dyn BackingStore>>,
    path: Option<PathBuf>,
    pos: u64,
    status: Status,
    pub write_locked: bool,
}

impl TapeUnit {
    pub fn is_attached(&self) -> bool {
        self.store.is_some()
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read(&mut self, compare: bool, packing: Packing, mem: &mut dyn WordMemory, flags: &mut Status) -> io::Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        store.seek(SeekFrom::Start(self.pos))?;
        let tbc = match frame::read_header(&mut **store) {
            Ok(Header::Record(len)) => len,
            Ok(Header::Mark) => {
                self.status = Status::EOF;
                *flags |= Status::RLE;
                self.pos += LENGTH_WORD;
                return Ok(());
            }
            Ok(Header::EndOfTape) => {
                self.status = Status::EOT;
                *flags |= Status::RLE;
                return Ok(());
            }
            Err(e) => {
                self.status = Status::EOT;
                *flags |= Status::RLE;
                return Err(e);
            }
        };

        let bpw = packing.bytes_per_word();
        let mut wc = DBSIZE - (mem.read_word(WC_ADDR) & DBMASK);
        let mut cbc = wc * bpw;
        if tbc != cbc {
            *flags |= Status::RLE;
        }
        if tbc < cbc {
            cbc = tbc;
            wc = tbc.div_ceil(bpw);
        }
        let (mut buf, err) = frame::read_payload(&mut **store, cbc as usize);
        buf.resize((wc * bpw) as usize, 0);

        for word in buf.chunks_exact(bpw as usize) {
            let ma = (mem.read_word(MA_ADDR) + 1) & WORD_MASK;
            mem.write_word(MA_ADDR, ma);
            let xma = ma & CORE_ADDR_MASK;
            let c = packing.decode(word);
            if compare {
                if c != mem.read_word(xma) & packing.word_mask() {
                    *flags |= Status::CPE;
                    break;
                }
            } else if mem.contains(xma) {
                mem.write_word(xma, c);
            }
            mem.write_word(WC_ADDR, (mem.read_word(WC_ADDR) + 1) & WORD_MASK);
        }
        self.pos += frame::record_span(tbc);
        err.map_or(Ok(()), Err)
    }

    fn write(&mut self, packing: Packing, mem: &mut dyn WordMemory) -> io::Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        let wc = DBSIZE - (mem.read_word(WC_ADDR) & DBMASK);
        let mut payload = Vec::with_capacity((wc * packing.bytes_per_word()) as usize);
        for _ in 0..wc {
            let ma = (mem.read_word(MA_ADDR) + 1) & WORD_MASK;
            mem.write_word(MA_ADDR, ma);
            packing.encode(mem.read_word(ma & CORE_ADDR_MASK), &mut payload);
            mem.write_word(WC_ADDR, (mem.read_word(WC_ADDR) + 1) & WORD_MASK);
        }
        let result = store
            .seek(SeekFrom::Start(self.pos))
            .and_then(|_| frame::write_record(&mut **store, &payload));
        self.pos += frame::record_span(payload.len() as u32);
        result
    }

    fn write_mark(&mut self) -> io::Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        let result = store
            .seek(SeekFrom::Start(self.pos))
            .and_then(|_| frame::write_mark(&mut **store));
        self.pos += LENGTH_WORD;
        self.status = Status::EOF;
        result
    }

    fn space_forward(&mut self, mem: &mut dyn WordMemory) -> io::Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        loop {
            store.seek(SeekFrom::Start(self.pos))?;
            match frame::read_header(&mut **store) {
                Ok(Header::Record(len)) => self.pos += frame::record_span(len),
                Ok(Header::Mark) => {
                    self.status = Status::EOF;
                    self.pos += LENGTH_WORD;
                    return Ok(());
                }
                Ok(Header::EndOfTape) => {
                    self.status = Status::EOT;
                    return Ok(());
                }
                Err(e) => {
                    self.status = Status::EOT;
                    return Err(e);
                }
            }
            let wc = (mem.read_word(WC_ADDR) + 1) & WORD_MASK;
            mem.write_word(WC_ADDR, wc);
            if wc == 0 {
                return Ok(());
            }
        }
    }

    fn space_reverse(&mut self, mem: &mut dyn WordMemory) -> io::Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        if self.pos == 0 {
            self.status = Status::BOT;
            return Ok(());
        }
        loop {
            let header = match self.pos.checked_sub(LENGTH_WORD) {
                Some(at) => store
                    .seek(SeekFrom::Start(at))
                    .and_then(|_| frame::read_header(&mut **store)),
                None => Ok(Header::EndOfTape),
            };
            match header {
                Ok(Header::Mark | Header::Record(0)) => {
                    self.status = Status::EOF;
                    self.pos -= LENGTH_WORD;
                    return Ok(());
                }
                Ok(Header::Record(len)) => {
                    self.pos = self.pos.saturating_sub(frame::record_span(len));
                    if self.pos == 0 {
                        self.status = Status::BOT;
                        return Ok(());
                    }
                }
                Ok(Header::EndOfTape) => {
                    self.status = Status::BOT;
                    self.pos = 0;
                    return Ok(());
                }
                Err(e) => {
                    self.status = Status::BOT;
                    self.pos = 0;
                    return Err(e);
                }
            }
            let wc = (mem.read_word(WC_ADDR) + 1) & WORD_MASK;
            mem.write_word(WC_ADDR, wc);
            if wc == 0 {
                return Ok(());
            }
        }
    }
}

/// Magnetic tape controller of the 18-bit machines, driven by IOT pulses.
pub struct TapeController {
    units: Vec<TapeUnit>,
    cu: u32,
    sta: Status,
    events: EventQueue,
    interrupt: bool,
    pub latency: u64,
    pub stop_on_error: bool,
}

impl TapeController {
    pub fn new() -> Self {
        Self {
            units: (0..UNITS).map(|_| TapeUnit::default()).collect(),
            cu: 0,
            sta: Status::empty(),
            events: EventQueue::new(),
            interrupt: false,
            latency: DEFAULT_LATENCY,
            stop_on_error: true,
        }
    }

    pub fn unit(&self, unit: usize) -> Option<&TapeUnit> {
        self.units.get(unit)
    }

    fn unit_mut(&mut self, unit: usize) -> Result<&mut TapeUnit> {
        self.units.get_mut(unit).ok_or(Error::NoSuchUnit { device: "MT", unit })
    }

    pub fn command(&self) -> u32 {
        self.cu
    }

    pub fn status(&self) -> Status {
        self.sta
    }

    pub fn interrupt_requested(&self) -> bool {
        self.interrupt
    }

    /// I/O status summary flag.
    pub fn iors(&self) -> bool {
        self.sta.intersects(Status::ERR | Status::DON)
    }

    fn selected_unit(&self) -> usize {
        ((self.cu >> CU_V_UNIT) & CU_M_UNIT) as usize
    }

    fn function(&self) -> Function {
        Function::from_u32((self.cu >> CU_V_CMD) & CU_M_CMD).unwrap_or(Function::Nop)
    }

    fn packing(&self) -> Packing {
        let drive_type = (self.cu >> CU_V_TYPE) & CU_M_TYPE;
        if self.cu & CU_DUMP != 0 || drive_type != TYPE_9TRACK {
            Packing::Packed
        } else {
            Packing::Unpacked
        }
    }

    pub fn is_active(&self, unit: usize) -> bool {
        self.events.is_active(unit)
    }

    /// First unit with a transfer in progress; rewinds do not count.
    pub fn busy(&self) -> Option<usize> {
        (0..UNITS).find(|&u| self.events.is_active(u) && !self.units[u].status.contains(Status::REW))
    }

    fn update_status(&mut self, unit: usize, new: Status) -> Status {
        self.sta = (self.sta - (Status::DYN | Status::ERR)) | (self.units[unit].status & Status::DYN) | new;
        if self.sta.intersects(Status::ERRORS) {
            self.sta |= Status::ERR;
        }
        self.interrupt = self.sta.intersects(Status::ERR | Status::DON) && self.cu & CU_INTERRUPT_MASK == 0;
        self.sta
    }

    pub fn iot(&mut self, pulse: u32, ac: u32) -> Iot {
        let unit = self.selected_unit();
        self.update_status(unit, Status::empty());
        match pulse {
            // MTTR
            0o001 => return Iot::skip_if(!self.events.is_active(unit), ac),
            // MTCR
            0o021 => return Iot::skip_if(self.busy().is_none(), ac),
            // MTSF
            0o041 => return Iot::skip_if(self.sta.intersects(Status::ERR | Status::DON), ac),
            // MTRC
            0o002 => return Iot::value(self.cu & 0o777700),
            // MTRS
            0o042 => return Iot::value(self.sta.bits()),
            _ => {}
        }
        // MTAF, MTLC
        if pulse & 0o62 == 0o22 {
            if self.busy().is_none() {
                self.cu = 0;
                self.sta = Status::empty();
            }
            self.sta -= Status::ERR | Status::DON;
        }
        // MTCM, MTLC
        if pulse & 0o64 == 0o24 {
            self.cu = (self.cu & 0o770700) | (ac & 0o777700);
        }
        // MTGO
        if pulse == 0o004 {
            self.go();
        }
        let unit = self.selected_unit();
        self.update_status(unit, Status::empty());
        Iot::value(ac)
    }

    fn go(&mut self) {
        let u = self.selected_unit();
        let f = self.function();
        let unit = &self.units[u];
        let illegal = self.busy().is_some()
            || self.events.is_active(u)
            || (matches!(f, Function::SpaceReverse | Function::Rewind) && unit.pos == 0)
            || (matches!(f, Function::Write | Function::WriteMark) && unit.write_locked)
            || !unit.is_attached()
            || f == Function::Nop;
        if illegal {
            debug!("MT{}: illegal {:?}", u, f);
            self.sta |= Status::ILL;
            return;
        }
        if f == Function::Rewind {
            self.units[u].status = Status::REW;
        } else {
            self.units[u].status = Status::empty();
            self.sta = Status::empty();
        }
        self.events.activate(u, self.latency);
    }

    /// Advance simulated time and complete every unit that became due.
    pub fn tick(&mut self, ticks: u64, mem: &mut dyn WordMemory) -> Result<()> {
        self.events.advance(ticks);
        while let Some(unit) = self.events.next_due() {
            self.service(unit, mem)?;
        }
        Ok(())
    }

    /// Complete the scheduled operation on `u`.
    pub fn service(&mut self, u: usize, mem: &mut dyn WordMemory) -> Result<()> {
        if self.units[u].status.contains(Status::REW) {
            let unit = &mut self.units[u];
            unit.pos = 0;
            unit.status = if unit.is_attached() { Status::BOT } else { Status::empty() };
            if u == self.selected_unit() {
                self.update_status(u, Status::DON);
            }
            return Ok(());
        }

        let f = self.function();
        if !self.units[u].is_attached() {
            self.update_status(u, Status::ILL);
            return if self.stop_on_error {
                Err(Error::NotAttached { device: "MT", unit: u })
            } else {
                Ok(())
            };
        }
        if matches!(f, Function::Write | Function::WriteMark) {
            if self.units[u].write_locked {
                self.update_status(u, Status::ILL);
                return Ok(());
            }
            self.cu &= !CU_ERASE;
        }

        let packing = self.packing();
        let mut flags = Status::empty();
        let unit = &mut self.units[u];
        let result = match f {
            Function::Read => unit.read(false, packing, mem, &mut flags),
            Function::Compare => unit.read(true, packing, mem, &mut flags),
            Function::Write => unit.write(packing, mem),
            Function::WriteMark => unit.write_mark(),
            Function::SpaceForward => unit.space_forward(mem),
            Function::SpaceReverse => unit.space_reverse(mem),
            Function::Nop | Function::Rewind => Ok(()),
        };
        debug!("MT{}: {:?} done, pos={} status={:?}", u, f, unit.pos, unit.status);

        let outcome = match result {
            Ok(()) => Ok(()),
            Err(e) => {
                flags |= Status::PAR;
                error!("MT{} I/O error: {}", u, e);
                if self.stop_on_error {
                    Err(Error::Io(e))
                } else {
                    Ok(())
                }
            }
        };
        self.update_status(u, flags | Status::DON);
        outcome
    }

    pub fn reset(&mut self) {
        self.cu = 0;
        self.sta = Status::empty();
        for u in 0..UNITS {
            self.events.cancel(u);
            let unit = &mut self.units[u];
            unit.status = if unit.is_attached() { Status::BOT } else { Status::empty() };
        }
        self.update_status(0, Status::empty());
    }

    pub fn attach(&mut self, unit: usize, path: &Path, read_only: bool) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)
            .map_err(|source| Error::Open { path: path.to_path_buf(), source })?;
        self.attach_store(unit, Box::new(file))?;
        let u = self.unit_mut(unit)?;
        u.path = Some(path.to_path_buf());
        u.write_locked |= read_only;
        Ok(())
    }

    /// Mount a tape at its load point.
    pub fn attach_store(&mut self, unit: usize, store: Box<dyn BackingStore>) -> Result<()> {
        let u = self.unit_mut(unit)?;
        u.store = Some(store);
        u.path = None;
        u.pos = 0;
        u.status = Status::BOT;
        let selected = self.selected_unit();
        self.update_status(selected, Status::empty());
        Ok(())
    }

    pub fn detach(&mut self, unit: usize) -> Result<()> {
        let active = self.events.is_active(unit);
        let u = self.unit_mut(unit)?;
        let Some(mut store) = u.store.take() else {
            return Err(Error::NotAttached { device: "MT", unit });
        };
        if !active {
            u.status = Status::empty();
        }
        u.path = None;
        let selected = self.selected_unit();
        self.update_status(selected, Status::empty());
        store.flush()?;
        Ok(())
    }

    pub fn set_write_lock(&mut self, unit: usize, locked: bool) -> Result<()> {
        self.unit_mut(unit)?.write_locked = locked;
        Ok(())
    }
}

impl Default for TapeController {
    fn default() -> Self {
        Self::new()
    }
}
