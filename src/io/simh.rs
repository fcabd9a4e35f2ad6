//! Host bridge pseudo device on port 0xFE. Guest programs use it for the
//! real-time clock, bank switching, paper tape attach, timers and host file
//! name expansion.
//!
//! A command byte is written first. Commands that take parameters expect
//! the parameter bytes as further writes; commands that return data are
//! followed by reads. Guests must send and read every byte, there is no
//! resynchronisation besides the interface reset command.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use log::{debug, info, warn};
use num_derive::FromPrimitive;

use crate::error::Result;
use crate::io::bus::IoDevice;
use crate::io::ptr::PaperTape;
use crate::io::sequencer::Sequencer;
use crate::utils::number::{from_bcd, high_byte, low_byte, to_bcd};
use crate::vm::memory::{Memory, MAX_BANKS};

pub const SIMH_PORT: u8 = 0xFE;
pub const VERSION: &[u8] = b"SIMH003\0";

const TIMER_STACK_LIMIT: usize = 10;
pub const DEFAULT_TIMER_DELTA: u16 = 100;
pub const DEFAULT_TIMER_HANDLER: u16 = 0xFC00;
const BANK_MASK: u8 = MAX_BANKS - 1;

const CPM_COMMAND_LINE: u16 = 0x80;
const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SimhCommand {
    PrintTime = 0,
    StartTimer = 1,
    StopTimer = 2,
    ResetPtr = 3,
    AttachPtr = 4,
    DetachPtr = 5,
    Version = 6,
    GetZsdosClock = 7,
    SetZsdosClock = 8,
    GetCpm3Clock = 9,
    SetCpm3Clock = 10,
    GetBank = 11,
    SetBank = 12,
    GetCommon = 13,
    ResetInterface = 14,
    ShowTimer = 15,
    AttachPtp = 16,
    DetachPtp = 17,
    HasBankedMemory = 18,
    SetZ80 = 19,
    Set8080 = 20,
    StartTimerInterrupts = 21,
    StopTimerInterrupts = 22,
    SetTimerDelta = 23,
    SetTimerHandler = 24,
    ResetStopWatch = 25,
    ReadStopWatch = 26,
    Sleep = 27,
    PathSeparator = 28,
    HostFilenames = 29,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuKind {
    Z80,
    I8080,
}

/// Wall clock and millisecond counter of the host.
pub trait Clock {
    /// Local date and time.
    fn now(&self) -> NaiveDateTime;
    /// Milliseconds since an arbitrary fixed point.
    fn millis(&self) -> u64;
    fn sleep(&self, micros: u64);
}

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn sleep(&self, micros: u64) {
        thread::sleep(Duration::from_micros(micros));
    }
}

/// Wildcard expansion of host file names.
pub trait DirectoryLister {
    fn expand(&self, pattern: &str) -> Result<Vec<String>>;
}

pub struct GlobLister;

impl DirectoryLister for GlobLister {
    fn expand(&self, pattern: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in glob::glob(pattern)? {
            match entry {
                Ok(path) => names.push(path.display().to_string()),
                Err(e) => debug!("SIMH: skipping unreadable entry: {}", e),
            }
        }
        Ok(names)
    }
}

/// Expanded file names being streamed to the guest, NUL terminated.
struct NameStream {
    names: Vec<Vec<u8>>,
    index: usize,
    pos: usize,
}

fn cpm3_origin() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1977, 12, 31)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

pub struct Simh {
    seq: Sequencer<SimhCommand>,
    clock: Box<dyn Clock>,
    lister: Box<dyn DirectoryLister>,
    tape: Rc<RefCell<PaperTape>>,
    pub verbose: bool,
    pub sleep_micros: u64,
    cpu: CpuKind,
    /// Clock value captured by the last get-clock command.
    current_time: Option<NaiveDateTime>,
    cpm3_days: u16,
    zsdos_delta: TimeDelta,
    cpm3_delta: TimeDelta,
    /// Two-byte parameter being assembled, low byte first.
    word: u16,
    timers: Vec<u64>,
    timer_on: bool,
    timer_interrupt: bool,
    next_interrupt: u64,
    pub timer_delta: u16,
    pub timer_handler: u16,
    stop_watch_start: u64,
    stop_watch_delta: u16,
    last_cpm_status: u8,
    filenames: Option<NameStream>,
}

impl Simh {
    pub fn new(clock: Box<dyn Clock>, lister: Box<dyn DirectoryLister>, tape: Rc<RefCell<PaperTape>>) -> Self {
        Self {
            seq: Sequencer::new(),
            clock,
            lister,
            tape,
            verbose: false,
            sleep_micros: 0,
            cpu: CpuKind::Z80,
            current_time: None,
            cpm3_days: 0,
            zsdos_delta: TimeDelta::zero(),
            cpm3_delta: TimeDelta::zero(),
            word: 0,
            timers: Vec::with_capacity(TIMER_STACK_LIMIT),
            timer_on: false,
            timer_interrupt: false,
            next_interrupt: 0,
            timer_delta: DEFAULT_TIMER_DELTA,
            timer_handler: DEFAULT_TIMER_HANDLER,
            stop_watch_start: 0,
            stop_watch_delta: 0,
            last_cpm_status: 0,
            filenames: None,
        }
    }

    pub fn cpu(&self) -> CpuKind {
        self.cpu
    }

    pub fn command(&self) -> Option<SimhCommand> {
        self.seq.command()
    }

    pub fn reset(&mut self) {
        self.seq.finish();
        self.current_time = None;
        self.zsdos_delta = TimeDelta::zero();
        self.cpm3_delta = TimeDelta::zero();
        self.timers.clear();
        self.last_cpm_status = 0;
        self.timer_interrupt = false;
        if self.timer_on {
            self.start_timer_interrupts();
        }
    }

    pub fn timer_interrupts_enabled(&self) -> bool {
        self.timer_on
    }

    pub fn start_timer_interrupts(&mut self) {
        self.timer_on = true;
        self.timer_interrupt = false;
        self.next_interrupt = self.clock.millis() + self.timer_delta as u64;
    }

    pub fn stop_timer_interrupts(&mut self) {
        self.timer_on = false;
        self.timer_interrupt = false;
    }

    /// Raise the timer interrupt once its period has elapsed.
    pub fn poll_timer(&mut self) {
        if !self.timer_on {
            return;
        }
        let now = self.clock.millis();
        if now >= self.next_interrupt {
            self.timer_interrupt = true;
            self.next_interrupt += self.timer_delta as u64;
            if now >= self.next_interrupt {
                self.next_interrupt = now + self.timer_delta as u64;
            }
        }
    }

    /// Address of the interrupt handler if a timer interrupt is pending.
    pub fn take_timer_interrupt(&mut self) -> Option<u16> {
        std::mem::take(&mut self.timer_interrupt).then_some(self.timer_handler)
    }

    /// Idle the host for the configured time.
    pub fn sleep(&self) {
        if self.sleep_micros > 0 {
            self.clock.sleep(self.sleep_micros);
        }
    }

    fn command_line(mem: &dyn Memory) -> String {
        let len = (mem.read_byte(CPM_COMMAND_LINE) & 0x7F) as u16;
        // the first character, normally a blank, is dropped
        let bytes: Vec<u8> = (0..len.saturating_sub(1)).map(|i| mem.read_byte(CPM_COMMAND_LINE + 2 + i)).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn attach_tape(&mut self, punch: bool, mem: &dyn Memory) {
        let name = Self::command_line(mem);
        let mut tape = self.tape.borrow_mut();
        let result = if punch {
            tape.attach_punch(Path::new(&name))
        } else {
            tape.attach_reader(Path::new(&name))
        };
        self.last_cpm_status = match result {
            Ok(()) => 0,
            Err(e) => {
                if self.verbose {
                    warn!("Cannot open '{}' ({}).", name, e);
                }
                1
            }
        };
    }

    fn set_zsdos_clock(&mut self, addr: u16, mem: &dyn Memory) {
        let field = |i: u16| from_bcd(mem.read_byte(addr.wrapping_add(i))) as u32;
        let year = field(0) as i32;
        let year = if year < 50 { 2000 + year } else { 1900 + year };
        let time = NaiveDate::from_ymd_opt(year, field(1), field(2)).and_then(|d| d.and_hms_opt(field(3), field(4), field(5)));
        match time {
            Some(time) => self.zsdos_delta = time - self.clock.now(),
            None => warn!("SIMH: ignoring invalid ZSDOS date at {:04X}h", addr),
        }
    }

    fn set_cpm3_clock(&mut self, addr: u16, mem: &dyn Memory) {
        let byte = |i: u16| mem.read_byte(addr.wrapping_add(i));
        let days = byte(0) as i64 + byte(1) as i64 * 256;
        let secs = days * SECONDS_PER_DAY
            + from_bcd(byte(2)) as i64 * 3600
            + from_bcd(byte(3)) as i64 * 60
            + from_bcd(byte(4)) as i64;
        self.cpm3_delta = (cpm3_origin() + TimeDelta::seconds(secs)) - self.clock.now();
    }

    fn capture_zsdos_time(&mut self) {
        self.current_time = Some(self.clock.now() + self.zsdos_delta);
    }

    fn capture_cpm3_time(&mut self) {
        let now = self.clock.now() + self.cpm3_delta;
        self.current_time = Some(now);
        self.cpm3_days = ((now - cpm3_origin()).num_seconds() / SECONDS_PER_DAY) as u16;
    }

    fn start_filenames(&mut self, mem: &dyn Memory) {
        if self.filenames.is_some() {
            return;
        }
        let pattern = Self::command_line(mem);
        match self.lister.expand(&pattern) {
            Ok(names) => {
                self.filenames = Some(NameStream {
                    names: names.into_iter().map(String::into_bytes).collect(),
                    index: 0,
                    pos: 0,
                })
            }
            Err(e) => {
                if self.verbose {
                    warn!("Cannot expand '{}'. Error is {}.", pattern, e);
                }
            }
        }
    }

    fn next_filename_byte(&mut self) -> u8 {
        let Some(stream) = self.filenames.as_mut() else {
            self.seq.finish();
            return 0;
        };
        match stream.names.get(stream.index) {
            Some(name) => match name.get(stream.pos) {
                Some(&b) => {
                    stream.pos += 1;
                    b
                }
                None => {
                    stream.index += 1;
                    stream.pos = 0;
                    0
                }
            },
            None => {
                self.filenames = None;
                self.seq.finish();
                0
            }
        }
    }

    fn elapsed(&self, since: u64) -> u64 {
        self.clock.millis().saturating_sub(since)
    }

    /// Start the command in `byte`.
    fn begin(&mut self, byte: u8, mem: &mut dyn Memory) {
        let Some(cmd) = self.seq.begin(byte) else {
            if self.verbose {
                warn!("Unknown command ({}) to SIMH pseudo device on port {:03x}h ignored.", byte, SIMH_PORT);
            }
            return;
        };
        debug!("SIMH: {:?}", cmd);
        match cmd {
            SimhCommand::HostFilenames => self.start_filenames(mem),
            SimhCommand::Sleep => self.sleep(),
            SimhCommand::PrintTime => info!("Current time in milliseconds = {}.", self.clock.millis()),
            SimhCommand::StartTimer => {
                if self.timers.len() < TIMER_STACK_LIMIT {
                    self.timers.push(self.clock.millis());
                } else {
                    info!("Timer stack overflow.");
                }
            }
            SimhCommand::StopTimer => match self.timers.pop() {
                Some(mark) => info!("Timer stopped. Elapsed time in milliseconds = {}.", self.elapsed(mark)),
                None => info!("No timer active."),
            },
            SimhCommand::ShowTimer => match self.timers.last() {
                Some(&mark) => info!("Timer running. Elapsed in milliseconds = {}.", self.elapsed(mark)),
                None => info!("No timer active."),
            },
            SimhCommand::ResetPtr => self.tape.borrow_mut().reset(),
            SimhCommand::AttachPtr => self.attach_tape(false, mem),
            SimhCommand::AttachPtp => self.attach_tape(true, mem),
            SimhCommand::DetachPtr => {
                let _ = self.tape.borrow_mut().detach_reader();
            }
            SimhCommand::DetachPtp => {
                let _ = self.tape.borrow_mut().detach_punch();
            }
            SimhCommand::GetZsdosClock => self.capture_zsdos_time(),
            SimhCommand::GetCpm3Clock => self.capture_cpm3_time(),
            SimhCommand::ResetInterface => {
                self.timers.clear();
                self.filenames = None;
                self.seq.finish();
            }
            SimhCommand::SetZ80 => self.cpu = CpuKind::Z80,
            SimhCommand::Set8080 => self.cpu = CpuKind::I8080,
            SimhCommand::StartTimerInterrupts => self.start_timer_interrupts(),
            SimhCommand::StopTimerInterrupts => self.stop_timer_interrupts(),
            SimhCommand::ResetStopWatch => self.stop_watch_start = self.clock.millis(),
            SimhCommand::ReadStopWatch => self.stop_watch_delta = self.elapsed(self.stop_watch_start) as u16,
            SimhCommand::Version
            | SimhCommand::SetZsdosClock
            | SimhCommand::SetCpm3Clock
            | SimhCommand::GetBank
            | SimhCommand::SetBank
            | SimhCommand::GetCommon
            | SimhCommand::HasBankedMemory
            | SimhCommand::SetTimerDelta
            | SimhCommand::SetTimerHandler
            | SimhCommand::PathSeparator => {}
        }
    }

    /// Parameter byte for a setter command.
    fn parameter(&mut self, cmd: SimhCommand, data: u8, mem: &mut dyn Memory) {
        if cmd == SimhCommand::SetBank {
            if mem.banks() > 0 {
                mem.select_bank(data & BANK_MASK);
            } else if self.verbose {
                warn!("Set selected bank to {} ignored for non-banked memory.", data & 3);
            }
            self.seq.finish();
            return;
        }
        if self.seq.accept_param() == 0 {
            self.word = data as u16;
            return;
        }
        self.word |= (data as u16) << 8;
        let word = self.word;
        match cmd {
            SimhCommand::SetZsdosClock => self.set_zsdos_clock(word, mem),
            SimhCommand::SetCpm3Clock => self.set_cpm3_clock(word, mem),
            SimhCommand::SetTimerDelta => self.timer_delta = word,
            SimhCommand::SetTimerHandler => self.timer_handler = word,
            _ => {}
        }
        self.seq.finish();
    }

    /// Result byte at the cursor; the command ends after the final byte.
    fn result(&mut self, bytes: &[u8]) -> u8 {
        let index = self.seq.next_result();
        let byte = bytes.get(index).copied().unwrap_or(0);
        if index + 1 >= bytes.len() {
            self.seq.finish();
        }
        byte
    }

    fn clock_bytes(&self, cmd: SimhCommand) -> Option<Vec<u8>> {
        let time = self.current_time?;
        let bcd = |v: u32| to_bcd(v as u8);
        Some(match cmd {
            SimhCommand::GetZsdosClock => vec![
                bcd(time.year().rem_euclid(100) as u32),
                bcd(time.month()),
                bcd(time.day()),
                bcd(time.hour()),
                bcd(time.minute()),
                bcd(time.second()),
            ],
            _ => vec![
                low_byte(self.cpm3_days),
                high_byte(self.cpm3_days),
                bcd(time.hour()),
                bcd(time.minute()),
                bcd(time.second()),
            ],
        })
    }
}

impl IoDevice for Simh {
    fn port_in_byte(&mut self, port: u8, mem: &mut dyn Memory) -> u8 {
        match self.seq.command() {
            Some(SimhCommand::HostFilenames) => self.next_filename_byte(),
            Some(SimhCommand::AttachPtr | SimhCommand::AttachPtp) => {
                self.seq.finish();
                self.last_cpm_status
            }
            Some(cmd @ (SimhCommand::GetZsdosClock | SimhCommand::GetCpm3Clock)) => match self.clock_bytes(cmd) {
                Some(bytes) => self.result(&bytes),
                None => {
                    self.seq.finish();
                    0
                }
            },
            Some(SimhCommand::Version) => self.result(VERSION),
            Some(SimhCommand::GetBank) => {
                self.seq.finish();
                if mem.banks() > 0 {
                    mem.bank()
                } else {
                    if self.verbose {
                        warn!("Get selected bank ignored for non-banked memory.");
                    }
                    0
                }
            }
            Some(SimhCommand::GetCommon) => {
                let common = mem.common_base();
                self.result(&[low_byte(common), high_byte(common)])
            }
            Some(SimhCommand::HasBankedMemory) => {
                self.seq.finish();
                if mem.banks() > 0 {
                    MAX_BANKS
                } else {
                    0
                }
            }
            Some(SimhCommand::ReadStopWatch) => {
                let delta = self.stop_watch_delta;
                self.result(&[low_byte(delta), high_byte(delta)])
            }
            Some(SimhCommand::PathSeparator) => std::path::MAIN_SEPARATOR as u8,
            _ => {
                if self.verbose {
                    warn!("Undefined IN from SIMH pseudo device on port {:03x}h ignored.", port);
                }
                self.seq.finish();
                0
            }
        }
    }

    fn port_out_byte(&mut self, _port: u8, value: u8, mem: &mut dyn Memory) {
        match self.seq.command() {
            Some(
                cmd @ (SimhCommand::SetZsdosClock
                | SimhCommand::SetCpm3Clock
                | SimhCommand::SetBank
                | SimhCommand::SetTimerDelta
                | SimhCommand::SetTimerHandler),
            ) => self.parameter(cmd, value, mem),
            _ => self.begin(value, mem),
        }
    }

    fn name(&self) -> &'static str {
        "SIMH"
    }
}
