use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::config::MachineConfig;
use crate::error::Result;
use crate::io::bus::{DeviceId, IoBus};
use crate::io::hdsk::{HardDisk, HDSK_PORT};
use crate::io::ptr::{PaperTape, PaperTapePorts, PTR_DATA_PORT, PTR_STATUS_PORT};
use crate::io::sense::{SenseSwitches, SENSE_PORT};
use crate::io::simh::{GlobLister, Simh, SystemClock, SIMH_PORT};
use crate::io::sio::{Console, PortMapping, Sio};
use crate::io::tape::TapeController;
use crate::io::telnet::Multiplexor;
use crate::vm::memory::{CoreMemory, FlatMemory, DEFAULT_COMMON, MAX_CORE};

/// Console line driven by the loopback monitor in `run`.
const MONITOR_STATUS: u8 = 0x10;
const MONITOR_DATA: u8 = 0x11;

/// The 8-bit machine's port map with every peripheral wired in, plus the
/// tape channel of the 18-bit machines on its own core.
pub struct Machine {
    memory: FlatMemory,
    bus: IoBus,
    hdsk: Rc<RefCell<HardDisk>>,
    sio: Rc<RefCell<Sio>>,
    sio_id: DeviceId,
    mux: Option<Rc<RefCell<Multiplexor>>>,
    paper_tape: Rc<RefCell<PaperTape>>,
    simh: Rc<RefCell<Simh>>,
    sense: Rc<RefCell<SenseSwitches>>,
    tape: TapeController,
    core: CoreMemory,
    pub ticks: u64,
}

impl Machine {
    pub fn new(console: Box<dyn Console>) -> Self {
        Self::with_memory(FlatMemory::new(), console, MAX_CORE)
    }

    fn with_memory(memory: FlatMemory, console: Box<dyn Console>, core_words: u32) -> Self {
        let mut bus = IoBus::new();

        let hdsk = Rc::new(RefCell::new(HardDisk::new()));
        let sio = Rc::new(RefCell::new(Sio::new(console)));
        let paper_tape = PaperTape::shared();
        let simh = Rc::new(RefCell::new(Simh::new(
            Box::new(SystemClock::new()),
            Box::new(GlobLister),
            Rc::clone(&paper_tape),
        )));
        let sense = Rc::new(RefCell::new(SenseSwitches::new(0)));

        let id = bus.register(Box::new(Rc::clone(&hdsk)));
        bus.bind(HDSK_PORT, id);
        let sio_id = bus.register(Box::new(Rc::clone(&sio)));
        for entry in sio.borrow().ports() {
            bus.bind(entry.port, sio_id);
        }
        bus.register_range(PTR_STATUS_PORT, PTR_DATA_PORT, Box::new(PaperTapePorts::new(Rc::clone(&paper_tape))));
        let id = bus.register(Box::new(Rc::clone(&simh)));
        bus.bind(SIMH_PORT, id);
        let id = bus.register(Box::new(Rc::clone(&sense)));
        bus.bind(SENSE_PORT, id);

        Self {
            memory,
            bus,
            hdsk,
            sio,
            sio_id,
            mux: None,
            paper_tape,
            simh,
            sense,
            tape: TapeController::new(),
            core: CoreMemory::new(core_words),
            ticks: 0,
        }
    }

    pub fn from_config(config: &MachineConfig, console: Box<dyn Console>) -> Result<Self> {
        let memory = if config.memory.banks > 0 {
            FlatMemory::banked(config.memory.banks, config.memory.common.unwrap_or(DEFAULT_COMMON))
        } else {
            FlatMemory::new()
        };
        let mut machine = Self::with_memory(memory, console, config.tape.core_words);

        if let Some(limit) = config.warn_unassigned {
            machine.bus.warn_unassigned(limit);
        }

        {
            let mut hdsk = machine.hdsk.borrow_mut();
            for disk in &config.disks {
                hdsk.attach(disk.unit, &disk.path, disk.read_only)?;
                if let Some(name) = &disk.format {
                    hdsk.set_format(disk.unit, name)?;
                }
                if let Some(g) = disk.geometry {
                    hdsk.set_geometry(disk.unit, g.tracks, g.sectors_per_track, g.sector_size)?;
                }
                if disk.write_locked {
                    hdsk.set_write_lock(disk.unit, true)?;
                }
                hdsk.set_verbose(disk.unit, disk.verbose)?;
            }
        }

        {
            let mut sio = machine.sio.borrow_mut();
            sio.options = config.console.options;
            if let Some(path) = &config.console.input_file {
                sio.attach_file(path)?;
            }
        }
        if let Some(port) = config.console.telnet_port {
            let mut mux = Multiplexor::new(config.console.lines, &config.console.name);
            mux.open(port)?;
            let mux = Rc::new(RefCell::new(mux));
            machine.sio.borrow_mut().attach_telnet(Rc::clone(&mux));
            machine.mux = Some(mux);
        }
        for mapping in &config.console.ports {
            machine.map_port(mapping.parse()?)?;
        }

        {
            let mut tape = machine.paper_tape.borrow_mut();
            tape.verbose = config.paper_tape.verbose;
            if let Some(path) = &config.paper_tape.reader {
                tape.attach_reader(path)?;
            }
            if let Some(path) = &config.paper_tape.punch {
                tape.attach_punch(path)?;
            }
        }

        {
            let mut simh = machine.simh.borrow_mut();
            simh.verbose = config.simh.verbose;
            simh.sleep_micros = config.simh.sleep_micros;
            simh.timer_delta = config.simh.timer_delta;
            simh.timer_handler = config.simh.timer_handler;
        }

        machine.sense.borrow_mut().set(config.sense_switches);

        machine.tape.latency = config.tape.latency;
        machine.tape.stop_on_error = config.tape.stop_on_error;
        for unit in &config.tape.units {
            machine.tape.attach(unit.unit, &unit.path, unit.read_only)?;
            if unit.write_locked {
                machine.tape.set_write_lock(unit.unit, true)?;
            }
        }

        Ok(machine)
    }

    /// Apply a console port table edit and rebind the dispatcher.
    pub fn map_port(&mut self, mapping: PortMapping) -> Result<()> {
        match mapping {
            PortMapping::Set(entry) => {
                self.sio.borrow_mut().set_port(entry);
                self.bus.bind(entry.port, self.sio_id);
            }
            PortMapping::Remove(port) => {
                self.sio.borrow_mut().remove_port(port)?;
                self.bus.unbind(port);
            }
        }
        Ok(())
    }

    pub fn port_in(&mut self, port: u8) -> u8 {
        self.bus.port_in_byte(port, &mut self.memory)
    }

    pub fn port_out(&mut self, port: u8, value: u8) {
        self.bus.port_out_byte(port, value, &mut self.memory)
    }

    /// One poll cycle: network traffic, scheduled tape work, the host timer.
    pub fn tick(&mut self) -> Result<()> {
        self.ticks += 1;
        self.sio.borrow_mut().poll_connection();
        self.tape.tick(1, &mut self.core)?;
        self.simh.borrow_mut().poll_timer();
        Ok(())
    }

    /// Handler address of a pending host timer interrupt.
    pub fn timer_interrupt(&mut self) -> Option<u16> {
        self.simh.borrow_mut().take_timer_interrupt()
    }

    pub fn stop_requested(&mut self) -> bool {
        self.sio.borrow_mut().take_stop()
    }

    pub fn reset(&mut self) {
        self.hdsk.borrow_mut().reset();
        self.sio.borrow_mut().reset();
        self.paper_tape.borrow_mut().reset();
        self.simh.borrow_mut().reset();
        self.tape.reset();
        self.bus.reset_warnings();
    }

    /// Load the hard disk boot loader; returns its start address.
    pub fn boot(&mut self) -> Result<u16> {
        self.hdsk.borrow().boot(&mut self.memory)
    }

    pub fn bus(&self) -> &IoBus {
        &self.bus
    }

    pub fn memory(&self) -> &FlatMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut FlatMemory {
        &mut self.memory
    }

    pub fn hdsk(&self) -> &Rc<RefCell<HardDisk>> {
        &self.hdsk
    }

    pub fn sio(&self) -> &Rc<RefCell<Sio>> {
        &self.sio
    }

    pub fn simh(&self) -> &Rc<RefCell<Simh>> {
        &self.simh
    }

    pub fn paper_tape(&self) -> &Rc<RefCell<PaperTape>> {
        &self.paper_tape
    }

    pub fn multiplexor(&self) -> Option<&Rc<RefCell<Multiplexor>>> {
        self.mux.as_ref()
    }

    pub fn tape(&self) -> &TapeController {
        &self.tape
    }

    pub fn tape_mut(&mut self) -> &mut TapeController {
        &mut self.tape
    }

    pub fn core_mut(&mut self) -> &mut CoreMemory {
        &mut self.core
    }

    /// Serve the devices with a loopback monitor echoing console line 0,
    /// until the stop key is typed.
    pub fn run(&mut self, period: Duration) -> Result<()> {
        let local = self.mux.is_none();
        if local {
            let _ = crossterm::terminal::enable_raw_mode();
        }
        let can_read = self.sio.borrow().port(MONITOR_STATUS).map_or(0, |e| e.can_read);
        debug!("Serving devices, tick period {:?}", period);

        let result = loop {
            if let Err(e) = self.tick() {
                break Err(e);
            }
            if let Some(handler) = self.timer_interrupt() {
                debug!("Timer interrupt to {:04X}h", handler);
            }
            if self.port_in(MONITOR_STATUS) & can_read != 0 {
                let ch = self.port_in(MONITOR_DATA);
                self.port_out(MONITOR_DATA, ch);
            }
            if self.stop_requested() {
                break Ok(());
            }
            thread::sleep(period);
        };

        if local {
            let _ = crossterm::terminal::disable_raw_mode();
            let _ = std::io::stdout().flush();
        }
        if let Some(mux) = &self.mux {
            for line in mux.borrow().statistics() {
                info!("{}", line);
            }
            mux.borrow_mut().close();
        }
        info!("Stopped after {} ticks", self.ticks);
        result
    }
}
