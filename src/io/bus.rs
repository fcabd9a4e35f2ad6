use std::cell::RefCell;
use std::rc::Rc;

use log::warn;

use crate::utils::number::WarnBudget;
use crate::vm::memory::Memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

pub trait IoDevice {
    fn port_in_byte(&mut self, port: u8, mem: &mut dyn Memory) -> u8;
    fn port_out_byte(&mut self, port: u8, value: u8, mem: &mut dyn Memory);

    fn name(&self) -> &'static str;
}

/// Devices shared with the runtime (for polling, attach, reset) are
/// registered through their `Rc<RefCell<_>>` handle.
impl<T: IoDevice> IoDevice for Rc<RefCell<T>> {
    fn port_in_byte(&mut self, port: u8, mem: &mut dyn Memory) -> u8 {
        self.borrow_mut().port_in_byte(port, mem)
    }

    fn port_out_byte(&mut self, port: u8, value: u8, mem: &mut dyn Memory) {
        self.borrow_mut().port_out_byte(port, value, mem)
    }

    fn name(&self) -> &'static str {
        self.borrow().name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(usize);

/// Default warning budget for accesses to unassigned ports.
pub const WARN_LEVEL: u32 = 3;

pub struct IoBus {
    devices: Vec<Box<dyn IoDevice>>,
    table: [Option<DeviceId>; 256],
    unassigned: Option<WarnBudget>,
}

impl IoBus {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            table: [None; 256],
            unassigned: None,
        }
    }

    /// Log accesses to unbound ports, at most `limit` times.
    pub fn warn_unassigned(&mut self, limit: u32) {
        self.unassigned = Some(WarnBudget::new(limit));
    }

    pub fn reset_warnings(&mut self) {
        if let Some(budget) = self.unassigned.as_mut() {
            budget.reset();
        }
    }

    pub fn register(&mut self, device: Box<dyn IoDevice>) -> DeviceId {
        let id = DeviceId(self.devices.len());
        self.devices.push(device);
        id
    }

    /// Route `port` to `id`, replacing whatever was bound there.
    pub fn bind(&mut self, port: u8, id: DeviceId) {
        if let Some(old) = self.table[port as usize] {
            if old != id {
                log::debug!(
                    "port {:02X}: {} -> {}",
                    port,
                    self.devices[old.0].name(),
                    self.devices[id.0].name()
                );
            }
        }
        self.table[port as usize] = Some(id);
    }

    pub fn unbind(&mut self, port: u8) {
        self.table[port as usize] = None;
    }

    pub fn register_range(&mut self, start: u8, end: u8, device: Box<dyn IoDevice>) -> DeviceId {
        let id = self.register(device);
        for port in start..=end {
            self.bind(port, id);
        }
        id
    }

    pub fn binding(&self, port: u8) -> Option<&'static str> {
        self.table[port as usize].map(|id| self.devices[id.0].name())
    }

    pub fn io(&mut self, port: u8, direction: Direction, data: u8, mem: &mut dyn Memory) -> u8 {
        match direction {
            Direction::In => self.port_in_byte(port, mem),
            Direction::Out => {
                self.port_out_byte(port, data, mem);
                0
            }
        }
    }

    pub fn port_in_byte(&mut self, port: u8, mem: &mut dyn Memory) -> u8 {
        match self.table[port as usize] {
            Some(DeviceId(idx)) => self.devices[idx].port_in_byte(port, mem),
            None => {
                if self.unassigned.as_mut().is_some_and(|b| b.allow()) {
                    warn!("Attempt to input from unassigned port {:02X} - ignored", port);
                }
                0xFF
            }
        }
    }

    pub fn port_out_byte(&mut self, port: u8, value: u8, mem: &mut dyn Memory) {
        match self.table[port as usize] {
            Some(DeviceId(idx)) => self.devices[idx].port_out_byte(port, value, mem),
            None => {
                if self.unassigned.as_mut().is_some_and(|b| b.allow()) {
                    warn!(
                        "Attempt to output {:02X} to unassigned port {:02X} - ignored",
                        value, port
                    );
                }
            }
        }
    }
}

impl Default for IoBus {
    fn default() -> Self {
        Self::new()
    }
}
