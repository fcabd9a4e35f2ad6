use crate::io::bus::IoDevice;
use crate::vm::memory::Memory;

pub const SENSE_PORT: u8 = 0xFF;

/// Front panel sense switches (port 0xFF)
///
/// Reads return the switch register; writes drive the panel lamps, which
/// nothing here displays.
pub struct SenseSwitches {
    switches: u8,
}

impl SenseSwitches {
    pub fn new(switches: u8) -> Self {
        Self { switches }
    }

    pub fn set(&mut self, switches: u8) {
        self.switches = switches;
    }
}

impl IoDevice for SenseSwitches {
    fn port_in_byte(&mut self, _port: u8, _mem: &mut dyn Memory) -> u8 {
        self.switches
    }

    fn port_out_byte(&mut self, _port: u8, _value: u8, _mem: &mut dyn Memory) {}

    fn name(&self) -> &'static str {
        "Sense Switches"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::memory::FlatMemory;

    #[test]
    fn reads_switch_register_ignores_writes() {
        let mut mem = FlatMemory::new();
        let mut sense = SenseSwitches::new(0x42);
        sense.port_out_byte(SENSE_PORT, 0x00, &mut mem);
        assert_eq!(sense.port_in_byte(SENSE_PORT, &mut mem), 0x42);
        sense.set(0x81);
        assert_eq!(sense.port_in_byte(SENSE_PORT, &mut mem), 0x81);
    }
}
