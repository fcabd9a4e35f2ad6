//! JSON machine description. Every field has a default, so `{}` describes a
//! machine with no media attached and the console on the local terminal.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::io::sio::{SioOptions, CONTROL_E};
use crate::io::simh::{DEFAULT_TIMER_DELTA, DEFAULT_TIMER_HANDLER};
use crate::io::tape::DEFAULT_LATENCY;
use crate::vm::memory::MAX_CORE;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub memory: MemoryConfig,
    pub disks: Vec<DiskConfig>,
    pub console: ConsoleConfig,
    pub simh: SimhConfig,
    pub paper_tape: PaperTapeConfig,
    pub sense_switches: u8,
    pub tape: TapeConfig,
    /// Log at most this many accesses to unassigned ports.
    pub warn_unassigned: Option<u32>,
}

impl MachineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| Error::Open { path: path.to_path_buf(), source })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of banks below the common area; 0 for flat 64K.
    pub banks: u8,
    pub common: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryConfig {
    pub tracks: u32,
    pub sectors_per_track: u32,
    pub sector_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub unit: usize,
    pub path: PathBuf,
    pub read_only: bool,
    /// Format name prefix, e.g. "HDSK" or "EZ80FL".
    pub format: Option<String>,
    pub geometry: Option<GeometryConfig>,
    pub write_locked: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Serve the console over telnet instead of the local terminal.
    pub telnet_port: Option<u16>,
    pub lines: usize,
    /// Simulator name used in the connect and disconnect banners.
    pub name: String,
    /// Take console input from a file until it is exhausted.
    pub input_file: Option<PathBuf>,
    pub stop_char: u8,
    pub options: SioOptions,
    /// Port table edits, "port/line/read/notread/write/T|F/reset/T|F" or a bare port to remove.
    pub ports: Vec<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            telnet_port: None,
            lines: 1,
            name: "Altair 8800".to_string(),
            input_file: None,
            stop_char: CONTROL_E,
            options: SioOptions::default(),
            ports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimhConfig {
    pub verbose: bool,
    pub sleep_micros: u64,
    pub timer_delta: u16,
    pub timer_handler: u16,
}

impl Default for SimhConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            sleep_micros: 1000,
            timer_delta: DEFAULT_TIMER_DELTA,
            timer_handler: DEFAULT_TIMER_HANDLER,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperTapeConfig {
    pub reader: Option<PathBuf>,
    pub punch: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapeUnitConfig {
    pub unit: usize,
    pub path: PathBuf,
    pub read_only: bool,
    pub write_locked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapeConfig {
    pub units: Vec<TapeUnitConfig>,
    /// Ticks between a GO and the end of the transfer.
    pub latency: u64,
    pub stop_on_error: bool,
    /// Words of core behind the tape channel.
    pub core_words: u32,
}

impl Default for TapeConfig {
    fn default() -> Self {
        Self {
            units: Vec::new(),
            latency: DEFAULT_LATENCY,
            stop_on_error: true,
            core_words: MAX_CORE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = MachineConfig::from_json("{}").unwrap();
        assert_eq!(config, MachineConfig::default());
        assert_eq!(config.console.lines, 1);
        assert_eq!(config.console.stop_char, CONTROL_E);
        assert!(config.console.options.map);
        assert_eq!(config.tape.latency, DEFAULT_LATENCY);
        assert_eq!(config.simh.timer_handler, 0xFC00);
    }

    #[test]
    fn full_machine_description() {
        let config = MachineConfig::from_json(
            r#"{
                "memory": { "banks": 8, "common": 49152 },
                "disks": [
                    { "unit": 0, "path": "cpm3.dsk", "format": "HDSK" },
                    { "unit": 3, "path": "big.dsk", "geometry": { "tracks": 512, "sectors_per_track": 64, "sector_size": 256 }, "write_locked": true }
                ],
                "console": { "telnet_port": 2323, "lines": 4, "options": { "upper": true }, "ports": ["20/1/01/00/02/T/03/T"] },
                "simh": { "sleep_micros": 0 },
                "paper_tape": { "reader": "in.ptr" },
                "sense_switches": 255,
                "tape": { "units": [ { "unit": 1, "path": "sys.tap" } ], "stop_on_error": false }
            }"#,
        )
        .unwrap();
        assert_eq!(config.memory.banks, 8);
        assert_eq!(config.disks.len(), 2);
        assert_eq!(config.disks[0].format.as_deref(), Some("HDSK"));
        assert_eq!(config.disks[1].geometry.map(|g| g.tracks), Some(512));
        assert!(config.disks[1].write_locked);
        assert_eq!(config.console.telnet_port, Some(2323));
        assert!(config.console.options.upper);
        assert!(config.console.options.map);
        assert_eq!(config.simh.sleep_micros, 0);
        assert_eq!(config.simh.timer_delta, DEFAULT_TIMER_DELTA);
        assert_eq!(config.paper_tape.reader, Some(PathBuf::from("in.ptr")));
        assert_eq!(config.sense_switches, 0xFF);
        assert_eq!(config.tape.units[0].unit, 1);
        assert!(!config.tape.stop_on_error);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(MachineConfig::from_json("{ \"disks\": 3 }"), Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(MachineConfig::load(&dir.path().join("machine.json")), Err(Error::Open { .. })));
    }
}
