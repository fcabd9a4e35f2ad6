pub mod format;

#[cfg(test)]
mod tests;

use std::fs::OpenOptions;
use std::io::{Read, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use num_derive::FromPrimitive;

use crate::error::{Error, Result};
use crate::io::bus::IoDevice;
use crate::io::sequencer::Sequencer;
use crate::io::{store_len, BackingStore};
use crate::utils::number::{high_byte, low_byte};
use crate::vm::memory::Memory;

use self::format::{Geometry, DPB_LEN, FORMATS};

pub const HDSK_PORT: u8 = 0xFD;
pub const UNITS: usize = 8;
pub const BOOT_ADDRESS: u16 = 0x5C00;
pub const MAX_SECTOR_SIZE: u32 = 1024;
const BOOT_MIN_MEMORY: usize = 24 * 1024;

const CPM_OK: u8 = 0;
const CPM_ERROR: u8 = 1;
/// Filler for sectors past the end of the image.
const CPM_EMPTY: u8 = 0xE5;

/// Unit, sector, track low/high, DMA low/high.
const TRANSFER_PARAMS: usize = 6;
/// DPB followed by the physical sector size.
const PARAM_RESULT_LEN: usize = DPB_LEN + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
enum HdskCommand {
    Reset = 1,
    Read = 2,
    Write = 3,
    Param = 4,
}

pub struct DiskUnit {
    image: Option<Box<dyn BackingStore>>,
    path: Option<PathBuf>,
    format: usize,
    capacity: u64,
    geometry: Geometry,
    pub write_locked: bool,
    pub verbose: bool,
}

impl DiskUnit {
    fn new() -> Self {
        let format = &FORMATS[0];
        Self {
            image: None,
            path: None,
            format: 0,
            capacity: format.capacity,
            geometry: format.geometry(format.capacity),
            write_locked: false,
            verbose: false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.image.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn format_name(&self) -> &'static str {
        FORMATS[self.format].name
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn select_format(&mut self, format: usize, capacity: u64) {
        self.format = format;
        self.capacity = capacity;
        self.geometry = FORMATS[format].geometry(capacity);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Addressing {
    unit: usize,
    sector: u32,
    track: u32,
    dma: u32,
}

/// Simulated hard disk on port 0xFD.
pub struct HardDisk {
    units: Vec<DiskUnit>,
    seq: Sequencer<HdskCommand>,
    selected: Addressing,
    buf: Vec<u8>,
}

impl HardDisk {
    pub fn new() -> Self {
        Self {
            units: (0..UNITS).map(|_| DiskUnit::new()).collect(),
            seq: Sequencer::new(),
            selected: Addressing::default(),
            buf: vec![0; MAX_SECTOR_SIZE as usize],
        }
    }

    pub fn unit(&self, unit: usize) -> Option<&DiskUnit> {
        self.units.get(unit)
    }

    fn unit_mut(&mut self, unit: usize) -> Result<&mut DiskUnit> {
        self.units.get_mut(unit).ok_or(Error::NoSuchUnit { device: "HDSK", unit })
    }

    /// Attach an image file, creating it when missing. A read-only attach
    /// write-locks the unit.
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
        if read_only {
            u.write_locked = true;
        }
        Ok(())
    }

    /// Attach a store and pick the format from its size. An empty store
    /// keeps the unit's current geometry.
    pub fn attach_store(&mut self, unit: usize, mut store: Box<dyn BackingStore>) -> Result<()> {
        let len = store_len(store.as_mut())?;
        let u = self.unit_mut(unit)?;
        u.image = Some(store);
        u.path = None;
        if len == 0 {
            return Ok(());
        }
        match format::by_capacity(len) {
            Some(idx) => u.select_format(idx, len),
            None => {
                warn!("HDSK{}: unsupported disk capacity {}, assuming {} type", unit, len, FORMATS[0].name);
                u.select_format(0, FORMATS[0].capacity);
                u.write_locked = true;
                warn!("HDSK{}: forcing WRTLCK", unit);
                if u.geometry.capacity() != len {
                    warn!("HDSK{}: geometry may be incorrect", unit);
                }
            }
        }
        debug!("HDSK{}: attached {} bytes as {} ({})", unit, len, u.format_name(), u.geometry);
        Ok(())
    }

    pub fn detach(&mut self, unit: usize) -> Result<()> {
        let u = self.unit_mut(unit)?;
        if u.image.is_none() {
            return Err(Error::NotAttached { device: "HDSK", unit });
        }
        if let Some(mut image) = u.image.take() {
            image.flush()?;
        }
        u.path = None;
        Ok(())
    }

    pub fn set_format(&mut self, unit: usize, name: &str) -> Result<()> {
        let idx = format::by_name(name).ok_or_else(|| Error::UnknownFormat(name.to_string()))?;
        self.unit_mut(unit)?.select_format(idx, FORMATS[idx].capacity);
        Ok(())
    }

    /// Override the physical geometry of a unit.
    pub fn set_geometry(&mut self, unit: usize, tracks: u32, sectors_per_track: u32, sector_size: u32) -> Result<()> {
        if sector_size == 0 || sector_size > MAX_SECTOR_SIZE {
            return Err(Error::InvalidGeometry(format!(
                "sector size {} outside 1..={}",
                sector_size, MAX_SECTOR_SIZE
            )));
        }
        if sectors_per_track == 0 {
            return Err(Error::InvalidGeometry("no sectors per track".to_string()));
        }
        self.unit_mut(unit)?.geometry = Geometry {
            tracks,
            sectors_per_track,
            sector_size,
        };
        Ok(())
    }

    pub fn set_write_lock(&mut self, unit: usize, locked: bool) -> Result<()> {
        self.unit_mut(unit)?.write_locked = locked;
        Ok(())
    }

    pub fn set_verbose(&mut self, unit: usize, verbose: bool) -> Result<()> {
        self.unit_mut(unit)?.verbose = verbose;
        Ok(())
    }

    /// Copy the boot loader into memory and return its start address.
    pub fn boot(&self, mem: &mut dyn Memory) -> Result<u16> {
        if mem.size() < BOOT_MIN_MEMORY {
            return Err(Error::InvalidGeometry(
                "need at least 24KB RAM to boot from hard disk".to_string(),
            ));
        }
        mem.write_block(BOOT_ADDRESS, &BOOT_LOADER);
        Ok(BOOT_ADDRESS)
    }

    pub fn reset(&mut self) {
        self.seq.finish();
    }

    fn has_verbose(&self) -> bool {
        self.units.iter().any(|u| u.verbose)
    }

    /// Repair out-of-range addressing. Only an unattached unit is fatal.
    fn check_parameters(&mut self) -> bool {
        if self.selected.unit >= UNITS {
            if self.has_verbose() {
                warn!("HDSK{} does not exist, will use HDSK0 instead", self.selected.unit);
            }
            self.selected.unit = 0;
        }
        let unit = self.selected.unit;
        let u = &self.units[unit];
        if !u.is_attached() {
            if u.verbose {
                warn!("HDSK{} is not attached", unit);
            }
            return false;
        }
        let geometry = u.geometry;
        if self.selected.sector >= geometry.sectors_per_track {
            if u.verbose {
                warn!(
                    "HDSK{}: 0 <= Sector={:02} < {} violated, will use 0 instead",
                    unit, self.selected.sector, geometry.sectors_per_track
                );
            }
            self.selected.sector = 0;
        }
        if self.selected.track >= geometry.tracks {
            if u.verbose {
                warn!(
                    "HDSK{}: 0 <= Track={:04} < {:04} violated, will use 0 instead",
                    unit, self.selected.track, geometry.tracks
                );
            }
            self.selected.track = 0;
        }
        self.selected.dma &= 0xFFFF;
        debug!(
            "{} HDSK{} Track={:04} Sector={:02} Len={:04} DMA={:04X}",
            if self.seq.command() == Some(HdskCommand::Read) { "Read" } else { "Write" },
            unit,
            self.selected.track,
            self.selected.sector,
            geometry.sector_size,
            self.selected.dma
        );
        true
    }

    fn seek(&mut self) -> bool {
        let Addressing { unit, sector, track, .. } = self.selected;
        let u = &mut self.units[unit];
        let offset = u.geometry.offset(track, sector);
        let ok = match u.image.as_mut() {
            Some(image) => image.seek(SeekFrom::Start(offset)).is_ok(),
            None => false,
        };
        if !ok && u.verbose {
            warn!("Could not access HDSK{} Sector={:02} Track={:04}", unit, sector, track);
        }
        ok
    }

    fn do_read(&mut self, mem: &mut dyn Memory) -> u8 {
        if !self.seek() {
            return CPM_ERROR;
        }
        let Addressing { unit, sector, track, dma } = self.selected;
        let u = &mut self.units[unit];
        let len = u.geometry.sector_size as usize;
        let buf = &mut self.buf[..len];
        let read = match u.image.as_mut() {
            Some(image) => image.read_exact(buf).is_ok(),
            None => false,
        };
        if !read {
            buf.fill(CPM_EMPTY);
            if u.verbose {
                warn!("Could not read HDSK{} Sector={:02} Track={:04}", unit, sector, track);
            }
            // empty images read as formatted
            return CPM_OK;
        }
        mem.write_block(dma as u16, buf);
        CPM_OK
    }

    fn do_write(&mut self, mem: &mut dyn Memory) -> u8 {
        let Addressing { unit, sector, track, dma } = self.selected;
        if self.units[unit].write_locked {
            if self.units[unit].verbose {
                warn!("Could not write to locked HDSK{} Sector={:02} Track={:04}", unit, sector, track);
            }
            return CPM_ERROR;
        }
        if !self.seek() {
            return CPM_ERROR;
        }
        let u = &mut self.units[unit];
        let buf = &mut self.buf[..u.geometry.sector_size as usize];
        mem.read_block(dma as u16, buf);
        let written = match u.image.as_mut() {
            Some(image) => image.write_all(buf).is_ok(),
            None => false,
        };
        if !written {
            if u.verbose {
                warn!("Could not write HDSK{} Sector={:02} Track={:04}", unit, sector, track);
            }
            return CPM_ERROR;
        }
        CPM_OK
    }

    fn parameter_block(&self) -> [u8; PARAM_RESULT_LEN] {
        let unit = if self.selected.unit < UNITS { self.selected.unit } else { 0 };
        let u = &self.units[unit];
        let mut block = [0u8; PARAM_RESULT_LEN];
        block[..DPB_LEN].copy_from_slice(&FORMATS[u.format].dpb_bytes());
        let sector_size = u.geometry.sector_size as u16;
        block[DPB_LEN] = low_byte(sector_size);
        block[DPB_LEN + 1] = high_byte(sector_size);
        block
    }
}

impl Default for HardDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDevice for HardDisk {
    fn port_in_byte(&mut self, port: u8, mem: &mut dyn Memory) -> u8 {
        match self.seq.command() {
            Some(cmd @ (HdskCommand::Read | HdskCommand::Write))
                if self.seq.position() == TRANSFER_PARAMS =>
            {
                let result = if !self.check_parameters() {
                    CPM_ERROR
                } else if cmd == HdskCommand::Read {
                    self.do_read(mem)
                } else {
                    self.do_write(mem)
                };
                self.seq.finish();
                result
            }
            Some(HdskCommand::Param) => {
                let block = self.parameter_block();
                let index = self.seq.next_result();
                if index + 1 >= PARAM_RESULT_LEN {
                    self.seq.finish();
                }
                block[index]
            }
            _ => self.seq.out_of_order("HDSK", port, self.has_verbose()),
        }
    }

    fn port_out_byte(&mut self, _port: u8, value: u8, _mem: &mut dyn Memory) {
        match self.seq.command() {
            Some(HdskCommand::Param) => {
                self.seq.restart_results();
                self.selected.unit = value as usize;
            }
            Some(HdskCommand::Read | HdskCommand::Write) => {
                if self.seq.position() >= TRANSFER_PARAMS {
                    // a seventh byte abandons the command
                    self.seq.finish();
                    return;
                }
                let value = value as u32;
                match self.seq.accept_param() {
                    0 => self.selected.unit = value as usize,
                    1 => self.selected.sector = value,
                    2 => self.selected.track = value,
                    3 => self.selected.track += value << 8,
                    4 => self.selected.dma = value,
                    _ => self.selected.dma += value << 8,
                }
            }
            Some(HdskCommand::Reset) | None => {
                self.seq.begin(value);
            }
        }
    }

    fn name(&self) -> &'static str {
        "HDSK"
    }
}

/// Loads CP/M from unit 0 and jumps to it.
#[rustfmt::skip]
const BOOT_LOADER: [u8; 256] = [
    0xf3, 0x06, 0x80, 0x3e, 0x0e, 0xd3, 0xfe, 0x05, // 5c00
    0xc2, 0x05, 0x5c, 0x3e, 0x16, 0xd3, 0xfe, 0x3e, // 5c08
    0x12, 0xd3, 0xfe, 0xdb, 0xfe, 0xb7, 0xca, 0x20, // 5c10
    0x5c, 0x3e, 0x0c, 0xd3, 0xfe, 0xaf, 0xd3, 0xfe, // 5c18
    0x06, 0x20, 0x3e, 0x01, 0xd3, 0xfd, 0x05, 0xc2, // 5c20
    0x24, 0x5c, 0x11, 0x08, 0x00, 0x21, 0x00, 0x00, // 5c28
    0x0e, 0xb8, 0x3e, 0x02, 0xd3, 0xfd, 0x3a, 0x37, // 5c30
    0xff, 0xd6, 0x08, 0xd3, 0xfd, 0x7b, 0xd3, 0xfd, // 5c38
    0x7a, 0xd3, 0xfd, 0xaf, 0xd3, 0xfd, 0x7d, 0xd3, // 5c40
    0xfd, 0x7c, 0xd3, 0xfd, 0xdb, 0xfd, 0xb7, 0xca, // 5c48
    0x53, 0x5c, 0x76, 0x79, 0x0e, 0x80, 0x09, 0x4f, // 5c50
    0x0d, 0xc2, 0x60, 0x5c, 0xfb, 0xc3, 0x00, 0x00, // 5c58
    0x1c, 0x1c, 0x7b, 0xfe, 0x20, 0xca, 0x73, 0x5c, // 5c60
    0xfe, 0x21, 0xc2, 0x32, 0x5c, 0x1e, 0x00, 0x14, // 5c68
    0xc3, 0x32, 0x5c, 0x1e, 0x01, 0xc3, 0x32, 0x5c, // 5c70
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // 5c78
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
