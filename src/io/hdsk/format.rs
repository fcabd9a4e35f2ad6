use byteorder::{ByteOrder, LittleEndian};

/// CP/M disk parameter block plus the image capacity it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskFormat {
    pub name: &'static str,
    pub capacity: u64,
    pub spt: u16,
    pub bsh: u8,
    pub blm: u8,
    pub exm: u8,
    pub dsm: u16,
    pub drm: u16,
    pub al0: u8,
    pub al1: u8,
    pub cks: u16,
    pub off: u16,
    pub psh: u8,
    pub phm: u8,
}

/// Length of the parameter block as CP/M lays it out.
pub const DPB_LEN: usize = 17;

pub const FORMATS: [DiskFormat; 4] = [
    // AltairZ80 hard disk
    DiskFormat {
        name: "HDSK",
        capacity: 2048 * 32 * 128,
        spt: 32,
        bsh: 0x05,
        blm: 0x1F,
        exm: 0x01,
        dsm: 0x07F9,
        drm: 0x03FF,
        al0: 0xFF,
        al1: 0x00,
        cks: 0x8000,
        off: 0x0006,
        psh: 0x00,
        phm: 0x00,
    },
    // 128K flash
    DiskFormat {
        name: "EZ80FL",
        capacity: 131072,
        spt: 32,
        bsh: 0x03,
        blm: 0x07,
        exm: 0x00,
        dsm: 127,
        drm: 0x003E,
        al0: 0xC0,
        al1: 0x00,
        cks: 0x0000,
        off: 0x0000,
        psh: 0x02,
        phm: 0x03,
    },
    // 1.44M P112 floppy
    DiskFormat {
        name: "P112",
        capacity: 1474560,
        spt: 72,
        bsh: 0x04,
        blm: 0x0F,
        exm: 0x00,
        dsm: 710,
        drm: 0x00FE,
        al0: 0xF0,
        al1: 0x00,
        cks: 0x0000,
        off: 0x0002,
        psh: 0x02,
        phm: 0x03,
    },
    // 720K Super I/O
    DiskFormat {
        name: "SU720",
        capacity: 737280,
        spt: 36,
        bsh: 0x04,
        blm: 0x0F,
        exm: 0x00,
        dsm: 354,
        drm: 0x007E,
        al0: 0xC0,
        al1: 0x00,
        cks: 0x0020,
        off: 0x0002,
        psh: 0x02,
        phm: 0x03,
    },
];

impl DiskFormat {
    pub fn sector_size(&self) -> u32 {
        128 << self.psh
    }

    pub fn sectors_per_track(&self) -> u32 {
        (self.spt >> self.psh) as u32
    }

    /// Physical geometry of an image of `capacity` bytes in this format.
    pub fn geometry(&self, capacity: u64) -> Geometry {
        let sector_size = self.sector_size();
        let sectors_per_track = self.sectors_per_track();
        Geometry {
            tracks: (capacity / (sectors_per_track as u64 * sector_size as u64)) as u32,
            sectors_per_track,
            sector_size,
        }
    }

    /// The 17 DPB bytes, 16-bit fields low byte first.
    pub fn dpb_bytes(&self) -> [u8; DPB_LEN] {
        let mut dpb = [0u8; DPB_LEN];
        LittleEndian::write_u16(&mut dpb[0..2], self.spt);
        dpb[2] = self.bsh;
        dpb[3] = self.blm;
        dpb[4] = self.exm;
        LittleEndian::write_u16(&mut dpb[5..7], self.dsm);
        LittleEndian::write_u16(&mut dpb[7..9], self.drm);
        dpb[9] = self.al0;
        dpb[10] = self.al1;
        LittleEndian::write_u16(&mut dpb[11..13], self.cks);
        LittleEndian::write_u16(&mut dpb[13..15], self.off);
        dpb[15] = self.psh;
        dpb[16] = self.phm;
        dpb
    }
}

pub fn by_capacity(capacity: u64) -> Option<usize> {
    FORMATS.iter().position(|f| f.capacity == capacity)
}

/// First format whose name starts with `prefix`, ignoring case.
pub fn by_name(prefix: &str) -> Option<usize> {
    let prefix = prefix.trim().to_ascii_uppercase();
    FORMATS.iter().position(|f| f.name.starts_with(&prefix))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub tracks: u32,
    pub sectors_per_track: u32,
    pub sector_size: u32,
}

impl Geometry {
    pub fn track_size(&self) -> u64 {
        self.sectors_per_track as u64 * self.sector_size as u64
    }

    pub fn offset(&self, track: u32, sector: u32) -> u64 {
        self.track_size() * track as u64 + self.sector_size as u64 * sector as u64
    }

    pub fn capacity(&self) -> u64 {
        self.track_size() * self.tracks as u64
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "T:{}/N:{}/S:{}",
            self.tracks, self.sectors_per_track, self.sector_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_geometry_matches_table() {
        let hdsk = FORMATS[0].geometry(FORMATS[0].capacity);
        assert_eq!(hdsk, Geometry { tracks: 2048, sectors_per_track: 32, sector_size: 128 });

        let p112 = FORMATS[2].geometry(FORMATS[2].capacity);
        assert_eq!(p112.sector_size, 512);
        assert_eq!(p112.sectors_per_track, 18);
        assert_eq!(p112.tracks, 160);
        assert_eq!(p112.capacity(), 1474560);
    }

    #[test]
    fn seek_offset_formula() {
        let g = FORMATS[0].geometry(FORMATS[0].capacity);
        assert_eq!(g.offset(0, 0), 0);
        assert_eq!(g.offset(0, 5), 5 * 128);
        assert_eq!(g.offset(3, 7), 3 * 32 * 128 + 7 * 128);
        assert_eq!(g.offset(2047, 31), FORMATS[0].capacity - 128);
    }

    #[test]
    fn lookup_by_capacity_and_prefix() {
        assert_eq!(by_capacity(737280), Some(3));
        assert_eq!(by_capacity(1000), None);
        assert_eq!(by_name("P1"), Some(2));
        assert_eq!(by_name("ez80"), Some(1));
        assert_eq!(by_name("HDSK"), Some(0));
        assert_eq!(by_name("RX01"), None);
    }

    #[test]
    fn dpb_bytes_are_little_endian() {
        let dpb = FORMATS[0].dpb_bytes();
        assert_eq!(
            dpb,
            [32, 0, 0x05, 0x1F, 0x01, 0xF9, 0x07, 0xFF, 0x03, 0xFF, 0x00, 0x00, 0x80, 0x06, 0x00, 0x00, 0x00]
        );
    }
}
