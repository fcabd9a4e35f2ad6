use super::*;
use crate::io::testing::SharedStore;
use crate::vm::memory::FlatMemory;

const EZ80_CAPACITY: usize = 131072;

fn send(hd: &mut HardDisk, mem: &mut FlatMemory, bytes: &[u8]) {
    for &b in bytes {
        hd.port_out_byte(HDSK_PORT, b, mem);
    }
}

fn transfer(hd: &mut HardDisk, mem: &mut FlatMemory, cmd: u8, unit: u8, sector: u8, track: u16, dma: u16) -> u8 {
    send(
        hd,
        mem,
        &[cmd, unit, sector, track as u8, (track >> 8) as u8, dma as u8, (dma >> 8) as u8],
    );
    hd.port_in_byte(HDSK_PORT, mem)
}

/// EZ80FL image whose every sector is filled with its own linear index.
fn patterned_image() -> SharedStore {
    let mut bytes = vec![0u8; EZ80_CAPACITY];
    for (i, chunk) in bytes.chunks_mut(512).enumerate() {
        chunk.fill(i as u8);
    }
    SharedStore::new(bytes)
}

fn setup(store: &SharedStore) -> (HardDisk, FlatMemory) {
    let mut hd = HardDisk::new();
    hd.attach_store(0, Box::new(store.clone())).unwrap();
    (hd, FlatMemory::new())
}

// ========================================================================
// ATTACH / FORMAT
// ========================================================================

#[test]
fn attach_selects_format_by_capacity() {
    let store = patterned_image();
    let (hd, _) = setup(&store);
    let unit = hd.unit(0).unwrap();
    assert_eq!(unit.format_name(), "EZ80FL");
    assert_eq!(unit.geometry(), Geometry { tracks: 32, sectors_per_track: 8, sector_size: 512 });
    assert!(!unit.write_locked);
}

#[test]
fn unknown_capacity_falls_back_and_write_locks() {
    let mut hd = HardDisk::new();
    hd.attach_store(1, Box::new(SharedStore::new(vec![0; 1000]))).unwrap();
    let unit = hd.unit(1).unwrap();
    assert_eq!(unit.format_name(), "HDSK");
    assert!(unit.write_locked);
    assert_eq!(unit.geometry().tracks, 2048);
}

#[test]
fn empty_image_keeps_current_geometry() {
    let mut hd = HardDisk::new();
    hd.set_format(2, "su").unwrap();
    hd.attach_store(2, Box::new(SharedStore::new(Vec::new()))).unwrap();
    let unit = hd.unit(2).unwrap();
    assert_eq!(unit.format_name(), "SU720");
    assert_eq!(unit.geometry().sector_size, 512);
    assert!(unit.is_attached());
}

#[test]
fn fresh_units_use_default_geometry() {
    let hd = HardDisk::new();
    let unit = hd.unit(7).unwrap();
    assert_eq!(unit.geometry(), Geometry { tracks: 2048, sectors_per_track: 32, sector_size: 128 });
}

#[test]
fn format_and_geometry_overrides() {
    let mut hd = HardDisk::new();
    assert!(matches!(hd.set_format(0, "XYZ"), Err(Error::UnknownFormat(_))));
    assert!(matches!(hd.set_geometry(0, 10, 4, 2048), Err(Error::InvalidGeometry(_))));
    assert!(matches!(hd.set_verbose(8, true), Err(Error::NoSuchUnit { .. })));
    hd.set_geometry(0, 10, 4, 256).unwrap();
    assert_eq!(hd.unit(0).unwrap().geometry().to_string(), "T:10/N:4/S:256");
}

#[test]
fn detach_requires_attached_unit() {
    let store = patterned_image();
    let (mut hd, _) = setup(&store);
    hd.detach(0).unwrap();
    assert!(!hd.unit(0).unwrap().is_attached());
    assert!(matches!(hd.detach(0), Err(Error::NotAttached { unit: 0, .. })));
}

#[test]
fn attach_file_creates_missing_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("new.dsk");
    let mut hd = HardDisk::new();
    hd.attach(3, &path, false).unwrap();
    assert!(path.exists());
    assert_eq!(hd.unit(3).unwrap().path(), Some(path.as_path()));
    assert_eq!(hd.unit(3).unwrap().format_name(), "HDSK");
}

// ========================================================================
// READ / WRITE
// ========================================================================

#[test]
fn read_copies_sector_to_dma() {
    let store = patterned_image();
    let (mut hd, mut mem) = setup(&store);
    assert_eq!(transfer(&mut hd, &mut mem, 2, 0, 3, 2, 0x4000), CPM_OK);
    // track 2, sector 3 is linear sector 19
    assert_eq!(mem.read_byte(0x4000), 19);
    assert_eq!(mem.read_byte(0x41FF), 19);
    assert_eq!(mem.read_byte(0x4200), 0);
}

#[test]
fn write_lands_at_seek_offset() {
    let store = patterned_image();
    let (mut hd, mut mem) = setup(&store);
    mem.write_block(0x1000, &[0xAB; 512]);
    assert_eq!(transfer(&mut hd, &mut mem, 3, 0, 5, 1, 0x1000), CPM_OK);
    let bytes = SharedStore::bytes(&store);
    let offset = hd.unit(0).unwrap().geometry().offset(1, 5) as usize;
    assert_eq!(offset, 8 * 512 + 5 * 512);
    assert!(bytes[offset..offset + 512].iter().all(|&b| b == 0xAB));
    assert_eq!(bytes[offset - 1], 12);
    assert_eq!(bytes[offset + 512], 14);
}

#[test]
fn write_locked_unit_is_never_modified() {
    let store = patterned_image();
    let (mut hd, mut mem) = setup(&store);
    hd.set_write_lock(0, true).unwrap();
    let before = SharedStore::bytes(&store);
    mem.write_block(0x1000, &[0x55; 512]);
    for sector in 0..8 {
        assert_eq!(transfer(&mut hd, &mut mem, 3, 0, sector, 0, 0x1000), CPM_ERROR);
    }
    assert_eq!(SharedStore::bytes(&store), before);
}

#[test]
fn out_of_range_addressing_is_repaired() {
    let store = patterned_image();
    let (mut hd, mut mem) = setup(&store);
    mem.write_block(0x2000, &[0x77; 512]);
    // unit 99, sector 0xFF, track 0xFFFF all fall back to 0
    assert_eq!(transfer(&mut hd, &mut mem, 2, 99, 0xFF, 0xFFFF, 0x2000), CPM_OK);
    assert_eq!(mem.read_byte(0x2000), 0);
    assert_eq!(mem.read_byte(0x21FF), 0);
}

#[test]
fn unattached_unit_reports_error() {
    let store = patterned_image();
    let (mut hd, mut mem) = setup(&store);
    assert_eq!(transfer(&mut hd, &mut mem, 2, 4, 0, 0, 0x2000), CPM_ERROR);
}

#[test]
fn short_read_reports_success_without_touching_memory() {
    let mut hd = HardDisk::new();
    let mut mem = FlatMemory::new();
    // half a sector of data behind an explicit geometry
    hd.attach_store(0, Box::new(SharedStore::new(Vec::new()))).unwrap();
    hd.set_geometry(0, 4, 4, 128).unwrap();
    mem.write_block(0x3000, &[0x11; 128]);
    assert_eq!(transfer(&mut hd, &mut mem, 2, 0, 1, 0, 0x3000), CPM_OK);
    assert_eq!(mem.read_byte(0x3000), 0x11);
}

#[test]
fn seventh_write_abandons_command() {
    let store = patterned_image();
    let (mut hd, mut mem) = setup(&store);
    mem.write_block(0x1000, &[0xCC; 512]);
    let before = SharedStore::bytes(&store);
    send(&mut hd, &mut mem, &[3, 0, 0, 0, 0, 0x00, 0x10, 0x00]);
    // the abandoned write never reaches the image
    assert_eq!(hd.port_in_byte(HDSK_PORT, &mut mem), 0);
    assert_eq!(SharedStore::bytes(&store), before);
}

#[test]
fn reset_bytes_flush_partial_command() {
    let store = patterned_image();
    let (mut hd, mut mem) = setup(&store);
    send(&mut hd, &mut mem, &[2, 0, 1]);
    send(&mut hd, &mut mem, &[1; 32]);
    assert_eq!(transfer(&mut hd, &mut mem, 2, 0, 1, 0, 0x5000), CPM_OK);
    assert_eq!(mem.read_byte(0x5000), 1);
}

// ========================================================================
// GET PARAMETERS
// ========================================================================

#[test]
fn parameters_yield_nineteen_bytes_then_idle() {
    let store = patterned_image();
    let (mut hd, mut mem) = setup(&store);
    send(&mut hd, &mut mem, &[4, 0]);
    let block: Vec<u8> = (0..19).map(|_| hd.port_in_byte(HDSK_PORT, &mut mem)).collect();
    assert_eq!(&block[..17], &FORMATS[1].dpb_bytes());
    assert_eq!(block[17], 0x00);
    assert_eq!(block[18], 0x02);
    // sequencer is idle again: out-of-order read
    assert_eq!(hd.port_in_byte(HDSK_PORT, &mut mem), 0);
    assert_eq!(transfer(&mut hd, &mut mem, 2, 0, 0, 0, 0x6000), CPM_OK);
}

#[test]
fn parameters_follow_selected_unit() {
    let store = patterned_image();
    let (mut hd, mut mem) = setup(&store);
    send(&mut hd, &mut mem, &[4, 5]);
    assert_eq!(hd.port_in_byte(HDSK_PORT, &mut mem), 32);
    // a second unit byte restarts the block
    send(&mut hd, &mut mem, &[0]);
    assert_eq!(hd.port_in_byte(HDSK_PORT, &mut mem), 32);
    assert_eq!(hd.port_in_byte(HDSK_PORT, &mut mem), 0);
    assert_eq!(hd.port_in_byte(HDSK_PORT, &mut mem), 0x03);
}

#[test]
fn idle_read_returns_zero() {
    let mut hd = HardDisk::new();
    let mut mem = FlatMemory::new();
    hd.set_verbose(0, true).unwrap();
    assert_eq!(hd.port_in_byte(HDSK_PORT, &mut mem), 0);
}

// ========================================================================
// BOOT
// ========================================================================

#[test]
fn boot_installs_loader() {
    let hd = HardDisk::new();
    let mut mem = FlatMemory::new();
    assert_eq!(hd.boot(&mut mem).unwrap(), BOOT_ADDRESS);
    assert_eq!(mem.read_byte(BOOT_ADDRESS), 0xF3);
    assert_eq!(mem.read_byte(BOOT_ADDRESS + 0x77), 0x5C);

    let mut small = FlatMemory::with_size(16 * 1024);
    assert!(hd.boot(&mut small).is_err());
}
