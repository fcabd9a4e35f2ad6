use std::io::{self, Read, Seek, SeekFrom, Write};

pub mod bus;
pub mod hdsk;
pub mod ptr;
pub mod sense;
pub mod sequencer;
pub mod simh;
pub mod sio;
pub mod tape;
pub mod telnet;

#[cfg(test)]
pub(crate) mod testing;

/// Random-access byte store behind a disk or tape unit.
pub trait BackingStore: Read + Write + Seek {}

impl<T: Read + Write + Seek> BackingStore for T {}

/// Total length of the store; the current position is preserved.
pub fn store_len(store: &mut dyn BackingStore) -> io::Result<u64> {
    let pos = store.stream_position()?;
    let end = store.seek(SeekFrom::End(0))?;
    store.seek(SeekFrom::Start(pos))?;
    Ok(end)
}
