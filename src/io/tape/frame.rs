//! Tape image framing: each record is a little-endian 32-bit length, the
//! payload padded to an even size, and the length again. A file mark is a
//! single zero length word.

use std::io::{self, ErrorKind, Read, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::io::BackingStore;
use crate::utils::number::even_up;

/// Set in a length word when the record was written with an error.
pub const ERROR_FLAG: u32 = 0x8000_0000;
pub const LENGTH_WORD: u64 = 4;

#[inline]
pub fn record_len(word: u32) -> u32 {
    word & !ERROR_FLAG
}

/// Bytes a record of `len` payload bytes occupies on the image.
#[inline]
pub fn record_span(len: u32) -> u64 {
    even_up(len) as u64 + 2 * LENGTH_WORD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// Nothing left to read.
    EndOfTape,
    Mark,
    Record(u32),
}

/// Length word at the current position.
pub fn read_header(store: &mut dyn BackingStore) -> io::Result<Header> {
    match store.read_u32::<LittleEndian>() {
        Ok(0) => Ok(Header::Mark),
        Ok(word) => Ok(Header::Record(record_len(word))),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(Header::EndOfTape),
        Err(e) => Err(e),
    }
}

/// Read up to `len` payload bytes, zero filling whatever the image cannot
/// supply. A read error is returned alongside the (filled) buffer.
pub fn read_payload(store: &mut dyn BackingStore, len: usize) -> (Vec<u8>, Option<io::Error>) {
    let mut buf = Vec::with_capacity(len);
    let err = store.take(len as u64).read_to_end(&mut buf).err();
    buf.resize(len, 0);
    (buf, err)
}

/// Write one data record; odd payloads get a padding byte.
pub fn write_record(store: &mut dyn BackingStore, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    store.write_u32::<LittleEndian>(len)?;
    store.write_all(payload)?;
    if payload.len() % 2 == 1 {
        store.write_u8(0)?;
    }
    store.write_u32::<LittleEndian>(len)?;
    Ok(())
}

pub fn write_mark(store: &mut dyn BackingStore) -> io::Result<()> {
    store.write_u32::<LittleEndian>(0)
}

/// How 18-bit words map onto tape bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// Three 6-bit characters per word.
    Packed,
    /// Two 8-bit bytes per word, high byte first.
    Unpacked,
}

impl Packing {
    pub fn bytes_per_word(self) -> u32 {
        match self {
            Packing::Packed => 3,
            Packing::Unpacked => 2,
        }
    }

    /// Bits of a memory word that survive a round trip through tape.
    pub fn word_mask(self) -> u32 {
        match self {
            Packing::Packed => 0o777777,
            Packing::Unpacked => 0o177777,
        }
    }

    pub fn encode(self, word: u32, out: &mut Vec<u8>) {
        match self {
            Packing::Packed => {
                out.push(((word >> 12) & 0o77) as u8);
                out.push(((word >> 6) & 0o77) as u8);
                out.push((word & 0o77) as u8);
            }
            Packing::Unpacked => {
                out.push(((word >> 8) & 0o377) as u8);
                out.push((word & 0o377) as u8);
            }
        }
    }

    /// Decode the word starting at `bytes[0]`.
    pub fn decode(self, bytes: &[u8]) -> u32 {
        match self {
            Packing::Packed => {
                ((bytes[0] as u32 & 0o77) << 12) | ((bytes[1] as u32 & 0o77) << 6) | (bytes[2] as u32 & 0o77)
            }
            Packing::Unpacked => ((bytes[0] as u32) << 8) | bytes[1] as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Mark,
    Record { len: u32, flagged: bool },
    /// Leading and trailing lengths disagree, or the record is cut short.
    Damaged { len: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub offset: u64,
    pub kind: FrameKind,
}

/// Walk every frame of an image from the start. Stops at the first damaged
/// frame since nothing after it can be located.
pub fn scan(store: &mut dyn BackingStore) -> io::Result<Vec<FrameInfo>> {
    let mut frames = Vec::new();
    let mut offset = 0u64;
    loop {
        store.seek(SeekFrom::Start(offset))?;
        let word = match store.read_u32::<LittleEndian>() {
            Ok(word) => word,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        if word == 0 {
            frames.push(FrameInfo { offset, kind: FrameKind::Mark });
            offset += LENGTH_WORD;
            continue;
        }
        let len = record_len(word);
        store.seek(SeekFrom::Start(offset + LENGTH_WORD + even_up(len) as u64))?;
        let trailer = match store.read_u32::<LittleEndian>() {
            Ok(trailer) => Some(trailer),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => return Err(e),
        };
        if trailer.map(record_len) != Some(len) {
            frames.push(FrameInfo { offset, kind: FrameKind::Damaged { len } });
            break;
        }
        frames.push(FrameInfo {
            offset,
            kind: FrameKind::Record { len, flagged: word & ERROR_FLAG != 0 },
        });
        offset += record_span(len);
    }
    Ok(frames)
}
