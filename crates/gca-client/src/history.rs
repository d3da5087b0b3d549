//! §3 client history file: a 4-byte LE `genesisOffset` header followed by
//! a dense array of 4-byte `uint32` energy values, one per timeslot, at
//! `byte = 4*(1 + slot - genesisOffset)`. Write-once per slot: rewriting
//! the same value is a no-op, rewriting a different value is a conflict
//! that the caller must skip and report upstream (it gets banned there,
//! not here).

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use gca_core::error::Result;
use gca_core::timeslot::Timeslot;

const HEADER_LEN: u64 = 4;
const RECORD_LEN: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Stored,
    NoOp,
    Conflict,
}

pub struct HistoryFile {
    file: File,
    path: PathBuf,
    genesis_offset: u32,
}

impl HistoryFile {
    /// Opens an existing history file (reading its `genesisOffset` from
    /// the header), or creates one anchored at `now` if none exists yet.
    pub fn open(path: &Path, now: Timeslot) -> Result<Self> {
        if path.exists() {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            let mut header = [0u8; HEADER_LEN as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            let genesis_offset = LittleEndian::read_u32(&header);
            Ok(HistoryFile {
                file,
                path: path.to_path_buf(),
                genesis_offset,
            })
        } else {
            let mut file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
            let mut header = [0u8; HEADER_LEN as usize];
            LittleEndian::write_u32(&mut header, now.0);
            file.write_all(&header)?;
            file.sync_all()?;
            Ok(HistoryFile {
                file,
                path: path.to_path_buf(),
                genesis_offset: now.0,
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn genesis_offset(&self) -> u32 {
        self.genesis_offset
    }

    fn byte_offset(&self, slot: u32) -> Option<u64> {
        let k = slot.checked_sub(self.genesis_offset)?;
        Some(HEADER_LEN + (k as u64) * RECORD_LEN)
    }

    /// `0` both for "never written" and for a slot before this file's
    /// genesis (the latter can't be written to at all, see
    /// [`save_reading`]).
    pub fn read_slot(&mut self, slot: u32) -> Result<u32> {
        let Some(offset) = self.byte_offset(slot) else {
            return Ok(0);
        };
        let len = self.file.metadata()?.len();
        if offset + RECORD_LEN > len {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; 4];
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(LittleEndian::read_u32(&buf)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Write-once save per §3. Slots before this file's genesis are
    /// rejected outright; callers should never construct one (every
    /// reading comes from a timestamp after the client started).
    pub fn save_reading(&mut self, slot: u32, value: u32) -> Result<SaveOutcome> {
        let Some(offset) = self.byte_offset(slot) else {
            return Ok(SaveOutcome::Conflict);
        };
        let existing = self.read_slot(slot)?;
        if existing == value {
            return Ok(SaveOutcome::NoOp);
        }
        if existing != 0 {
            return Ok(SaveOutcome::Conflict);
        }
        let len = self.file.metadata()?.len();
        if len < offset {
            self.file.set_len(offset)?;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(SaveOutcome::Stored)
    }

    /// Every populated, non-zero slot in `[start, start+count)`, for
    /// gap-fill against a sync server's bitfield (§4.7 step 3).
    pub fn populated_in_range(&mut self, start: u32, count: u32) -> Result<Vec<(u32, u32)>> {
        let mut out = Vec::new();
        for i in 0..count {
            let slot = start.wrapping_add(i);
            let value = self.read_slot(slot)?;
            if value != 0 {
                out.push((slot, value));
            }
        }
        Ok(out)
    }
}
