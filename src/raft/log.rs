//! Replicated log storage.
//!
//! The replica owns the log and mutates it only from the apply thread. Two
//! implementations are provided: `MemLog` for the memory storage level and
//! tests, and `SegmentedLog`, which persists entries in file segments keyed
//! by their first index. Compaction replaces the applied prefix with a
//! single snapshot entry.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{RaftError, Result};
use crate::raft::entry::Entry;

const ENTRIES_PER_SEGMENT: u64 = 10_000;
const SEGMENT_HEADER_LEN: u64 = 16; // start_index + end_index
const FRAME_HEADER_LEN: u64 = 8; // frame byte length

/// Storage interface the replica drives.
///
/// Indices are 1-based; an empty log has `last_index() == 0`. `size` counts
/// live entries, including the compaction snapshot entry when present.
pub trait RaftLog: Send {
    fn append(&mut self, entries: Vec<Entry>) -> Result<u64>;
    fn get(&mut self, index: u64) -> Result<Option<Entry>>;
    /// Drops every entry with an index greater than `index`.
    fn truncate(&mut self, index: u64) -> Result<()>;
    fn first_index(&self) -> u64;
    fn last_index(&self) -> u64;
    fn size(&self) -> u64;
    fn is_compactable(&self) -> bool {
        true
    }
    /// Replaces all entries up to and including `index` with `snapshot`,
    /// which becomes the entry at `index`.
    fn compact(&mut self, index: u64, snapshot: Entry) -> Result<()>;
}

/// In-memory log.
#[derive(Debug, Default)]
pub struct MemLog {
    snapshot: Option<(u64, Entry)>,
    // index of entries[0]; entries always directly follow the snapshot
    offset: u64,
    entries: Vec<Entry>,
}

impl MemLog {
    pub fn new() -> MemLog {
        MemLog {
            snapshot: None,
            offset: 1,
            entries: Vec::new(),
        }
    }
}

impl RaftLog for MemLog {
    fn append(&mut self, entries: Vec<Entry>) -> Result<u64> {
        self.entries.extend(entries);
        Ok(self.last_index())
    }

    fn get(&mut self, index: u64) -> Result<Option<Entry>> {
        if let Some((snap_index, entry)) = &self.snapshot {
            if index == *snap_index {
                return Ok(Some(entry.clone()));
            }
        }
        if index < self.offset {
            return Ok(None);
        }
        Ok(self.entries.get((index - self.offset) as usize).cloned())
    }

    fn truncate(&mut self, index: u64) -> Result<()> {
        if index + 1 < self.offset {
            return Err(RaftError::Corrupt(format!(
                "cannot truncate to {} below first index {}",
                index,
                self.first_index()
            )));
        }
        self.entries.truncate((index + 1 - self.offset) as usize);
        Ok(())
    }

    fn first_index(&self) -> u64 {
        match &self.snapshot {
            Some((index, _)) => *index,
            None => 1,
        }
    }

    fn last_index(&self) -> u64 {
        if self.entries.is_empty() {
            self.snapshot.as_ref().map(|(i, _)| *i).unwrap_or(0)
        } else {
            self.offset + self.entries.len() as u64 - 1
        }
    }

    fn size(&self) -> u64 {
        let last = self.last_index();
        if last == 0 {
            0
        } else {
            last - self.first_index() + 1
        }
    }

    fn compact(&mut self, index: u64, snapshot: Entry) -> Result<()> {
        if index + 1 > self.offset {
            let keep = self.entries.split_off((index + 1 - self.offset) as usize);
            self.entries = keep;
            self.offset = index + 1;
        }
        self.snapshot = Some((index, snapshot));
        Ok(())
    }
}

/// One log segment file.
///
/// Layout: a 16-byte header holding the start and end index, followed by
/// length-prefixed entry frames. Entries within a segment are contiguous
/// from `start_index`.
struct Segment {
    file: File,
    start_index: u64,
    end_index: u64,
    path: PathBuf,
    positions: BTreeMap<u64, u64>, // index -> file position
}

impl Segment {
    fn open<P: AsRef<Path>>(path: P, start_index: u64) -> io::Result<Segment> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            start_index,
            end_index: start_index - 1,
            path: path.as_ref().to_path_buf(),
            positions: BTreeMap::new(),
        };

        if segment.file.metadata()?.len() < SEGMENT_HEADER_LEN {
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.rebuild_positions()?;
        }

        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.start_index.to_le_bytes())?;
        self.file.write_all(&self.end_index.to_le_bytes())?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf)?;
        self.start_index = u64::from_le_bytes(buf);
        self.file.read_exact(&mut buf)?;
        self.end_index = u64::from_le_bytes(buf);
        Ok(())
    }

    // Scan the frames to recover positions; the scan is authoritative over
    // the header end index after a crash mid-append.
    fn rebuild_positions(&mut self) -> io::Result<()> {
        self.positions.clear();
        let len = self.file.metadata()?.len();
        let mut pos = SEGMENT_HEADER_LEN;
        let mut index = self.start_index;

        while pos + FRAME_HEADER_LEN <= len {
            self.file.seek(SeekFrom::Start(pos))?;
            let mut buf = [0u8; 8];
            self.file.read_exact(&mut buf)?;
            let frame_len = u64::from_le_bytes(buf);
            if pos + FRAME_HEADER_LEN + frame_len > len {
                break; // torn tail write
            }
            self.positions.insert(index, pos);
            index += 1;
            pos += FRAME_HEADER_LEN + frame_len;
        }

        self.end_index = index - 1;
        self.write_header()?;
        Ok(())
    }

    fn append(&mut self, frames: &[Vec<u8>]) -> io::Result<()> {
        let mut pos = self.file.seek(SeekFrom::End(0))?;
        for frame in frames {
            self.file.write_all(&(frame.len() as u64).to_le_bytes())?;
            self.file.write_all(frame)?;
            self.end_index += 1;
            self.positions.insert(self.end_index, pos);
            pos += FRAME_HEADER_LEN + frame.len() as u64;
        }
        self.write_header()?;
        Ok(())
    }

    fn read(&mut self, index: u64) -> io::Result<Vec<u8>> {
        let pos = self.positions.get(&index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "entry index out of range")
        })?;
        self.file.seek(SeekFrom::Start(*pos))?;
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf)?;
        let frame_len = u64::from_le_bytes(buf);
        let mut frame = vec![0u8; frame_len as usize];
        self.file.read_exact(&mut frame)?;
        Ok(frame)
    }

    fn truncate(&mut self, index: u64) -> io::Result<()> {
        if index >= self.end_index {
            return Ok(());
        }
        let cut = if index + 1 == self.start_index {
            SEGMENT_HEADER_LEN
        } else {
            *self.positions.get(&(index + 1)).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "truncate index out of range")
            })?
        };
        self.file.set_len(cut)?;
        self.end_index = index;
        self.positions.split_off(&(index + 1));
        self.write_header()?;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.end_index < self.start_index
    }

    fn remove(self) -> io::Result<()> {
        drop(self.file);
        fs::remove_file(&self.path)
    }
}

/// File-backed log built from fixed-capacity segments plus a snapshot file
/// written by compaction.
pub struct SegmentedLog {
    dir: PathBuf,
    segments: BTreeMap<u64, Segment>,
    snapshot: Option<(u64, Entry)>,
    entries_per_segment: u64,
}

impl SegmentedLog {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<SegmentedLog> {
        Self::with_capacity(dir, ENTRIES_PER_SEGMENT)
    }

    pub fn with_capacity<P: AsRef<Path>>(dir: P, entries_per_segment: u64) -> Result<SegmentedLog> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let snapshot = match fs::read(dir.join("snapshot")) {
            Ok(bytes) => Some(bincode::deserialize::<(u64, Entry)>(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut starts = Vec::new();
        for dirent in fs::read_dir(&dir)? {
            let name = dirent?.file_name();
            let name = name.to_string_lossy();
            if let Some(start) = name
                .strip_prefix("segment_")
                .and_then(|n| n.strip_suffix(".log"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                starts.push(start);
            }
        }
        starts.sort_unstable();

        let mut segments = BTreeMap::new();
        for start in starts {
            let segment = Segment::open(dir.join(format!("segment_{}.log", start)), start)?;
            segments.insert(start, segment);
        }

        Ok(SegmentedLog {
            dir,
            segments,
            snapshot,
            entries_per_segment,
        })
    }

    fn segment_for_append(&mut self, index: u64) -> Result<&mut Segment> {
        let rollover = match self.segments.values().next_back() {
            Some(segment) => index - segment.start_index >= self.entries_per_segment,
            None => true,
        };
        if rollover {
            let segment = Segment::open(self.dir.join(format!("segment_{}.log", index)), index)?;
            self.segments.insert(index, segment);
        }
        Ok(self.segments.values_mut().next_back().unwrap())
    }
}

impl RaftLog for SegmentedLog {
    fn append(&mut self, entries: Vec<Entry>) -> Result<u64> {
        let mut index = self.last_index();
        for entry in &entries {
            index += 1;
            let frame = bincode::serialize(entry)?;
            let segment = self.segment_for_append(index)?;
            segment.append(&[frame])?;
        }
        Ok(self.last_index())
    }

    fn get(&mut self, index: u64) -> Result<Option<Entry>> {
        if let Some((snap_index, entry)) = &self.snapshot {
            if index == *snap_index {
                return Ok(Some(entry.clone()));
            }
            if index < *snap_index {
                return Ok(None);
            }
        }
        let segment = match self.segments.range_mut(..=index).next_back() {
            Some((_, segment)) if segment.end_index >= index && segment.start_index <= index => {
                segment
            }
            _ => return Ok(None),
        };
        let frame = segment.read(index)?;
        Ok(Some(bincode::deserialize(&frame)?))
    }

    fn truncate(&mut self, index: u64) -> Result<()> {
        if index + 1 < self.first_index() {
            return Err(RaftError::Corrupt(format!(
                "cannot truncate to {} below first index {}",
                index,
                self.first_index()
            )));
        }
        let doomed: Vec<u64> = self
            .segments
            .range(index + 1..)
            .map(|(start, _)| *start)
            .collect();
        for start in doomed {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        let mut emptied = None;
        if let Some((start, segment)) = self.segments.iter_mut().next_back() {
            segment.truncate(index)?;
            if segment.is_empty() {
                emptied = Some(*start);
            }
        }
        if let Some(start) = emptied {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        Ok(())
    }

    fn first_index(&self) -> u64 {
        match &self.snapshot {
            Some((index, _)) => *index,
            None => 1,
        }
    }

    fn last_index(&self) -> u64 {
        match self.segments.values().next_back() {
            Some(segment) => segment.end_index,
            None => self.snapshot.as_ref().map(|(i, _)| *i).unwrap_or(0),
        }
    }

    fn size(&self) -> u64 {
        let last = self.last_index();
        if last == 0 {
            0
        } else {
            last - self.first_index() + 1
        }
    }

    fn compact(&mut self, index: u64, snapshot: Entry) -> Result<()> {
        // Write through a temp file so a crash never leaves a torn snapshot.
        let bytes = bincode::serialize(&(index, &snapshot))?;
        let tmp = self.dir.join("snapshot.tmp");
        let path = self.dir.join("snapshot");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;
        self.snapshot = Some((index, snapshot));

        let covered: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, segment)| segment.end_index <= index)
            .map(|(start, _)| *start)
            .collect();
        for start in covered {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        Ok(())
    }
}
