//! Durable replica metadata: current term, last vote and the latest
//! cluster configuration.
//!
//! The `<name>.meta` record is always file-backed: Raft safety forbids
//! losing `<term, vote>` no matter what storage level the log runs at.
//! Only the `<name>.conf` configuration record honors the memory level.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;
use crate::raft::entry::Configuration;
use crate::raft::StorageLevel;

// Metadata region: u64 LE term at offset 0, u16 LE vote length at offset 8,
// vote bytes after. The file never shrinks below 12 bytes.
const META_LEN: u64 = 12;
const VOTE_OFFSET: u64 = 8;

pub struct MetaStore {
    metadata: File,
    configuration: ConfigurationRecord,
}

enum ConfigurationRecord {
    Memory(Vec<u8>),
    File(File),
}

impl MetaStore {
    /// Opens or creates the metadata records under `directory`.
    pub fn new<P: AsRef<Path>>(directory: P, name: &str, level: StorageLevel) -> Result<MetaStore> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;

        let metadata = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(directory.join(format!("{}.meta", name)))?;
        if metadata.metadata()?.len() < META_LEN {
            metadata.set_len(META_LEN)?;
        }

        let configuration = match level {
            StorageLevel::Memory => ConfigurationRecord::Memory(Vec::new()),
            StorageLevel::Disk => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(directory.join(format!("{}.conf", name)))?;
                ConfigurationRecord::File(file)
            }
        };

        Ok(MetaStore {
            metadata,
            configuration,
        })
    }

    /// Overwrites the term slot and flushes before returning.
    pub fn store_term(&mut self, term: u64) -> Result<()> {
        log::trace!("store term {}", term);
        self.metadata.seek(SeekFrom::Start(0))?;
        self.metadata.write_all(&term.to_le_bytes())?;
        self.metadata.sync_all()?;
        Ok(())
    }

    /// Reads the stored term; 0 if it was never written.
    pub fn load_term(&mut self) -> Result<u64> {
        self.metadata.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 8];
        self.metadata.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Overwrites the vote slot (length-prefixed string, nullable) and
    /// flushes before returning.
    pub fn store_vote(&mut self, vote: Option<&str>) -> Result<()> {
        log::trace!("store vote {:?}", vote);
        let bytes = vote.map(|v| v.as_bytes()).unwrap_or_default();
        self.metadata.seek(SeekFrom::Start(VOTE_OFFSET))?;
        self.metadata
            .write_all(&(bytes.len() as u16).to_le_bytes())?;
        self.metadata.write_all(bytes)?;
        self.metadata
            .set_len(META_LEN.max(VOTE_OFFSET + 2 + bytes.len() as u64))?;
        self.metadata.sync_all()?;
        Ok(())
    }

    /// Reads the stored vote or `None`.
    pub fn load_vote(&mut self) -> Result<Option<String>> {
        self.metadata.seek(SeekFrom::Start(VOTE_OFFSET))?;
        let mut len = [0u8; 2];
        self.metadata.read_exact(&mut len)?;
        let len = u16::from_le_bytes(len) as usize;
        if len == 0 {
            return Ok(None);
        }
        let mut bytes = vec![0u8; len];
        self.metadata.read_exact(&mut bytes)?;
        Ok(Some(String::from_utf8(bytes).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e)
        })?))
    }

    /// Serializes and overwrites the configuration record, then flushes.
    pub fn store_configuration(&mut self, configuration: &Configuration) -> Result<()> {
        log::trace!("store configuration {:?}", configuration);
        let bytes = bincode::serialize(configuration)?;
        let mut record = Vec::with_capacity(5 + bytes.len());
        record.push(1u8);
        record.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        record.extend_from_slice(&bytes);

        match &mut self.configuration {
            ConfigurationRecord::Memory(buffer) => *buffer = record,
            ConfigurationRecord::File(file) => {
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&record)?;
                file.set_len(record.len() as u64)?;
                file.sync_all()?;
            }
        }
        Ok(())
    }

    /// Loads the configuration record; `None` when the presence byte is 0
    /// or the record was never written.
    pub fn load_configuration(&mut self) -> Result<Option<Configuration>> {
        let record = match &mut self.configuration {
            ConfigurationRecord::Memory(buffer) => buffer.clone(),
            ConfigurationRecord::File(file) => {
                let mut buffer = Vec::new();
                file.seek(SeekFrom::Start(0))?;
                file.read_to_end(&mut buffer)?;
                buffer
            }
        };
        if record.len() < 5 || record[0] == 0 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([record[1], record[2], record[3], record[4]]) as usize;
        let bytes = &record[5..5 + len];
        Ok(Some(bincode::deserialize(bytes)?))
    }
}
