use crate::ops::StateOp;
use crate::types::MemberId;
use anyhow::{bail, Context as _, Result};
use fs_err::{self as fs, File, OpenOptions};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, trace, warn};

/// Identifies a revkv WAL file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub member_id: MemberId,
    pub created_at: i64,
}

impl WalHeader {
    const MAGIC: [u8; 4] = *b"RVKL";
    const VERSION: u32 = 1;

    pub fn new(member_id: MemberId) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            member_id,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn check(&self, member_id: MemberId) -> Result<()> {
        if self.magic != Self::MAGIC || self.version != Self::VERSION {
            bail!("WAL header is invalid");
        }
        if self.member_id != member_id {
            bail!(
                "WAL member_id mismatch: expected {}, found {}",
                member_id,
                self.member_id
            );
        }
        Ok(())
    }
}

/// One logged operation. The checksum covers the encoded op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub sequence: u64,
    pub op: StateOp,
    pub checksum: u32,
}

impl WalEntry {
    pub fn new(sequence: u64, op: StateOp) -> Result<Self> {
        let checksum = checksum(&op)?;
        Ok(Self {
            sequence,
            op,
            checksum,
        })
    }

    pub fn verify_checksum(&self) -> bool {
        checksum(&self.op).is_ok_and(|sum| sum == self.checksum)
    }
}

fn checksum(op: &StateOp) -> Result<u32> {
    let encoded = bincode::serde::encode_to_vec(op, bincode::config::standard())?;
    Ok(crc32fast::hash(&encoded))
}

/// Write a length-prefixed bincode frame
fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Read a length-prefixed bincode frame. `Ok(None)` at a clean or torn end of file.
fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("Failed to read WAL frame length"),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut bytes = vec![0u8; len];
    match reader.read_exact(&mut bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
            warn!("Encountered truncated WAL frame (expected {len} bytes); stopping replay");
            return Ok(None);
        }
        Err(err) => return Err(err).context("Failed to read WAL frame"),
    }
    let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
        .context("Failed to decode WAL frame")?;
    Ok(Some(value))
}

/// Append-only log of state operations, replayed on startup
pub struct WriteAheadLog {
    file_path: PathBuf,
    writer: Option<BufWriter<File>>,
    sequence: u64,
    member_id: MemberId,
}

impl WriteAheadLog {
    /// Create or open a WAL file
    pub fn new<P: AsRef<Path>>(file_path: P, member_id: MemberId) -> Result<Self> {
        let mut wal = Self {
            file_path: file_path.as_ref().to_path_buf(),
            writer: None,
            sequence: 0,
            member_id,
        };
        wal.open_for_writing()?;
        Ok(wal)
    }

    fn open_for_writing(&mut self) -> Result<()> {
        if self.file_path.exists() {
            // Existing file: the next sequence continues after the last valid entry
            let (ops_seen, last_sequence) = self.scan()?;
            self.sequence = last_sequence;
            info!(
                "Opened existing WAL file: {:?}, {} ops, last sequence: {}",
                self.file_path, ops_seen, self.sequence
            );
            let file = OpenOptions::new().append(true).open(&self.file_path)?;
            self.writer = Some(BufWriter::new(file));
            return Ok(());
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let mut writer = BufWriter::new(file);
        write_frame(&mut writer, &WalHeader::new(self.member_id))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        info!("Created new WAL file: {:?}", self.file_path);
        self.writer = Some(writer);
        Ok(())
    }

    /// Count valid entries and find the last sequence number
    fn scan(&self) -> Result<(usize, u64)> {
        let mut reader = BufReader::new(File::open(&self.file_path)?);
        let header: WalHeader = read_frame(&mut reader)?.context("WAL file has no header")?;
        header.check(self.member_id)?;

        let mut count = 0;
        let mut last_sequence = 0;
        while let Some(entry) = read_frame::<_, WalEntry>(&mut reader)? {
            if !entry.verify_checksum() {
                warn!("Corrupted WAL entry found, sequence: {}", entry.sequence);
                break;
            }
            count += 1;
            last_sequence = entry.sequence;
        }
        Ok((count, last_sequence))
    }

    /// Write a state operation to the WAL
    pub fn write_op(&mut self, op: &StateOp) -> Result<()> {
        self.write_ops(std::slice::from_ref(op))
    }

    /// Write multiple state operations to the WAL in a single fsync
    pub fn write_ops(&mut self, ops: &[StateOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let Some(writer) = self.writer.as_mut() else {
            bail!("WAL writer not initialized");
        };
        for op in ops {
            self.sequence += 1;
            write_frame(writer, &WalEntry::new(self.sequence, op.clone())?)?;
            trace!("Wrote WAL op: sequence={}, op={op:?}", self.sequence);
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Read all state operations from the WAL for recovery
    pub fn read_all_ops(&self) -> Result<Vec<StateOp>> {
        let mut reader = BufReader::new(File::open(&self.file_path)?);
        let header: WalHeader = read_frame(&mut reader)?.context("WAL file has no header")?;
        header.check(self.member_id)?;

        let mut ops = Vec::new();
        while let Some(entry) = read_frame::<_, WalEntry>(&mut reader)? {
            if !entry.verify_checksum() {
                bail!("WAL entry {} corrupted", entry.sequence);
            }
            ops.push(entry.op);
        }
        info!("Read {} ops from WAL: {:?}", ops.len(), self.file_path);
        Ok(ops)
    }

    /// Close the WAL and ensure all data is flushed
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            info!("Closed WAL: {:?}", self.file_path);
        }
        Ok(())
    }

    /// Truncate the WAL after a snapshot made its contents redundant
    pub fn reset(&mut self) -> Result<()> {
        self.close()?;
        if let Err(err) = fs::remove_file(&self.file_path) {
            if err.kind() != ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        self.sequence = 0;
        self.open_for_writing()
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Error closing WAL in drop: {e}");
        }
    }
}
