//! Disk I/O for family files
//!
//! A family lives in one directory as a non-state file `<root>A` holding the
//! header, parameter data and the directory blob, plus state files
//! `<root>00`, `<root>01`, ... holding time-step records:
//!
//! ```text
//! [srec id: u32][time: f64][payload length: u64][payload bytes]
//! ```
//!
//! All integers are little-endian. A record cut short by an interrupted
//! write is ignored when the state files are scanned.

use crate::error::{MiliError, Result};
use crate::header::{Header, HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Bytes of the per-record prefix in a state file
pub const STATE_RECORD_PREFIX: usize = 20;

/// Random-access byte storage behind a directory
pub trait ByteStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
}

fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(MiliError::ShortRead {
                    expected: buf.len(),
                    actual: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn write_all_at(file: &mut File, offset: u64, data: &[u8], path: &Path) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data).map_err(|e| match e.kind() {
        ErrorKind::WriteZero => MiliError::ShortWrite(format!(
            "{} bytes at offset {} in {}",
            data.len(),
            offset,
            path.display()
        )),
        _ => MiliError::Io(e),
    })
}

pub fn non_state_path(dir: &Path, root: &str) -> PathBuf {
    dir.join(format!("{}A", root))
}

pub fn state_path(dir: &Path, root: &str, index: usize) -> PathBuf {
    dir.join(format!("{}{:02}", root, index))
}

/// Non-state file of a family
pub struct NonStateFile {
    file: File,
    path: PathBuf,
}

impl NonStateFile {
    /// Create (or truncate) a non-state file and write its header
    pub fn create<P: AsRef<Path>>(path: P, header: &Header) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(&header.to_bytes())?;
        file.flush()?;

        Ok(NonStateFile {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open an existing non-state file
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;

        Ok(NonStateFile {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn read_header(&mut self) -> Result<Header> {
        let mut buffer = vec![0u8; HEADER_SIZE];
        read_exact_at(&mut self.file, 0, &mut buffer)?;
        Header::from_bytes(&buffer)
    }

    pub fn write_header(&mut self, header: &Header) -> Result<()> {
        write_all_at(&mut self.file, 0, &header.to_bytes(), &self.path)?;
        self.file.flush()?;
        Ok(())
    }

    /// Drop everything past `len`
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl ByteStore for NonStateFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at(&mut self.file, offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        write_all_at(&mut self.file, offset, data, &self.path)
    }
}

/// In-memory store for directory tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemStore {
    pub bytes: Vec<u8>,
}

#[cfg(test)]
impl ByteStore for MemStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let available = self.bytes.len().saturating_sub(start);
        if available < buf.len() {
            return Err(MiliError::ShortRead {
                expected: buf.len(),
                actual: available,
            });
        }
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = offset as usize;
        if self.bytes.len() < start + data.len() {
            self.bytes.resize(start + data.len(), 0);
        }
        self.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Location of one state record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateLocation {
    pub file: usize,
    /// Offset of the payload inside its state file
    pub offset: u64,
    pub len: u64,
    pub srec_id: usize,
    pub time: f64,
}

/// State files of a family
pub struct StateFiles {
    dir: PathBuf,
    root: String,
    states_per_file: usize,
    records: Vec<StateLocation>,
    handles: Vec<Option<Handle>>,
}

struct Handle {
    file: File,
    writable: bool,
}

impl StateFiles {
    /// Scan existing state files
    pub fn open(dir: &Path, root: &str, states_per_file: usize) -> Result<Self> {
        let mut files = StateFiles {
            dir: dir.to_path_buf(),
            root: root.to_string(),
            states_per_file,
            records: Vec::new(),
            handles: Vec::new(),
        };
        files.rescan()?;
        Ok(files)
    }

    /// Remove all existing state files and start empty
    pub fn create(dir: &Path, root: &str, states_per_file: usize) -> Result<Self> {
        let mut index = 0;
        loop {
            let path = state_path(dir, root, index);
            if !path.exists() {
                break;
            }
            std::fs::remove_file(&path)?;
            index += 1;
        }
        Ok(StateFiles {
            dir: dir.to_path_buf(),
            root: root.to_string(),
            states_per_file,
            records: Vec::new(),
            handles: Vec::new(),
        })
    }

    /// Re-read the state files to pick up records appended by another writer
    pub fn rescan(&mut self) -> Result<()> {
        self.records.clear();
        self.handles.clear();

        let mut index = 0;
        loop {
            let path = state_path(&self.dir, &self.root, index);
            if !path.exists() {
                break;
            }
            let mut file = File::open(&path)?;
            let file_len = file.metadata()?.len();
            let mut pos = 0u64;
            while pos + STATE_RECORD_PREFIX as u64 <= file_len {
                let mut prefix = [0u8; STATE_RECORD_PREFIX];
                read_exact_at(&mut file, pos, &mut prefix)?;
                let (srec_id, time, len) = parse_prefix(&prefix);
                let payload = pos + STATE_RECORD_PREFIX as u64;
                if payload + len > file_len {
                    break;
                }
                self.records.push(StateLocation {
                    file: index,
                    offset: payload,
                    len,
                    srec_id: srec_id as usize,
                    time,
                });
                pos = payload + len;
            }
            self.handles.push(None);
            index += 1;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn states_per_file(&self) -> usize {
        self.states_per_file
    }

    pub fn location(&self, state: usize) -> Result<&StateLocation> {
        self.records.get(state).ok_or(MiliError::InvalidStateIndex {
            index: state,
            count: self.records.len(),
        })
    }

    pub fn times(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.time).collect()
    }

    fn handle(&mut self, index: usize, writable: bool) -> Result<&mut File> {
        if self.handles.len() <= index {
            self.handles.resize_with(index + 1, || None);
        }
        let slot = &mut self.handles[index];
        if slot.as_ref().map_or(true, |h| writable && !h.writable) {
            let path = state_path(&self.dir, &self.root, index);
            let file = if writable {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?
            } else {
                File::open(&path)?
            };
            *slot = Some(Handle { file, writable });
        }
        slot.as_mut()
            .map(|h| &mut h.file)
            .ok_or_else(|| MiliError::Corrupted("state file handle unavailable".to_string()))
    }

    /// Read part of a state record's payload
    pub fn read_payload(&mut self, state: usize, start: usize, buf: &mut [u8]) -> Result<()> {
        let loc = *self.location(state)?;
        if start + buf.len() > loc.len as usize {
            return Err(MiliError::ShortRead {
                expected: start + buf.len(),
                actual: loc.len as usize,
            });
        }
        let file = self.handle(loc.file, false)?;
        read_exact_at(file, loc.offset + start as u64, buf)
    }

    /// Append a state record, rolling over to a new file when full
    pub fn append(&mut self, srec_id: usize, time: f64, payload: &[u8]) -> Result<usize> {
        let file_index = if self.states_per_file > 0 {
            self.records.len() / self.states_per_file
        } else {
            0
        };
        let pos = self
            .records
            .iter()
            .rev()
            .find(|r| r.file == file_index)
            .map_or(0, |r| r.offset + r.len);

        let mut record = Vec::with_capacity(STATE_RECORD_PREFIX + payload.len());
        record.extend_from_slice(&(srec_id as u32).to_le_bytes());
        record.extend_from_slice(&time.to_le_bytes());
        record.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        record.extend_from_slice(payload);

        let path = state_path(&self.dir, &self.root, file_index);
        let file = self.handle(file_index, true)?;
        file.set_len(pos)?;
        write_all_at(file, pos, &record, &path)?;
        file.flush()?;

        self.records.push(StateLocation {
            file: file_index,
            offset: pos + STATE_RECORD_PREFIX as u64,
            len: payload.len() as u64,
            srec_id,
            time,
        });
        Ok(self.records.len() - 1)
    }

    pub fn sync(&mut self) -> Result<()> {
        for handle in self.handles.iter_mut().flatten() {
            if handle.writable {
                handle.file.sync_all()?;
            }
        }
        Ok(())
    }
}

fn parse_prefix(prefix: &[u8; STATE_RECORD_PREFIX]) -> (u32, f64, u64) {
    let mut raw4 = [0u8; 4];
    raw4.copy_from_slice(&prefix[0..4]);
    let mut raw8 = [0u8; 8];
    raw8.copy_from_slice(&prefix[4..12]);
    let time = f64::from_le_bytes(raw8);
    raw8.copy_from_slice(&prefix[12..20]);
    (u32::from_le_bytes(raw4), time, u64::from_le_bytes(raw8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::Precision;
    use tempfile::tempdir;

    #[test]
    fn test_non_state_header_round_trip() {
        let dir = tempdir().unwrap();
        let path = non_state_path(dir.path(), "run");
        let header = Header::new(Precision::Double, 0);
        let mut file = NonStateFile::create(&path, &header).unwrap();
        assert_eq!(file.read_header().unwrap(), header);

        file.write_at(HEADER_SIZE as u64, b"payload").unwrap();
        let mut buf = [0u8; 7];
        file.read_at(HEADER_SIZE as u64, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_short_read() {
        let dir = tempdir().unwrap();
        let path = non_state_path(dir.path(), "run");
        let mut file = NonStateFile::create(&path, &Header::new(Precision::Single, 0)).unwrap();

        let mut buf = [0u8; 64];
        let err = file.read_at(HEADER_SIZE as u64 - 16, &mut buf).unwrap_err();
        assert!(matches!(err, MiliError::ShortRead { expected: 64, actual: 16 }));
    }

    #[test]
    fn test_state_append_and_rescan() {
        let dir = tempdir().unwrap();
        let mut states = StateFiles::create(dir.path(), "run", 2).unwrap();
        for i in 0..5 {
            states.append(0, i as f64 * 0.5, &[i as u8; 3]).unwrap();
        }
        assert_eq!(states.len(), 5);
        assert_eq!(states.location(4).unwrap().file, 2);

        let mut reopened = StateFiles::open(dir.path(), "run", 2).unwrap();
        assert_eq!(reopened.times(), vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        let mut buf = [0u8; 2];
        reopened.read_payload(3, 1, &mut buf).unwrap();
        assert_eq!(buf, [3, 3]);
        assert!(matches!(
            reopened.location(5),
            Err(MiliError::InvalidStateIndex { index: 5, count: 5 })
        ));
    }

    #[test]
    fn test_torn_record_ignored() {
        let dir = tempdir().unwrap();
        let mut states = StateFiles::create(dir.path(), "run", 0).unwrap();
        states.append(0, 0.0, &[1, 2, 3, 4]).unwrap();
        states.append(0, 1.0, &[5, 6, 7, 8]).unwrap();

        let path = state_path(dir.path(), "run", 0);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();

        let mut reopened = StateFiles::open(dir.path(), "run", 0).unwrap();
        assert_eq!(reopened.len(), 1);

        // Appending after a torn record overwrites it
        reopened.append(0, 1.0, &[9, 9, 9, 9]).unwrap();
        let rescanned = StateFiles::open(dir.path(), "run", 0).unwrap();
        assert_eq!(rescanned.len(), 2);
    }
}
