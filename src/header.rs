use crate::error::{MiliError, Result};
use crate::numeric::Precision;
use semver::{Version, VersionReq};

pub const MAGIC: [u8; 8] = *b"MILI\x00\x02\x00\x00";
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 1;
/// Bytes reserved for the header at the start of the non-state file
pub const HEADER_SIZE: usize = 512;

/// Readers accept any header within the same major format version
const COMPATIBLE: &str = "^2";

/// Family header (start of the non-state file)
///
/// Locates the serialized directory and definitions blob and carries the
/// family-wide settings needed before that blob is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Magic number: "MILI\x00\x02\x00\x00"
    pub magic: [u8; 8],

    pub version_major: u16,

    pub version_minor: u16,

    /// Geometry precision of the family
    pub precision: Precision,

    /// State records per state file (0 = unlimited)
    pub states_per_file: u32,

    /// Byte offset of the directory blob
    pub directory_offset: u64,

    /// Byte length of the directory blob
    pub directory_len: u64,

    /// CRC32 of the directory blob
    pub checksum: u32,
}

impl Header {
    pub fn new(precision: Precision, states_per_file: u32) -> Self {
        Header {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            precision,
            states_per_file,
            directory_offset: 0,
            directory_len: 0,
            checksum: 0,
        }
    }

    pub fn version(&self) -> Version {
        Version::new(self.version_major as u64, self.version_minor as u64, 0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(MiliError::InvalidMagic);
        }
        let req = VersionReq::parse(COMPATIBLE)
            .map_err(|e| MiliError::UnsupportedVersion(e.to_string()))?;
        if !req.matches(&self.version()) {
            return Err(MiliError::UnsupportedVersion(self.version().to_string()));
        }
        Ok(())
    }

    /// Record a freshly written directory blob
    pub fn seal(&mut self, offset: u64, blob: &[u8]) {
        self.directory_offset = offset;
        self.directory_len = blob.len() as u64;
        self.checksum = crc32fast::hash(blob);
    }

    /// Check a directory blob against the stored checksum
    pub fn verify_blob(&self, blob: &[u8]) -> Result<()> {
        let actual = crc32fast::hash(blob);
        if actual != self.checksum {
            return Err(MiliError::Corrupted(format!(
                "directory checksum mismatch: stored {:08x}, computed {:08x}",
                self.checksum, actual
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version_major.to_le_bytes());
        bytes.extend_from_slice(&self.version_minor.to_le_bytes());
        bytes.push(self.precision as u8);
        bytes.extend_from_slice(&[0u8; 3]);
        bytes.extend_from_slice(&self.states_per_file.to_le_bytes());
        bytes.extend_from_slice(&self.directory_offset.to_le_bytes());
        bytes.extend_from_slice(&self.directory_len.to_le_bytes());
        bytes.extend_from_slice(&self.checksum.to_le_bytes());

        bytes.resize(HEADER_SIZE, 0);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(MiliError::ShortRead {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != MAGIC {
            return Err(MiliError::InvalidMagic);
        }

        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        let precision = Precision::from_u8(bytes[12])
            .ok_or_else(|| MiliError::Corrupted(format!("unknown precision {}", bytes[12])))?;

        let header = Header {
            magic,
            version_major: u16_at(8),
            version_minor: u16_at(10),
            precision,
            states_per_file: u32_at(16),
            directory_offset: u64_at(20),
            directory_len: u64_at(28),
            checksum: u32_at(36),
        };

        header.validate()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_creation() {
        let header = Header::new(Precision::Double, 10);
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version_major, VERSION_MAJOR);
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_header_serialization() {
        let mut header = Header::new(Precision::Single, 0);
        header.seal(4096, b"{\"entries\":[]}");

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let back = Header::from_bytes(&bytes).unwrap();
        assert_eq!(back, header);
        assert!(back.verify_blob(b"{\"entries\":[]}").is_ok());
        assert!(matches!(
            back.verify_blob(b"{\"entries\":[1]}"),
            Err(MiliError::Corrupted(_))
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let mut header = Header::new(Precision::Single, 0);
        header.magic = *b"BADMAGIC";
        assert!(matches!(header.validate(), Err(MiliError::InvalidMagic)));
        assert!(matches!(
            Header::from_bytes(&header.to_bytes()),
            Err(MiliError::InvalidMagic)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut header = Header::new(Precision::Single, 0);
        header.version_major = 1;
        assert!(matches!(
            header.validate(),
            Err(MiliError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_short_header() {
        assert!(matches!(
            Header::from_bytes(&[0u8; 16]),
            Err(MiliError::ShortRead { expected: HEADER_SIZE, .. })
        ));
    }
}
