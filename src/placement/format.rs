//! Placement record on-disk format.
//!
//! # Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐  0
//! │ CHECKSUM: u32 (CRC-32/iSCSI of bytes 4..)        │
//! ├─────────────────────────────────────────────────┤  4
//! │ MAGIC: u32 = 0xC000FEEE                          │
//! │ HEADER_SIZE: u32 = 512                           │
//! │ OFFSET_BEGIN: u32 = 4                            │
//! │ OFFSET_END: u32 = 512                            │
//! │ RECORD_SIZE: u32 = 3584                          │
//! │ MAJOR: u16 = 1, MINOR: u16 = 0                   │
//! │ DATA_OFFSET: u32 = 512                           │
//! │ padding (0xff) up to 512                         │
//! ├─────────────────────────────────────────────────┤  512
//! │ OLT: [tier][shard] u16 disk id   (2 x 256 x 2)   │
//! ├─────────────────────────────────────────────────┤  1536
//! │ TOKEN STATE: [tier][shard] {flags u8, file u16}  │
//! ├─────────────────────────────────────────────────┤  3072
//! │ OWNERSHIP VERSION: u64                           │
//! │ RESYNC PENDING: u8                               │
//! │ padding (0xff) up to 3584                        │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The record is sector aligned. A record
//! is trusted only after its checksum matches and every header field equals
//! the value above; there is no version negotiation.

use super::olt::ObjectLocationTable;
use super::token_table::{TokenDescriptor, TokenStateTable};
use crate::types::{DataTier, OwnershipVersion, INVALID_VERSION, SHARD_COUNT};
use crc::{Crc, CRC_32_ISCSI};

/// Magic value of a placement record.
pub const MAGIC: u32 = 0xC000_FEEE;

/// Major format version.
pub const MAJOR_VERSION: u16 = 1;

/// Minor format version.
pub const MINOR_VERSION: u16 = 0;

/// Sector size the record is aligned to.
pub const SECTOR_SIZE: usize = 512;

/// Header size in bytes.
pub const HEADER_SIZE: usize = SECTOR_SIZE;

/// Offset of the first checksummed byte.
pub const OFFSET_BEGIN: usize = 4;

/// Size of the encoded object location table.
pub const OLT_SIZE: usize = 2 * SHARD_COUNT * 2;

/// Size of one encoded token descriptor.
pub const TOKEN_DESC_SIZE: usize = 3;

/// Size of the encoded token state table.
pub const TOKEN_TABLE_SIZE: usize = 2 * SHARD_COUNT * TOKEN_DESC_SIZE;

/// Bytes used by the data section before padding.
const DATA_USED: usize = OLT_SIZE + TOKEN_TABLE_SIZE + 8 + 1;

/// Total record size, rounded up to a whole sector.
pub const RECORD_SIZE: usize =
    (HEADER_SIZE + DATA_USED + SECTOR_SIZE - 1) / SECTOR_SIZE * SECTOR_SIZE;

/// Fill pattern of unused bytes.
const POISON: u8 = 0xff;

/// CRC-32 calculator (iSCSI polynomial)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const TOKEN_FLAG_VALID: u8 = 1 << 0;
const TOKEN_FLAG_COMPACTING: u8 = 1 << 1;

/// Fixed header of a placement record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: u32,
    pub header_size: u32,
    pub offset_begin: u32,
    pub offset_end: u32,
    pub record_size: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub data_offset: u32,
}

impl RecordHeader {
    /// The only header this build accepts.
    pub fn current() -> Self {
        Self {
            magic: MAGIC,
            header_size: HEADER_SIZE as u32,
            offset_begin: OFFSET_BEGIN as u32,
            offset_end: HEADER_SIZE as u32,
            record_size: RECORD_SIZE as u32,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            data_offset: HEADER_SIZE as u32,
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[4..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..12].copy_from_slice(&self.header_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.offset_begin.to_le_bytes());
        buf[16..20].copy_from_slice(&self.offset_end.to_le_bytes());
        buf[20..24].copy_from_slice(&self.record_size.to_le_bytes());
        buf[24..26].copy_from_slice(&self.major_version.to_le_bytes());
        buf[26..28].copy_from_slice(&self.minor_version.to_le_bytes());
        buf[28..32].copy_from_slice(&self.data_offset.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            magic: read_u32(buf, 4),
            header_size: read_u32(buf, 8),
            offset_begin: read_u32(buf, 12),
            offset_end: read_u32(buf, 16),
            record_size: read_u32(buf, 20),
            major_version: read_u16(buf, 24),
            minor_version: read_u16(buf, 26),
            data_offset: read_u32(buf, 28),
        }
    }

    /// Check every field against [`RecordHeader::current`].
    pub fn validate(&self) -> Result<(), FormatError> {
        let expected = Self::current();
        if self.magic != expected.magic {
            return Err(FormatError::InvalidMagic(self.magic));
        }
        if self.major_version != expected.major_version
            || self.minor_version != expected.minor_version
        {
            return Err(FormatError::UnsupportedVersion {
                major: self.major_version,
                minor: self.minor_version,
            });
        }
        if *self != expected {
            return Err(FormatError::InvalidHeader(format!(
                "expected {:?}, found {:?}",
                expected, self
            )));
        }
        Ok(())
    }
}

/// Persisted placement state of one node.
#[derive(Debug, Clone)]
pub struct PlacementRecord {
    /// Stored checksum; refreshed by [`PlacementRecord::seal`].
    pub checksum: u32,
    pub header: RecordHeader,
    pub olt: ObjectLocationTable,
    pub tokens: TokenStateTable,
    /// Last applied ownership table version.
    pub version: OwnershipVersion,
    /// Set when a disk was lost and owned data must be re-synced from peers.
    pub resync_pending: bool,
}

impl Default for PlacementRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementRecord {
    /// Create an empty, sealed record.
    pub fn new() -> Self {
        let mut record = Self {
            checksum: 0,
            header: RecordHeader::current(),
            olt: ObjectLocationTable::new(),
            tokens: TokenStateTable::new(),
            version: INVALID_VERSION,
            resync_pending: false,
        };
        record.seal();
        record
    }

    /// Compute the checksum of the current contents.
    pub fn compute_checksum(&self) -> u32 {
        let buf = self.to_bytes();
        CRC32.checksum(&buf[OFFSET_BEGIN..])
    }

    /// Store the checksum of the current contents.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Checksum first, then the header.
    pub fn validate(&self) -> Result<(), FormatError> {
        let actual = self.compute_checksum();
        if actual != self.checksum {
            return Err(FormatError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        self.header.validate()
    }

    /// Encode to the fixed layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![POISON; RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        self.header.write_to(&mut buf);

        let mut pos = HEADER_SIZE;
        for tier in DataTier::ALL {
            for shard in 0..SHARD_COUNT as u32 {
                let disk = self.olt.disk_id(shard, tier);
                buf[pos..pos + 2].copy_from_slice(&disk.to_le_bytes());
                pos += 2;
            }
        }
        for tier in DataTier::ALL {
            for shard in 0..SHARD_COUNT as u32 {
                let desc = self.tokens.descriptor(shard, tier);
                let mut flags = 0u8;
                if desc.valid {
                    flags |= TOKEN_FLAG_VALID;
                }
                if desc.compaction_in_progress {
                    flags |= TOKEN_FLAG_COMPACTING;
                }
                buf[pos] = flags;
                buf[pos + 1..pos + 3].copy_from_slice(&desc.write_file_id.to_le_bytes());
                pos += TOKEN_DESC_SIZE;
            }
        }
        buf[pos..pos + 8].copy_from_slice(&self.version.to_le_bytes());
        pos += 8;
        buf[pos] = u8::from(self.resync_pending);
        buf
    }

    /// Decode and validate a record.
    ///
    /// The checksum is verified over the raw bytes before any field is trusted.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < RECORD_SIZE {
            return Err(FormatError::UnexpectedEof {
                expected: RECORD_SIZE,
                actual: buf.len(),
            });
        }
        if buf.len() > RECORD_SIZE {
            return Err(FormatError::InvalidHeader(format!(
                "record is {} bytes, expected {}",
                buf.len(),
                RECORD_SIZE
            )));
        }

        let stored = read_u32(buf, 0);
        let actual = CRC32.checksum(&buf[OFFSET_BEGIN..]);
        if stored != actual {
            return Err(FormatError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        let header = RecordHeader::read_from(buf);
        header.validate()?;

        let mut olt = ObjectLocationTable::new();
        let mut pos = HEADER_SIZE;
        for tier in DataTier::ALL {
            for shard in 0..SHARD_COUNT as u32 {
                olt.set_disk_id(shard, tier, read_u16(buf, pos));
                pos += 2;
            }
        }

        let mut tokens = TokenStateTable::new();
        for tier in DataTier::ALL {
            for shard in 0..SHARD_COUNT as u32 {
                let flags = buf[pos];
                tokens.set_descriptor(
                    shard,
                    tier,
                    TokenDescriptor {
                        valid: flags & TOKEN_FLAG_VALID != 0,
                        compaction_in_progress: flags & TOKEN_FLAG_COMPACTING != 0,
                        write_file_id: read_u16(buf, pos + 1),
                    },
                );
                pos += TOKEN_DESC_SIZE;
            }
        }

        let version = read_u64(buf, pos);
        pos += 8;
        let resync_pending = buf[pos] != 0;

        Ok(Self {
            checksum: stored,
            header,
            olt,
            tokens,
            version,
            resync_pending,
        })
    }
}

/// Records are equal iff their encodings are byte-identical.
impl PartialEq for PlacementRecord {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PlacementRecord {}

fn read_u16(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(b)
}

/// Format-related errors
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),

    #[error("unsupported version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("unexpected end of record: expected {expected} bytes, got {actual}")]
    UnexpectedEof { expected: usize, actual: usize },

    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
