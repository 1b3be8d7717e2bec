//! Binary learner container.
//!
//! A 32-byte header followed by a JSON payload holding the model and its
//! configuration. The header carries enough to reject foreign or damaged files
//! before the payload is parsed.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     Magic ("BLRN")
//! 4       1     Version major
//! 5       1     Version minor
//! 6       1     Booster type
//! 7       1     Reserved
//! 8       2     Flags
//! 10      2     Reserved
//! 12      4     Payload size (bytes)
//! 16      4     CRC32 of the payload
//! 20      4     Number of features
//! 24      4     Number of output groups
//! 28      4     Reserved
//! ```
//!
//! Integers are little-endian.

use std::io::{ErrorKind, Read, Write};

use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"BLRN";

pub const CURRENT_VERSION_MAJOR: u8 = 1;

pub const CURRENT_VERSION_MINOR: u8 = 0;

pub const HEADER_SIZE: usize = 32;

// =============================================================================
// Booster Type
// =============================================================================

/// Booster stored in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BoosterType {
    GbTree = 0,
    GbLinear = 1,
}

impl BoosterType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::GbTree),
            1 => Some(Self::GbLinear),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "gbtree" => Some(Self::GbTree),
            "gblinear" => Some(Self::GbLinear),
            _ => None,
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// Fixed-size container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub booster: BoosterType,
    pub flags: u16,
    pub payload_size: u32,
    pub checksum: u32,
    pub num_features: u32,
    pub num_groups: u32,
}

impl FormatHeader {
    /// Header at the current version; size and checksum are filled in on write.
    pub fn new(booster: BoosterType, num_features: u32, num_groups: u32) -> Self {
        Self {
            version_major: CURRENT_VERSION_MAJOR,
            version_minor: CURRENT_VERSION_MINOR,
            booster,
            flags: 0,
            payload_size: 0,
            checksum: 0,
            num_features,
            num_groups,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = self.version_major;
        buf[5] = self.version_minor;
        buf[6] = self.booster as u8;
        buf[8..10].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf[20..24].copy_from_slice(&self.num_features.to_le_bytes());
        buf[24..28].copy_from_slice(&self.num_groups.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self, FormatError> {
        if &buf[0..4] != MAGIC {
            return Err(FormatError::NotAModel);
        }
        let version_major = buf[4];
        let version_minor = buf[5];
        if version_major > CURRENT_VERSION_MAJOR {
            return Err(FormatError::UnsupportedVersion { major: version_major, minor: version_minor });
        }
        let booster = BoosterType::from_u8(buf[6]).ok_or(FormatError::UnknownBooster(buf[6]))?;
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        Ok(Self {
            version_major,
            version_minor,
            booster,
            flags: u16::from_le_bytes([buf[8], buf[9]]),
            payload_size: u32_at(12),
            checksum: u32_at(16),
            num_features: u32_at(20),
            num_groups: u32_at(24),
        })
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while reading or writing the binary container.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("not a learner model file")]
    NotAModel,

    #[error("model requires container version {major}.{minor} or later")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("unknown booster type {0} in header")]
    UnknownBooster(u8),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("file truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn compute_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

// =============================================================================
// Read / Write
// =============================================================================

/// Write `header` and `payload`, filling in the payload size and checksum.
pub fn write_container<W: Write>(
    writer: &mut W,
    header: &mut FormatHeader,
    payload: &[u8],
) -> Result<(), FormatError> {
    header.payload_size = u32::try_from(payload.len()).map_err(|_| {
        FormatError::Io(std::io::Error::new(ErrorKind::InvalidInput, "payload exceeds 4 GiB"))
    })?;
    header.checksum = compute_checksum(payload);
    writer.write_all(&header.to_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

/// Read a header and its payload, verifying the checksum.
pub fn read_container<R: Read>(reader: &mut R) -> Result<(FormatHeader, Vec<u8>), FormatError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    let got = read_full(reader, &mut header_buf)?;
    if got < HEADER_SIZE {
        if got >= MAGIC.len() && &header_buf[0..4] != MAGIC {
            return Err(FormatError::NotAModel);
        }
        return Err(FormatError::Truncated { expected: HEADER_SIZE, actual: got });
    }
    let header = FormatHeader::from_bytes(&header_buf)?;

    let expected = header.payload_size as usize;
    let mut payload = vec![0u8; expected];
    let got = read_full(reader, &mut payload)?;
    if got < expected {
        return Err(FormatError::Truncated { expected, actual: got });
    }

    let actual = compute_checksum(&payload);
    if actual != header.checksum {
        return Err(FormatError::ChecksumMismatch { expected: header.checksum, actual });
    }
    Ok((header, payload))
}

/// Fill `buf` as far as the reader allows, returning the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FormatError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(FormatError::Io(e)),
        }
    }
    Ok(filled)
}
