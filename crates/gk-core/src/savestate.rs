//! Savestate stream primitives
//!
//! A savestate is a header followed by tagged sections:
//!
//! ```text
//! Offset | Size | Description
//! -------|------|------------
//! 0x00   | 8    | Magic "GKSTATE\0"
//! 0x08   | 4    | Format version (LE)
//! 0x0C   | 4    | Flags (LE)
//! 0x10   | ...  | Sections: id[4], version u16, reserved u16, len u32, crc32 u32, payload
//! ```
//!
//! Parsing validates the header and every section frame (bounds, checksum,
//! duplicates) before handing payloads back, so callers can decode into
//! staging values and only then touch live state.

use std::collections::HashSet;
use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};

use crate::error::StateError;

/// Savestate magic
pub const STATE_MAGIC: &[u8; 8] = b"GKSTATE\0";
/// Current savestate format version
pub const STATE_VERSION: u32 = 1;
/// The RAM section payload is deflate-compressed
pub const FLAG_COMPRESSED_RAM: u32 = 1 << 0;

const HEADER_LEN: usize = 16;
const SECTION_HEADER_LEN: usize = 16;

/// Four-character section tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub [u8; 4]);

impl SectionId {
    pub const CPU: SectionId = SectionId(*b"CPU ");
    pub const JIT: SectionId = SectionId(*b"JITV");
    pub const TIMING: SectionId = SectionId(*b"TIME");
    pub const MMU: SectionId = SectionId(*b"MMU ");
    pub const HW: SectionId = SectionId(*b"HW  ");
    pub const RAM: SectionId = SectionId(*b"RAM ");

    /// Printable tag
    pub fn name(self) -> String {
        String::from_utf8_lossy(&self.0).trim_end().to_string()
    }
}

/// Little-endian write helpers
pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<(), StateError> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16_le(&mut self, v: u16) -> Result<(), StateError> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<(), StateError> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> Result<(), StateError> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_bool(&mut self, v: bool) -> Result<(), StateError> {
        self.write_u8(v as u8)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        self.write_all(bytes)?;
        Ok(())
    }

    fn write_string_u32(&mut self, s: &str) -> Result<(), StateError> {
        let len = u32::try_from(s.len())
            .map_err(|_| StateError::Corrupt("string length does not fit in u32".into()))?;
        self.write_u32_le(len)?;
        self.write_bytes(s.as_bytes())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

/// Little-endian read helpers
pub trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8, StateError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16, StateError> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32, StateError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64, StateError> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_bool(&mut self) -> Result<bool, StateError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(StateError::Corrupt(format!("invalid bool byte {other}"))),
        }
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>, StateError> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_string_u32(&mut self, max_len: usize) -> Result<String, StateError> {
        let len = self.read_u32_le()? as usize;
        if len > max_len {
            return Err(StateError::Corrupt(format!("string of {len} bytes exceeds {max_len}")));
        }
        let bytes = self.read_exact_vec(len)?;
        String::from_utf8(bytes).map_err(|_| StateError::Corrupt("string is not UTF-8".into()))
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

/// Fail unless a section payload has been fully consumed
pub fn expect_consumed(rest: &[u8], section: &'static str) -> Result<(), StateError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(StateError::Corrupt(format!(
            "{} trailing bytes in {section} section",
            rest.len()
        )))
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(bytes);
    crc.sum()
}

/// Builds a savestate stream section by section
pub struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    /// Start a stream with the given header flags
    pub fn new(flags: u32) -> Self {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(STATE_MAGIC);
        buf.extend_from_slice(&STATE_VERSION.to_le_bytes());
        buf.extend_from_slice(&flags.to_le_bytes());
        Self { buf }
    }

    /// Append a section whose payload is produced by `f`
    pub fn section(
        &mut self,
        id: SectionId,
        version: u16,
        f: impl FnOnce(&mut Vec<u8>) -> Result<(), StateError>,
    ) -> Result<(), StateError> {
        let mut payload = Vec::new();
        f(&mut payload)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| StateError::Corrupt(format!("section {} too large", id.name())))?;

        self.buf.extend_from_slice(&id.0);
        self.buf.write_u16_le(version)?;
        self.buf.write_u16_le(0)?;
        self.buf.write_u32_le(len)?;
        self.buf.write_u32_le(crc32(&payload))?;
        self.buf.extend_from_slice(&payload);
        Ok(())
    }

    /// Finish the stream
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Parsed savestate header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHeader {
    pub version: u32,
    pub flags: u32,
}

/// A validated section frame borrowing its payload from the stream
#[derive(Debug, Clone, Copy)]
pub struct RawSection<'a> {
    pub id: SectionId,
    pub version: u16,
    pub payload: &'a [u8],
}

/// A fully framed savestate
#[derive(Debug)]
pub struct ParsedState<'a> {
    pub header: StateHeader,
    sections: Vec<RawSection<'a>>,
}

impl<'a> ParsedState<'a> {
    /// Parse and validate a savestate stream without interpreting payloads
    pub fn parse(bytes: &'a [u8]) -> Result<Self, StateError> {
        if bytes.len() < HEADER_LEN {
            return Err(StateError::Truncated("header"));
        }
        if &bytes[..8] != STATE_MAGIC {
            return Err(StateError::InvalidMagic);
        }
        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: version,
                expected: STATE_VERSION,
            });
        }
        let flags = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

        let mut sections = Vec::new();
        let mut seen = HashSet::new();
        let mut offset = HEADER_LEN;
        while offset < bytes.len() {
            if bytes.len() - offset < SECTION_HEADER_LEN {
                return Err(StateError::Truncated("section header"));
            }
            let mut header = &bytes[offset..offset + SECTION_HEADER_LEN];
            let mut tag = [0u8; 4];
            header.read_exact(&mut tag)?;
            let id = SectionId(tag);
            let section_version = header.read_u16_le()?;
            let _reserved = header.read_u16_le()?;
            let len = header.read_u32_le()? as usize;
            let crc = header.read_u32_le()?;
            offset += SECTION_HEADER_LEN;

            if bytes.len() - offset < len {
                return Err(StateError::Truncated("section payload"));
            }
            let payload = &bytes[offset..offset + len];
            if crc32(payload) != crc {
                return Err(StateError::ChecksumMismatch(id.name()));
            }
            if !seen.insert(id) {
                return Err(StateError::DuplicateSection(id.name()));
            }
            sections.push(RawSection {
                id,
                version: section_version,
                payload,
            });
            offset += len;
        }

        Ok(Self {
            header: StateHeader { version, flags },
            sections,
        })
    }

    /// Look up a section by id
    pub fn section(&self, id: SectionId) -> Option<RawSection<'a>> {
        self.sections.iter().copied().find(|s| s.id == id)
    }

    /// Look up a mandatory section and check its version
    pub fn require(
        &self,
        id: SectionId,
        name: &'static str,
        version: u16,
    ) -> Result<&'a [u8], StateError> {
        let section = self.section(id).ok_or(StateError::MissingSection(name))?;
        if section.version != version {
            return Err(StateError::UnsupportedSectionVersion {
                section: name,
                found: section.version,
            });
        }
        Ok(section.payload)
    }

    /// All sections in stream order
    pub fn sections(&self) -> &[RawSection<'a>] {
        &self.sections
    }
}

/// Deflate a payload
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, StateError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Inflate a payload that must expand to exactly `expected_len` bytes
pub fn decompress(bytes: &[u8], expected_len: usize) -> Result<Vec<u8>, StateError> {
    let mut out = Vec::with_capacity(expected_len);
    DeflateDecoder::new(bytes)
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() != expected_len {
        return Err(StateError::Corrupt(format!(
            "compressed payload expands to {} bytes, expected {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> Vec<u8> {
        let mut writer = StateWriter::new(0);
        writer
            .section(SectionId::CPU, 1, |w| {
                w.write_u32_le(0xDEAD_BEEF)?;
                w.write_string_u32("gekko")
            })
            .unwrap();
        writer
            .section(SectionId::TIMING, 2, |w| w.write_u64_le(42))
            .unwrap();
        writer.finish()
    }

    #[test]
    fn test_parse_sections() {
        let bytes = sample_stream();
        let parsed = ParsedState::parse(&bytes).unwrap();
        assert_eq!(parsed.header.version, STATE_VERSION);
        assert_eq!(parsed.sections().len(), 2);

        let mut cpu = parsed.require(SectionId::CPU, "CPU", 1).unwrap();
        assert_eq!(cpu.read_u32_le().unwrap(), 0xDEAD_BEEF);
        assert_eq!(cpu.read_string_u32(16).unwrap(), "gekko");
        expect_consumed(cpu, "CPU").unwrap();
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample_stream();
        bytes[0] = b'X';
        assert!(matches!(ParsedState::parse(&bytes), Err(StateError::InvalidMagic)));
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = sample_stream();
        bytes[8] = 99;
        assert!(matches!(
            ParsedState::parse(&bytes),
            Err(StateError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut bytes = sample_stream();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            ParsedState::parse(&bytes),
            Err(StateError::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = sample_stream();
        assert!(matches!(
            ParsedState::parse(&bytes[..bytes.len() - 3]),
            Err(StateError::Truncated(_))
        ));
    }

    #[test]
    fn test_section_version_mismatch() {
        let bytes = sample_stream();
        let parsed = ParsedState::parse(&bytes).unwrap();
        assert!(matches!(
            parsed.require(SectionId::TIMING, "TIME", 1),
            Err(StateError::UnsupportedSectionVersion { found: 2, .. })
        ));
        assert!(matches!(
            parsed.require(SectionId::RAM, "RAM", 1),
            Err(StateError::MissingSection("RAM"))
        ));
    }

    #[test]
    fn test_compression() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, data.len()).unwrap(), data);
        assert!(decompress(&packed, data.len() - 1).is_err());
    }
}
