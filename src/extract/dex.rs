//! Minimal reader for the string pool of Android `classes.dex` files.
//!
//! Only the parts needed to recover string constants are implemented: the
//! fixed header, the string id table, and the MUTF-8 string data it points
//! at. Everything else in the container is ignored.

use thiserror::Error;

const DEX_MAGIC: &[u8] = b"dex\n";
const HEADER_LEN: usize = 112;
const STRING_IDS_SIZE_OFFSET: usize = 56;
const STRING_IDS_OFF_OFFSET: usize = 60;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DexError {
    #[error("file is shorter than a dex header ({have} bytes)")]
    Truncated { have: usize },
    #[error("missing dex magic")]
    BadMagic,
    #[error("string id table at {offset:#x} ({count} entries) exceeds the file")]
    StringTableOutOfBounds { offset: usize, count: usize },
    #[error("string data offset {offset:#x} is outside the file")]
    StringDataOutOfBounds { offset: usize },
    #[error("malformed string length at {offset:#x}")]
    MalformedLength { offset: usize },
    #[error("unterminated string data at {offset:#x}")]
    UnterminatedString { offset: usize },
}

/// The decoded string pool of one dex file.
#[derive(Debug, Clone)]
pub struct DexFile {
    strings: Vec<String>,
}

impl DexFile {
    /// Parses the string pool out of a raw dex image.
    ///
    /// String data is MUTF-8; it is decoded leniently, so encodings that are
    /// not valid UTF-8 (embedded NULs, unpaired surrogates) come back with
    /// replacement characters rather than failing the whole file.
    pub fn parse(data: &[u8]) -> Result<Self, DexError> {
        if data.len() < HEADER_LEN {
            return Err(DexError::Truncated { have: data.len() });
        }
        if &data[..DEX_MAGIC.len()] != DEX_MAGIC {
            return Err(DexError::BadMagic);
        }

        let count = read_u32_le(data, STRING_IDS_SIZE_OFFSET) as usize;
        let table_off = read_u32_le(data, STRING_IDS_OFF_OFFSET) as usize;
        let table_end = count
            .checked_mul(4)
            .and_then(|len| table_off.checked_add(len))
            .filter(|end| *end <= data.len())
            .ok_or(DexError::StringTableOutOfBounds {
                offset: table_off,
                count,
            })?;

        let mut strings = Vec::with_capacity(count);
        let mut entry = table_off;
        while entry < table_end {
            let data_off = read_u32_le(data, entry) as usize;
            strings.push(read_string(data, data_off)?);
            entry += 4;
        }
        Ok(Self { strings })
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }
}

/// Reads one string data item: a ULEB128 UTF-16 length followed by MUTF-8
/// bytes and a NUL terminator. MUTF-8 never emits a plain 0x00 inside a
/// string, so scanning for the terminator is safe.
fn read_string(data: &[u8], offset: usize) -> Result<String, DexError> {
    let (utf16_len, start) = read_uleb128(data, offset)?;
    // MUTF-8 spends at most three bytes per UTF-16 unit.
    let window_end = start
        .checked_add(utf16_len as usize * 3 + 1)
        .map_or(data.len(), |end| end.min(data.len()));
    let len = data[start..window_end]
        .iter()
        .position(|&b| b == 0)
        .ok_or(DexError::UnterminatedString { offset })?;
    Ok(String::from_utf8_lossy(&data[start..start + len]).into_owned())
}

fn read_uleb128(data: &[u8], offset: usize) -> Result<(u32, usize), DexError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut pos = offset;
    loop {
        let byte = *data
            .get(pos)
            .ok_or(DexError::StringDataOutOfBounds { offset })?;
        pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return u32::try_from(value)
                .map(|v| (v, pos))
                .map_err(|_| DexError::MalformedLength { offset });
        }
        shift += 7;
        if shift > 28 {
            return Err(DexError::MalformedLength { offset });
        }
    }
}

/// Callers check bounds before reading; offsets here are always in range.
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

// ===== Tests =====

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn push_uleb128(out: &mut Vec<u8>, mut value: u32) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    /// Builds a dex image holding exactly the given strings: header, string
    /// id table, then the string data section.
    pub(crate) fn build_dex(strings: &[&str]) -> Vec<u8> {
        let mut header = vec![0u8; HEADER_LEN];
        header[..4].copy_from_slice(DEX_MAGIC);
        let table_off = HEADER_LEN;
        let data_off = table_off + strings.len() * 4;

        let mut table = Vec::new();
        let mut data = Vec::new();
        for s in strings {
            table.extend_from_slice(&((data_off + data.len()) as u32).to_le_bytes());
            push_uleb128(&mut data, s.chars().map(char::len_utf16).sum::<usize>() as u32);
            data.extend_from_slice(s.as_bytes());
            data.push(0);
        }
        header[STRING_IDS_SIZE_OFFSET..STRING_IDS_SIZE_OFFSET + 4]
            .copy_from_slice(&(strings.len() as u32).to_le_bytes());
        header[STRING_IDS_OFF_OFFSET..STRING_IDS_OFF_OFFSET + 4]
            .copy_from_slice(&(table_off as u32).to_le_bytes());

        header.extend_from_slice(&table);
        header.extend_from_slice(&data);
        header
    }

    #[test]
    fn recovers_the_string_pool() {
        let image = build_dex(&["https://api.example.com/v1", "Lcom/example/Main;", ""]);
        let dex = DexFile::parse(&image).unwrap();
        assert_eq!(
            dex.strings(),
            ["https://api.example.com/v1", "Lcom/example/Main;", ""]
        );
    }

    #[test]
    fn handles_lengths_that_need_two_uleb_bytes() {
        let long = "x".repeat(200);
        let image = build_dex(&[&long]);
        let dex = DexFile::parse(&image).unwrap();
        assert_eq!(dex.strings(), [long.as_str()]);
    }

    #[test]
    fn rejects_short_files() {
        assert_eq!(
            DexFile::parse(&[0u8; 40]).unwrap_err(),
            DexError::Truncated { have: 40 }
        );
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut image = build_dex(&["a"]);
        image[0] = b'P';
        assert_eq!(DexFile::parse(&image).unwrap_err(), DexError::BadMagic);
    }

    #[test]
    fn rejects_a_string_table_past_the_end() {
        let mut image = build_dex(&["a"]);
        image[STRING_IDS_SIZE_OFFSET..STRING_IDS_SIZE_OFFSET + 4]
            .copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            DexFile::parse(&image).unwrap_err(),
            DexError::StringTableOutOfBounds { .. }
        ));
    }

    #[test]
    fn rejects_unterminated_string_data() {
        let mut image = build_dex(&["abc"]);
        let len = image.len();
        image.truncate(len - 1); // drop the final NUL
        assert!(matches!(
            DexFile::parse(&image).unwrap_err(),
            DexError::UnterminatedString { .. }
        ));
    }

    #[test]
    fn decodes_invalid_utf8_leniently() {
        let mut image = build_dex(&["ab"]);
        let data_start = image.len() - 3; // 'a', 'b', NUL
        image[data_start] = 0xff;
        let dex = DexFile::parse(&image).unwrap();
        assert_eq!(dex.strings()[0], "\u{fffd}b");
    }
}
