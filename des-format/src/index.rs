//! In-memory index entry (spec §3.2) and its on-disk codec (spec §3.1 Index region).

use crate::constants::{flags, is_valid_name_char, FIXED_ENTRY_SIZE, MAX_NAME_LEN};
use byteorder::{ByteOrder, LittleEndian};
use des_error::{make_err, Code, Error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: String,
    pub data_offset: u64,
    pub data_length: u64,
    pub meta_offset: u64,
    pub meta_length: u64,
    pub flags: u32,
}

impl IndexEntry {
    pub fn is_external(&self) -> bool {
        self.flags & flags::EXTERNAL != 0
    }

    /// Encoded size of this entry: `2 (name_len) + name.len() + FIXED_ENTRY_SIZE`.
    pub fn encoded_len(&self) -> u64 {
        2 + self.name.len() as u64 + FIXED_ENTRY_SIZE
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let name_bytes = self.name.as_bytes();
        let mut hdr = [0u8; 2];
        LittleEndian::write_u16(&mut hdr, name_bytes.len() as u16);
        out.extend_from_slice(&hdr);
        out.extend_from_slice(name_bytes);

        let mut fixed = [0u8; FIXED_ENTRY_SIZE as usize];
        LittleEndian::write_u64(&mut fixed[0..8], self.data_offset);
        LittleEndian::write_u64(&mut fixed[8..16], self.data_length);
        LittleEndian::write_u64(&mut fixed[16..24], self.meta_offset);
        LittleEndian::write_u64(&mut fixed[24..32], self.meta_length);
        LittleEndian::write_u32(&mut fixed[32..36], self.flags);
        out.extend_from_slice(&fixed);
    }
}

/// Validates a file name against the allowed character set and length (spec §3.1).
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(make_err!(Code::InvalidArgument, "name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(make_err!(
            Code::InvalidArgument,
            "name length {} exceeds max {}",
            name.len(),
            MAX_NAME_LEN
        ));
    }
    if !name.bytes().all(is_valid_name_char) {
        return Err(make_err!(
            Code::InvalidArgument,
            "name '{}' contains characters outside [A-Za-z0-9_.-]",
            name
        ));
    }
    Ok(())
}

/// Parses the full index region into entries, in insertion order.
///
/// The parse loop is driven by `buf`'s length (== `index_length`), not by
/// `expected_file_count` — matching the original reader's buffer-position
/// loop. `expected_file_count`, if given, is checked only after every byte of
/// `buf` has been consumed, surfacing a `Code::Internal` (Format) error on
/// mismatch rather than truncating or over-reading.
pub fn decode_index(buf: &[u8], expected_file_count: Option<u64>) -> Result<Vec<IndexEntry>, Error> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    let len = buf.len();

    while pos < len {
        if pos + 2 > len {
            return Err(make_err!(
                Code::Internal,
                "truncated index: expected 2 bytes for name_len at offset {pos}"
            ));
        }
        let name_len = LittleEndian::read_u16(&buf[pos..pos + 2]) as usize;
        pos += 2;

        if pos + name_len > len {
            return Err(make_err!(
                Code::Internal,
                "truncated index: name of length {name_len} overruns index region at offset {pos}"
            ));
        }
        let name = std::str::from_utf8(&buf[pos..pos + name_len])
            .map_err(|e| make_err!(Code::Internal, "index entry name is not valid utf-8: {e}"))?
            .to_string();
        pos += name_len;

        if pos + FIXED_ENTRY_SIZE as usize > len {
            return Err(make_err!(
                Code::Internal,
                "truncated index: fixed fields for '{name}' overrun index region"
            ));
        }
        let fixed = &buf[pos..pos + FIXED_ENTRY_SIZE as usize];
        let data_offset = LittleEndian::read_u64(&fixed[0..8]);
        let data_length = LittleEndian::read_u64(&fixed[8..16]);
        let meta_offset = LittleEndian::read_u64(&fixed[16..24]);
        let meta_length = LittleEndian::read_u64(&fixed[24..32]);
        let entry_flags = LittleEndian::read_u32(&fixed[32..36]);
        pos += FIXED_ENTRY_SIZE as usize;

        entries.push(IndexEntry {
            name,
            data_offset,
            data_length,
            meta_offset,
            meta_length,
            flags: entry_flags,
        });
    }

    if let Some(expected) = expected_file_count {
        if entries.len() as u64 != expected {
            return Err(make_err!(
                Code::Internal,
                "footer file_count {} does not match {} parsed index entries",
                expected,
                entries.len()
            ));
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_rejects_bad_chars() {
        assert!(validate_name("good.name-1_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("bad/slash").is_err());
        assert!(validate_name("bad space").is_err());
    }

    #[test]
    fn round_trip_single_entry() {
        let entry = IndexEntry {
            name: "a.txt".into(),
            data_offset: 16,
            data_length: 5,
            meta_offset: 0,
            meta_length: 2,
            flags: 0,
        };
        let mut buf = Vec::new();
        entry.encode(&mut buf);
        assert_eq!(buf.len() as u64, entry.encoded_len());

        let decoded = decode_index(&buf, Some(1)).unwrap();
        assert_eq!(decoded, vec![entry]);
    }

    #[test]
    fn decode_rejects_file_count_mismatch() {
        let entry = IndexEntry {
            name: "a.txt".into(),
            data_offset: 16,
            data_length: 5,
            meta_offset: 0,
            meta_length: 2,
            flags: 0,
        };
        let mut buf = Vec::new();
        entry.encode(&mut buf);
        let err = decode_index(&buf, Some(2)).unwrap_err();
        assert_eq!(err.code, Code::Internal);
    }

    #[test]
    fn decode_rejects_truncated_name() {
        let buf = vec![5, 0, b'a', b'b']; // name_len says 5 bytes, only 2 present
        let err = decode_index(&buf, None).unwrap_err();
        assert_eq!(err.code, Code::Internal);
    }
}
