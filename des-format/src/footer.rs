//! Header and footer codec plus region-boundary invariant validation (spec §3.1).

use crate::constants::{
    FOOTER_MAGIC, FOOTER_SIZE, FORMAT_VERSION, HEADER_MAGIC, HEADER_SIZE, MIN_CONTAINER_SIZE,
};
use byteorder::{ByteOrder, LittleEndian};
use des_error::{make_err, Code, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub version: u8,
    pub data_start: u64,
    pub data_length: u64,
    pub meta_start: u64,
    pub meta_length: u64,
    pub index_start: u64,
    pub index_length: u64,
    pub file_count: u64,
}

pub fn encode_header(out: &mut Vec<u8>) {
    out.extend_from_slice(HEADER_MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&[0u8; 7]);
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut buf = [0u8; FOOTER_SIZE as usize];
        buf[0..8].copy_from_slice(FOOTER_MAGIC);
        buf[8] = self.version;
        // buf[9..16] stays reserved-zero.
        LittleEndian::write_u64(&mut buf[16..24], self.data_start);
        LittleEndian::write_u64(&mut buf[24..32], self.data_length);
        LittleEndian::write_u64(&mut buf[32..40], self.meta_start);
        LittleEndian::write_u64(&mut buf[40..48], self.meta_length);
        LittleEndian::write_u64(&mut buf[48..56], self.index_start);
        LittleEndian::write_u64(&mut buf[56..64], self.index_length);
        LittleEndian::write_u64(&mut buf[64..72], self.file_count);
        buf
    }

    /// Decodes and validates the last `FOOTER_SIZE` bytes of a container plus
    /// the invariants in spec §3.1 that only require the object's total size
    /// (not the index contents). Rejects before any data is read, per spec
    /// testable property 4 (footer strictness).
    pub fn decode(buf: &[u8], object_size: u64) -> Result<Footer, Error> {
        if object_size < MIN_CONTAINER_SIZE {
            return Err(make_err!(
                Code::Internal,
                "container too small: {object_size} bytes, minimum is {MIN_CONTAINER_SIZE}"
            ));
        }
        if buf.len() as u64 != FOOTER_SIZE {
            return Err(make_err!(
                Code::Internal,
                "footer buffer has wrong length {}, expected {FOOTER_SIZE}",
                buf.len()
            ));
        }
        if &buf[0..8] != FOOTER_MAGIC {
            return Err(make_err!(Code::Internal, "bad footer magic"));
        }
        let version = buf[8];
        if version != FORMAT_VERSION {
            return Err(make_err!(
                Code::Internal,
                "unsupported container version {version}"
            ));
        }

        let footer = Footer {
            version,
            data_start: LittleEndian::read_u64(&buf[16..24]),
            data_length: LittleEndian::read_u64(&buf[24..32]),
            meta_start: LittleEndian::read_u64(&buf[32..40]),
            meta_length: LittleEndian::read_u64(&buf[40..48]),
            index_start: LittleEndian::read_u64(&buf[48..56]),
            index_length: LittleEndian::read_u64(&buf[56..64]),
            file_count: LittleEndian::read_u64(&buf[64..72]),
        };

        footer.validate(object_size)?;
        Ok(footer)
    }

    fn validate(&self, object_size: u64) -> Result<(), Error> {
        if self.data_start != HEADER_SIZE {
            return Err(make_err!(
                Code::Internal,
                "data_start {} != header size {HEADER_SIZE}",
                self.data_start
            ));
        }
        let meta_start = self
            .data_start
            .checked_add(self.data_length)
            .ok_or_else(|| make_err!(Code::Internal, "data region overflows"))?;
        if meta_start != self.meta_start {
            return Err(make_err!(
                Code::Internal,
                "data_start + data_length ({meta_start}) != meta_start ({})",
                self.meta_start
            ));
        }
        let index_start = self
            .meta_start
            .checked_add(self.meta_length)
            .ok_or_else(|| make_err!(Code::Internal, "meta region overflows"))?;
        if index_start != self.index_start {
            return Err(make_err!(
                Code::Internal,
                "meta_start + meta_length ({index_start}) != index_start ({})",
                self.index_start
            ));
        }
        let footer_start = object_size
            .checked_sub(FOOTER_SIZE)
            .ok_or_else(|| make_err!(Code::Internal, "object smaller than footer"))?;
        let index_end = self
            .index_start
            .checked_add(self.index_length)
            .ok_or_else(|| make_err!(Code::Internal, "index region overflows"))?;
        if index_end != footer_start {
            return Err(make_err!(
                Code::Internal,
                "index_start + index_length ({index_end}) != object_size - footer ({footer_start})"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_footer() -> Footer {
        Footer {
            version: FORMAT_VERSION,
            data_start: HEADER_SIZE,
            data_length: 5,
            meta_start: HEADER_SIZE + 5,
            meta_length: 10,
            index_start: HEADER_SIZE + 5 + 10,
            index_length: 20,
            file_count: 1,
        }
    }

    #[test]
    fn round_trip() {
        let footer = sample_footer();
        let object_size = footer.index_start + footer.index_length + FOOTER_SIZE;
        let encoded = footer.encode();
        let decoded = Footer::decode(&encoded, object_size).unwrap();
        assert_eq!(decoded, footer);
    }

    #[test]
    fn rejects_bad_magic() {
        let footer = sample_footer();
        let object_size = footer.index_start + footer.index_length + FOOTER_SIZE;
        let mut encoded = footer.encode();
        encoded[0..8].copy_from_slice(b"BADMAGIC");
        let err = Footer::decode(&encoded, object_size).unwrap_err();
        assert_eq!(err.code, Code::Internal);
    }

    #[test]
    fn rejects_broken_region_chain() {
        let mut footer = sample_footer();
        footer.meta_start += 1; // break data_start + data_length == meta_start
        let object_size = footer.index_start + footer.index_length + FOOTER_SIZE;
        let encoded = footer.encode();
        let err = Footer::decode(&encoded, object_size).unwrap_err();
        assert_eq!(err.code, Code::Internal);
    }

    #[test]
    fn rejects_undersized_container() {
        let err = Footer::decode(&[0u8; 72], 50).unwrap_err();
        assert_eq!(err.code, Code::Internal);
    }
}
