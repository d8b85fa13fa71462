//! Exact byte layout of the DES container format (spec §3.1, §6.1).
//!
//! Field order and widths here are a portable wire format: any
//! implementation in any language must produce byte-identical output for
//! identical inputs.

pub const HEADER_MAGIC: &[u8; 8] = b"DESHEAD1";
pub const FOOTER_MAGIC: &[u8; 8] = b"DESFOOT1";
pub const FORMAT_VERSION: u8 = 1;

pub const HEADER_SIZE: u64 = 16;
pub const FOOTER_SIZE: u64 = 72;

/// `data_offset`, `data_length`, `meta_offset`, `meta_length` (each u64) plus `flags` (u32).
pub const FIXED_ENTRY_SIZE: u64 = 8 * 4 + 4;

pub const MAX_NAME_LEN: usize = 65535;
pub const MAX_META_LEN: u64 = 10 * 1024 * 1024;

pub const MIN_CONTAINER_SIZE: u64 = HEADER_SIZE + FOOTER_SIZE;

pub mod flags {
    pub const EXTERNAL: u32 = 0x01;
    pub const COMPRESSED: u32 = 0x02;
    pub const ENCRYPTED: u32 = 0x04;
    pub const DELETED: u32 = 0x08;
}

/// Names are drawn from `[A-Za-z0-9_.-]`, non-empty, at most `MAX_NAME_LEN` bytes.
pub fn is_valid_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'-'
}
