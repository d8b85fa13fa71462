//! Snowflake-style unique name generation (spec §3.5).
//!
//! Format: `<prefix>_<YYYYMMDD>_(<F12>_<C2>)` where `F` packs
//! `[t_low(wrap_bits) | node_id(8) | seq(8)]` into 48 bits.

use chrono::NaiveDate;
use des_error::{make_err, Code, Error};
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct SnowflakeNameConfig {
    pub node_id: u8,
    pub prefix: String,
    /// Number of low-order bits of the epoch-ms clock folded into `F`. Must be in [1, 32].
    pub wrap_bits: u8,
}

impl Default for SnowflakeNameConfig {
    fn default() -> Self {
        SnowflakeNameConfig {
            node_id: 0,
            prefix: "DES".to_string(),
            wrap_bits: 22,
        }
    }
}

fn validate_prefix(prefix: &str) -> Result<(), Error> {
    if prefix.is_empty() {
        return Err(make_err!(Code::InvalidArgument, "prefix must be non-empty"));
    }
    if !prefix.is_ascii() {
        return Err(make_err!(Code::InvalidArgument, "prefix must be ASCII"));
    }
    if !prefix.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(make_err!(
            Code::InvalidArgument,
            "prefix may only use letters or digits"
        ));
    }
    Ok(())
}

struct ClockState {
    last_ms: i64,
    seq: u8,
}

/// Thread-safe generator of globally-orderable, collision-resistant names.
///
/// One generator is meant to be shared (behind an `Arc`) across all writers on
/// a single packer node; `node_id` disambiguates across nodes.
pub struct SnowflakeNameGenerator {
    config: SnowflakeNameConfig,
    state: Mutex<ClockState>,
}

impl SnowflakeNameGenerator {
    pub fn new(config: SnowflakeNameConfig) -> Result<Self, Error> {
        if !(1..=32).contains(&config.wrap_bits) {
            return Err(make_err!(
                Code::InvalidArgument,
                "wrap_bits must be in [1, 32], got {}",
                config.wrap_bits
            ));
        }
        validate_prefix(&config.prefix)?;
        Ok(SnowflakeNameGenerator {
            config,
            state: Mutex::new(ClockState {
                last_ms: -1,
                seq: 0,
            }),
        })
    }

    fn epoch_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }

    /// Produces the next 48-bit `F` value, blocking (busy-waiting) across a
    /// millisecond boundary if the 256-wide per-ms sequence space is
    /// exhausted. Clock regressions stick to the last observed millisecond
    /// rather than going backwards.
    fn next_f48(&self) -> u64 {
        let mut state = self.state.lock();
        let mut now_ms = Self::epoch_ms();
        if now_ms < state.last_ms {
            now_ms = state.last_ms;
        }

        if now_ms == state.last_ms {
            state.seq = state.seq.wrapping_add(1);
            if state.seq == 0 {
                while now_ms <= state.last_ms {
                    now_ms = Self::epoch_ms();
                }
            }
        } else {
            state.seq = 0;
        }
        state.last_ms = now_ms;

        let mask: i64 = (1i64 << self.config.wrap_bits) - 1;
        let t_low = (now_ms & mask) as u64;

        let f = (t_low << 16) | ((self.config.node_id as u64) << 8) | (state.seq as u64);
        f & 0xFFFF_FFFF_FFFF
    }

    fn checksum_byte(f: u64) -> u8 {
        let bytes = f.to_be_bytes(); // u64 -> 8 bytes, top 2 are always zero for a 48-bit value.
        bytes[2..8].iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
    }

    /// Generates the next name, stamping it with `day` (defaults to the
    /// generator's wall-clock UTC date when `None`).
    pub fn next_name(&self, day: Option<NaiveDate>) -> String {
        let day = day.unwrap_or_else(|| {
            chrono::DateTime::from_timestamp_millis(Self::epoch_ms())
                .expect("valid timestamp")
                .date_naive()
        });
        let f = self.next_f48();
        let cc = Self::checksum_byte(f);
        format!(
            "{}_{}_({:012X}_{:02X})",
            self.config.prefix,
            day.format("%Y%m%d"),
            f,
            cc
        )
    }
}

/// Extracts the `YYYYMMDD` middle component from a name of the shape
/// `<prefix>_<YYYYMMDD>_(<F12>_<C2>)`, grounded on
/// `des/retriever/file_handler.py::FileHandler._parse_day`'s `_(\d{8})_` regex.
pub fn parse_day(name: &str) -> Result<NaiveDate, Error> {
    let digits: Vec<&str> = name
        .split('_')
        .filter(|part| part.len() == 8 && part.bytes().all(|b| b.is_ascii_digit()))
        .collect();
    let raw = digits
        .first()
        .ok_or_else(|| make_err!(Code::InvalidArgument, "'{name}' has no YYYYMMDD component"))?;
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .map_err(|e| make_err!(Code::InvalidArgument, "'{name}' has an invalid date: {e}"))
}
