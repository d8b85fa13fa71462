//! Deterministic name-to-shard hashing and pod assignment (spec §3.7, §4.B).
//!
//! `shard_bits` is narrowed from the original's `[1, 256]` to `[1, 32]` so a
//! shard id fits a native `u32` (SPEC_FULL.md §3.7).

use des_error::{make_err, Code, Error};
use sha2::{Digest, Sha256};

/// Deterministic hash of `value` onto `[0, 2^n_bits)`, taking the most
/// significant `n_bits` of `SHA-256(value)`.
pub fn consistent_hash(value: &str, n_bits: u8) -> Result<u32, Error> {
    if !(1..=32).contains(&n_bits) {
        return Err(make_err!(
            Code::InvalidArgument,
            "n_bits must be in [1, 32], got {n_bits}"
        ));
    }
    let digest = Sha256::digest(value.as_bytes());
    // The top 4 bytes of the digest hold every bit we could possibly need
    // (n_bits <= 32), so only they are consulted.
    let top32 = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let shifted = top32 >> (32 - n_bits as u32);
    let mask: u32 = if n_bits == 32 {
        u32::MAX
    } else {
        (1u32 << n_bits) - 1
    };
    Ok(shifted & mask)
}

/// Width, in hex digits, of a shard id rendered for use in object-key prefixes.
pub fn shard_hex_width(n_bits: u8) -> usize {
    ((n_bits as usize) + 3) / 4
}

/// Container object key for a shard's day: `<prefix>/<YYYY-MM-DD>/shard_<hex>.des`,
/// the hex shard id zero-padded to `shard_hex_width(shard_bits)` (spec §6.2).
pub fn container_key(prefix: &str, shard_id: u32, shard_bits: u8, day: chrono::NaiveDate) -> String {
    let shard_hex = format!("{:0width$x}", shard_id, width = shard_hex_width(shard_bits));
    let key = format!("{}/shard_{}.des", day.format("%Y-%m-%d"), shard_hex);
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        key
    } else {
        format!("{prefix}/{key}")
    }
}

/// Computes shard ids and pod-to-shard mappings for a fixed-size shard space.
pub struct ShardAssignment {
    n_bits: u8,
    num_pods: u32,
    total_shards: u32,
}

impl ShardAssignment {
    pub fn new(n_bits: u8, num_pods: u32) -> Result<Self, Error> {
        if !(1..=32).contains(&n_bits) {
            return Err(make_err!(
                Code::InvalidArgument,
                "n_bits must be in [1, 32], got {n_bits}"
            ));
        }
        if num_pods == 0 {
            return Err(make_err!(Code::InvalidArgument, "num_pods must be positive"));
        }
        let total_shards: u64 = 1u64 << n_bits;
        Ok(ShardAssignment {
            n_bits,
            num_pods,
            total_shards: total_shards as u32,
        })
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    /// Shard ids handled by `pod_index`, distributed by `shard_id % num_pods`.
    pub fn shards_for_pod(&self, pod_index: u32) -> Result<Vec<u32>, Error> {
        if pod_index >= self.num_pods {
            return Err(make_err!(
                Code::InvalidArgument,
                "pod_index must be in [0, {})",
                self.num_pods
            ));
        }
        Ok((0..self.total_shards)
            .filter(|shard_id| shard_id % self.num_pods == pod_index)
            .collect())
    }

    pub fn compute_shard_id(&self, name: &str) -> Result<u32, Error> {
        consistent_hash(name, self.n_bits)
    }

    pub fn shard_hex(&self, shard_id: u32) -> String {
        format!(
            "{:0width$x}",
            shard_id,
            width = shard_hex_width(self.n_bits)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistent_hash_is_deterministic() {
        let a = consistent_hash("DES_20260730_(000000000001_02)", 8).unwrap();
        let b = consistent_hash("DES_20260730_(000000000001_02)", 8).unwrap();
        assert_eq!(a, b);
        assert!(a < 256);
    }

    #[test]
    fn consistent_hash_rejects_out_of_range_bits() {
        assert!(consistent_hash("x", 0).is_err());
        assert!(consistent_hash("x", 33).is_err());
    }

    #[test]
    fn hex_width_rounds_up() {
        assert_eq!(shard_hex_width(8), 2);
        assert_eq!(shard_hex_width(10), 3);
        assert_eq!(shard_hex_width(1), 1);
        assert_eq!(shard_hex_width(32), 8);
    }

    #[test]
    fn pod_assignment_partitions_all_shards() {
        let assign = ShardAssignment::new(4, 3).unwrap();
        let mut seen = std::collections::HashSet::new();
        for pod in 0..3 {
            for shard in assign.shards_for_pod(pod).unwrap() {
                assert!(seen.insert(shard), "shard {shard} assigned to multiple pods");
            }
        }
        assert_eq!(seen.len(), assign.total_shards() as usize);
    }

    #[test]
    fn rejects_out_of_range_pod_index() {
        let assign = ShardAssignment::new(4, 2).unwrap();
        assert!(assign.shards_for_pod(2).is_err());
    }
}
