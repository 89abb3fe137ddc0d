//! Checksum over a record set, exchanged by gossip to detect divergence.

use sha2::{Digest, Sha256};

use crate::types::DatabaseRecord;

/// SHA-256 (hex) over each record's name and clock, in name order.
///
/// Every mutation advances a record's clock, so two stores with equal
/// digests hold the same record versions.
pub fn records_digest<'a>(records: impl IntoIterator<Item = &'a DatabaseRecord>) -> String {
    let mut sorted: Vec<&DatabaseRecord> = records.into_iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    for record in sorted {
        hasher.update(record.name.as_bytes());
        hasher.update([0u8]);
        for (peer, count) in record.clock.iter().filter(|&(_, count)| count > 0) {
            hasher.update(peer.as_bytes());
            hasher.update(b"=");
            hasher.update(count.to_be_bytes());
            hasher.update(b";");
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn record(name: &str, peer: &str, count: u64) -> DatabaseRecord {
        let mut r = DatabaseRecord::new(name, 1, BTreeMap::new());
        for _ in 0..count {
            r.clock = r.clock.increment(peer);
        }
        r
    }

    #[test]
    fn order_independent() {
        let a = record("a", "p", 1);
        let b = record("b", "p", 2);
        assert_eq!(records_digest([&a, &b]), records_digest([&b, &a]));
    }

    #[test]
    fn changes_with_clock() {
        let a1 = record("a", "p", 1);
        let a2 = record("a", "p", 2);
        assert_ne!(records_digest([&a1]), records_digest([&a2]));
    }

    #[test]
    fn empty_set_is_stable() {
        assert_eq!(records_digest([]), records_digest(Vec::<&DatabaseRecord>::new()));
        assert_eq!(records_digest([]).len(), 64);
    }
}
