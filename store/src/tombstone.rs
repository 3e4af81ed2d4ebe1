//! Delete markers replicated in place of removed user rows.
//!
//! Tombstone primary keys are the zero-padded hex LSN plus a per-batch
//! index, so key enumeration order equals LSN order and pruning can stop at
//! the low watermark without decoding payloads. Older peers keyed tombstones
//! as `type++key` with `(+)` escaping the delimiter; both forms are accepted
//! on apply and rewritten into the current format.

use serde_derive::{Deserialize, Serialize};

use crate::codec;
use crate::error::{CResult, Error};
use crate::local::{Lsn, StoreTransaction};
use crate::progress::METADATA_SEQUENCE_NUMBER;

pub const TOMBSTONE_DATA_TYPE: &str = "ReplicationTombstone";

const KEY_DELIMITER: &str = "+";
const KEY_DOUBLE_DELIMITER: &str = "++";
const KEY_ESCAPED_DELIMITER: &str = "(+)";

/// Payload of a tombstone row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TombstoneData {
    pub live_entry_type: String,
    pub live_entry_key: String,
    pub operation_lsn: Lsn,
    pub index: u64,
}

impl TombstoneData {
    pub fn new(live_entry_type: &str, live_entry_key: &str, lsn: Lsn, index: u64) -> Self {
        TombstoneData {
            live_entry_type: live_entry_type.to_string(),
            live_entry_key: live_entry_key.to_string(),
            operation_lsn: lsn,
            index,
        }
    }

    /// Left zero pad so that primary key enumeration order is the same as
    /// LSN enumeration order. The index only disambiguates multiple deletes
    /// committed at the same LSN.
    pub fn construct_key(&self) -> String {
        format!("0x{:016x}:{}", self.operation_lsn, self.index)
    }
}

impl std::fmt::Display for TombstoneData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tombstone('{}', '{}', lsn={} index={})",
            self.live_entry_type, self.live_entry_key, self.operation_lsn, self.index
        )
    }
}

/// Parses a current-format tombstone key into `(lsn, index)`.
pub fn parse_tombstone_key(key: &str) -> Option<(Lsn, u64)> {
    let rest = key.strip_prefix("0x")?;
    let (hex, index) = rest.split_once(':')?;
    if hex.len() != 16 {
        return None;
    }
    let lsn = i64::from_str_radix(hex, 16).ok()?;
    let index = index.parse::<u64>().ok()?;
    Some((lsn, index))
}

/// Parses a legacy `type++key` tombstone key, unescaping `(+)`.
pub fn try_parse_legacy_key(key: &str) -> Option<(String, String)> {
    let (raw_type, raw_key) = key.split_once(KEY_DOUBLE_DELIMITER)?;
    let unescape = |s: &str| s.replace(KEY_ESCAPED_DELIMITER, KEY_DELIMITER);
    Some((unescape(raw_type), unescape(raw_key)))
}

/// Writes the tombstone row for a deleted user row. Returns true when a new
/// tombstone was created (idempotent re-applies overwrite in place and are
/// not counted again).
pub fn finalize_tombstone(
    tx: &mut StoreTransaction,
    live_entry_type: &str,
    live_entry_key: &str,
    operation_lsn: Lsn,
    index: u64,
) -> CResult<bool> {
    let data = TombstoneData::new(live_entry_type, live_entry_key, operation_lsn, index);
    let key = data.construct_key();
    let bytes = codec::serialize(&data)?;

    let existed = tx.contains(TOMBSTONE_DATA_TYPE, &key);
    tx.upsert(TOMBSTONE_DATA_TYPE, &key, &bytes, operation_lsn, None)?;
    Ok(!existed)
}

/// Decodes a tombstone row arriving on the copy stream. The payload wins
/// when it deserializes; otherwise the key is parsed (current then legacy
/// format).
pub fn decode_copied_tombstone(key: &str, payload: &[u8], lsn: Lsn) -> CResult<TombstoneData> {
    if !payload.is_empty() {
        if let Ok(data) = codec::deserialize::<TombstoneData>(payload) {
            return Ok(data);
        }
    }

    if let Some((parsed_lsn, index)) = parse_tombstone_key(key) {
        return Ok(TombstoneData::new("", "", parsed_lsn, index));
    }

    if let Some((live_type, live_key)) = try_parse_legacy_key(key) {
        return Ok(TombstoneData::new(&live_type, &live_key, lsn, 0));
    }

    Err(Error::Parse(format!("unrecognized tombstone key '{}'", key)))
}

/// Keys of tombstones eligible for pruning: everything at `lsn <= low_watermark`,
/// up to `limit` rows. Relies on key order matching LSN order.
pub fn enumerate_prunable(
    tx: &StoreTransaction,
    low_watermark: Lsn,
    limit: usize,
) -> CResult<Vec<String>> {
    let mut keys = Vec::new();
    for item in tx.enumerate_by_type_and_key(TOMBSTONE_DATA_TYPE, "")? {
        let lsn = match parse_tombstone_key(&item.key) {
            Some((lsn, _)) => lsn,
            // Legacy-keyed rows sort before the hex format; use the row LSN.
            None => item.operation_lsn,
        };
        if lsn > low_watermark {
            break;
        }
        keys.push(item.key);
        if keys.len() >= limit {
            break;
        }
    }
    Ok(keys)
}

/// Rewrites any legacy-keyed tombstones into the current key format after a
/// copy completes. Returns the number of rows rewritten.
pub fn recover_tombstones(tx: &mut StoreTransaction) -> CResult<u64> {
    let mut legacy: Vec<(String, TombstoneData)> = Vec::new();
    for item in tx.enumerate_by_type_and_key(TOMBSTONE_DATA_TYPE, "")? {
        if parse_tombstone_key(&item.key).is_some() {
            continue;
        }
        let data = decode_copied_tombstone(&item.key, &item.value, item.operation_lsn)?;
        legacy.push((item.key.clone(), data));
    }

    let count = legacy.len() as u64;
    for (old_key, data) in legacy {
        tx.delete(TOMBSTONE_DATA_TYPE, &old_key, None)?;
        let bytes = codec::serialize(&data)?;
        tx.upsert(
            TOMBSTONE_DATA_TYPE,
            &data.construct_key(),
            &bytes,
            data.operation_lsn.max(METADATA_SEQUENCE_NUMBER),
            None,
        )?;
    }
    Ok(count)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::local::LocalStore;
    use crate::storage::memory::Memory;

    #[test]
    fn key_format_orders_by_lsn() {
        let t1 = TombstoneData::new("T", "a", 9, 0);
        let t2 = TombstoneData::new("T", "b", 10, 0);
        let t3 = TombstoneData::new("T", "c", 10, 1);

        assert_eq!(t1.construct_key(), "0x0000000000000009:0");
        assert!(t1.construct_key() < t2.construct_key());
        assert!(t2.construct_key() < t3.construct_key());

        assert_eq!(parse_tombstone_key(&t3.construct_key()), Some((10, 1)));
        assert_eq!(parse_tombstone_key("junk"), None);
    }

    #[test]
    fn legacy_keys_parse_with_escapes() {
        assert_eq!(
            try_parse_legacy_key("MyType++my+key"),
            Some(("MyType".to_string(), "my+key".to_string()))
        );
        assert_eq!(
            try_parse_legacy_key("A(+)B++k"),
            Some(("A+B".to_string(), "k".to_string()))
        );
        assert_eq!(try_parse_legacy_key("no-delimiter"), None);
    }

    #[test]
    fn finalize_is_idempotent() -> CResult<()> {
        let store = LocalStore::open(Box::new(Memory::new()))?;

        let mut tx = store.create_transaction()?;
        assert!(finalize_tombstone(&mut tx, "T", "k", 7, 0)?);
        assert!(!finalize_tombstone(&mut tx, "T", "k", 7, 0)?);
        tx.commit()?;
        Ok(())
    }

    #[test]
    fn prune_stops_at_low_watermark() -> CResult<()> {
        let store = LocalStore::open(Box::new(Memory::new()))?;

        let mut tx = store.create_transaction()?;
        for lsn in [3, 5, 8, 13] {
            finalize_tombstone(&mut tx, "T", &format!("k{}", lsn), lsn, 0)?;
        }
        tx.commit()?;

        let tx = store.create_transaction()?;
        let prunable = enumerate_prunable(&tx, 8, 100)?;
        assert_eq!(prunable.len(), 3);
        assert!(prunable.iter().all(|k| parse_tombstone_key(k).unwrap().0 <= 8));
        Ok(())
    }

    #[test]
    fn recover_rewrites_legacy_rows() -> CResult<()> {
        let store = LocalStore::open(Box::new(Memory::new()))?;

        let mut tx = store.create_transaction()?;
        // A copied legacy tombstone: delimited key, payload present.
        let data = TombstoneData::new("T", "k", 21, 0);
        let bytes = codec::serialize(&data)?;
        tx.upsert(TOMBSTONE_DATA_TYPE, "T++k", &bytes, 21, None)?;
        finalize_tombstone(&mut tx, "T", "other", 22, 0)?;
        tx.commit()?;

        let mut tx = store.create_transaction()?;
        assert_eq!(recover_tombstones(&mut tx)?, 1);
        tx.commit()?;

        let tx = store.create_transaction()?;
        assert!(!tx.contains(TOMBSTONE_DATA_TYPE, "T++k"));
        assert!(tx.contains(TOMBSTONE_DATA_TYPE, "0x0000000000000015:0"));
        Ok(())
    }
}
