//! Deterministic checksums used for sync comparisons.
//!
//! `serde_json::Value` objects are key-sorted, so serializing through a
//! `Value` gives a canonical byte string for a record.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::CredentialRecord;
use crate::error::Result;

fn canonical_record(record: &CredentialRecord) -> Result<Value> {
    let mut value = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut value {
        map.remove("sync");
    }
    Ok(value)
}

/// SHA-256 (hex) of one record without its `sync` block.
pub fn record_checksum(record: &CredentialRecord) -> Result<String> {
    let canonical = serde_json::to_vec(&canonical_record(record)?)?;
    Ok(format!("{:x}", Sha256::digest(&canonical)))
}

/// SHA-256 (hex) over all records in id order, `sync` blocks excluded.
pub fn state_checksum(records: &BTreeMap<String, CredentialRecord>) -> Result<String> {
    let canonical = records
        .values()
        .map(canonical_record)
        .collect::<Result<Vec<_>>>()?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
