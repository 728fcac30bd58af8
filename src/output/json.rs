use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use serde::Serialize;

use crate::conntrack::nat::ConnKey;
use crate::error::NatcacheError;
use crate::model::{ConnTuple, IpTranslation};

#[derive(Serialize)]
struct Snapshot<'a> {
    stats: BTreeMap<&'a str, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entries: Option<Vec<Entry<'a>>>,
}

#[derive(Serialize)]
struct Entry<'a> {
    key: &'a ConnKey,
    translation: &'a IpTranslation,
}

#[derive(Serialize)]
struct Lookup<'a> {
    conn: &'a ConnTuple,
    translation: Option<&'a IpTranslation>,
}

/// Write the stats snapshot (and entries) as a JSON document.
pub fn write_snapshot(
    stats: &HashMap<String, i64>,
    entries: Option<&[(ConnKey, IpTranslation)]>,
    writer: &mut impl Write,
) -> Result<(), NatcacheError> {
    let doc = Snapshot {
        stats: stats.iter().map(|(k, v)| (k.as_str(), *v)).collect(),
        entries: entries.map(|e| {
            e.iter()
                .map(|(key, translation)| Entry { key, translation })
                .collect()
        }),
    };
    serde_json::to_writer_pretty(writer, &doc)
        .map_err(|e| NatcacheError::Serialization(std::io::Error::other(e.to_string())))
}

/// Write one lookup result; `translation` is `null` when nothing is cached.
pub fn write_lookup(
    conn: &ConnTuple,
    translation: Option<&IpTranslation>,
    writer: &mut impl Write,
) -> Result<(), NatcacheError> {
    serde_json::to_writer_pretty(writer, &Lookup { conn, translation })
        .map_err(|e| NatcacheError::Serialization(std::io::Error::other(e.to_string())))
}
