pub mod json;
pub mod tsv;

use std::collections::HashMap;
use std::io::Write;

use crate::cli::OutputFormat;
use crate::conntrack::nat::ConnKey;
use crate::error::NatcacheError;
use crate::model::{ConnTuple, IpTranslation};

/// Write a stats snapshot, optionally followed by the cached entries.
pub fn write_snapshot(
    stats: &HashMap<String, i64>,
    entries: Option<&[(ConnKey, IpTranslation)]>,
    format: OutputFormat,
    writer: &mut impl Write,
) -> Result<(), NatcacheError> {
    match format {
        OutputFormat::Tsv => tsv::write_snapshot(stats, entries, writer),
        OutputFormat::Json => json::write_snapshot(stats, entries, writer),
    }
}

/// Write the result of a single lookup.
pub fn write_lookup(
    conn: &ConnTuple,
    translation: Option<&IpTranslation>,
    format: OutputFormat,
    writer: &mut impl Write,
) -> Result<(), NatcacheError> {
    match format {
        OutputFormat::Tsv => tsv::write_lookup(conn, translation, writer),
        OutputFormat::Json => json::write_lookup(conn, translation, writer),
    }
}
