use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};

use crate::conntrack::nat::ConnKey;
use crate::error::NatcacheError;
use crate::model::{ConnTuple, IpTranslation};

/// Write stats as `metric\tvalue` rows sorted by name. Entries, if given,
/// follow after a blank line, one translation per row.
pub fn write_snapshot(
    stats: &HashMap<String, i64>,
    entries: Option<&[(ConnKey, IpTranslation)]>,
    writer: &mut impl Write,
) -> Result<(), NatcacheError> {
    let mut names: Vec<_> = stats.keys().collect();
    names.sort();

    writeln!(writer, "metric\tvalue").map_err(NatcacheError::Serialization)?;
    for name in names {
        writeln!(writer, "{}\t{}", name, stats[name]).map_err(NatcacheError::Serialization)?;
    }

    let Some(entries) = entries else {
        return Ok(());
    };

    let mut rows: Vec<_> = entries.iter().collect();
    rows.sort_by_key(|(k, _)| (k.src_ip, k.src_port, k.dst_ip, k.dst_port));

    writeln!(writer).map_err(NatcacheError::Serialization)?;
    writeln!(writer, "proto\tsrc\tdst\trepl_src\trepl_dst").map_err(NatcacheError::Serialization)?;
    for (k, t) in rows {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}",
            k.transport,
            endpoint(k.src_ip, k.src_port),
            endpoint(k.dst_ip, k.dst_port),
            endpoint(t.repl_src_ip, t.repl_src_port),
            endpoint(t.repl_dst_ip, t.repl_dst_port),
        )
        .map_err(NatcacheError::Serialization)?;
    }

    Ok(())
}

/// Write one lookup result; reply columns are `-` when nothing is cached.
pub fn write_lookup(
    conn: &ConnTuple,
    translation: Option<&IpTranslation>,
    writer: &mut impl Write,
) -> Result<(), NatcacheError> {
    let (repl_src, repl_dst) = match translation {
        Some(t) => (
            endpoint(t.repl_src_ip, t.repl_src_port),
            endpoint(t.repl_dst_ip, t.repl_dst_port),
        ),
        None => ("-".to_string(), "-".to_string()),
    };

    writeln!(writer, "proto\tsrc\tdst\trepl_src\trepl_dst").map_err(NatcacheError::Serialization)?;
    writeln!(
        writer,
        "{}\t{}\t{}\t{}\t{}",
        conn.conn_type,
        endpoint(conn.source, conn.sport),
        endpoint(conn.dest, conn.dport),
        repl_src,
        repl_dst,
    )
    .map_err(NatcacheError::Serialization)
}

fn endpoint(ip: IpAddr, port: u16) -> String {
    SocketAddr::new(ip, port).to_string()
}
