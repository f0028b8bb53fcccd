//! Read-side queries: export rows and summary statistics over a time range.

use anyhow::{Context, Result};
use rusqlite::{Connection, Row};
use serde::Serialize;

use crate::utils::config::STATS_TOP_IDS;

/// Inclusive time bounds in nanoseconds since the epoch; `None` is unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start_ns: Option<i64>,
    pub end_ns: Option<i64>,
}

/// One row of `can_messages`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredMessage {
    pub seq: u64,
    pub timestamp_ns: i64,
    pub can_id: u32,
    pub data: String,
    pub dlc: usize,
    pub direction: &'static str,
    pub channel: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signals: Option<serde_json::Value>,
}

/// One row of `dtcs`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredDtc {
    pub timestamp_ns: i64,
    pub code: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub severity: Option<String>,
    pub source_signal: Option<String>,
    pub can_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IdCount {
    pub can_id: String,
    pub count: u64,
}

/// Summary printed by `canflow stats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub total_messages: u64,
    pub rx_messages: u64,
    pub tx_messages: u64,
    pub first_timestamp_ns: Option<i64>,
    pub last_timestamp_ns: Option<i64>,
    pub top_ids: Vec<IdCount>,
    pub total_dtcs: u64,
    pub unique_dtcs: u64,
}

const RANGE_FILTER: &str =
    "(?1 IS NULL OR timestamp_ns >= ?1) AND (?2 IS NULL OR timestamp_ns <= ?2)";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let data: Vec<u8> = row.get(2)?;
    let is_rx: bool = row.get(4)?;
    let decoded: Option<String> = row.get(7)?;
    Ok(StoredMessage {
        timestamp_ns: row.get(0)?,
        can_id: row.get::<_, i64>(1)? as u32,
        data: data.iter().map(|b| format!("{b:02X}")).collect(),
        dlc: row.get::<_, i64>(3)?.max(0) as usize,
        direction: if is_rx { "RX" } else { "TX" },
        channel: row.get::<_, i64>(5)? as u16,
        name: row.get(6)?,
        signals: decoded.and_then(|s| serde_json::from_str(&s).ok()),
        seq: row.get::<_, i64>(8)?.max(0) as u64,
    })
}

/// Stream stored messages in time order to `f`. Returns the number of rows visited.
pub fn for_each_message<F>(conn: &Connection, range: TimeRange, mut f: F) -> Result<usize>
where
    F: FnMut(StoredMessage) -> Result<()>,
{
    let sql = format!(
        "SELECT timestamp_ns, can_id, data, dlc, is_rx, channel, message_name, decoded_data, seq \
         FROM can_messages WHERE {RANGE_FILTER} ORDER BY timestamp_ns, id"
    );
    let mut stmt = conn.prepare(&sql).context("prepare export query")?;
    let rows = stmt
        .query_map((range.start_ns, range.end_ns), message_from_row)
        .context("query messages")?;
    let mut n = 0_usize;
    for row in rows {
        f(row.context("read message row")?)?;
        n += 1;
    }
    Ok(n)
}

/// Load stored messages in time order.
pub fn load_messages(conn: &Connection, range: TimeRange) -> Result<Vec<StoredMessage>> {
    let mut out = Vec::new();
    for_each_message(conn, range, |m| {
        out.push(m);
        Ok(())
    })?;
    Ok(out)
}

/// Load stored diagnostic hits in time order.
pub fn load_dtcs(conn: &Connection, range: TimeRange) -> Result<Vec<StoredDtc>> {
    let sql = format!(
        "SELECT timestamp_ns, dtc_code, dtc_name, description, severity, source_signal, can_id \
         FROM dtcs WHERE {RANGE_FILTER} ORDER BY timestamp_ns, id"
    );
    let mut stmt = conn.prepare(&sql).context("prepare dtc query")?;
    let rows = stmt.query_map((range.start_ns, range.end_ns), |row| {
        Ok(StoredDtc {
            timestamp_ns: row.get(0)?,
            code: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            severity: row.get(4)?,
            source_signal: row.get(5)?,
            can_id: row.get::<_, i64>(6)? as u32,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read dtc row")?);
    }
    Ok(out)
}

/// Totals, RX/TX split, busiest identifiers, and DTC counts over `range`.
pub fn statistics(conn: &Connection, range: TimeRange) -> Result<Statistics> {
    let params = (range.start_ns, range.end_ns);
    let (total, rx, first, last): (i64, Option<i64>, Option<i64>, Option<i64>) = conn
        .query_row(
            &format!(
                "SELECT COUNT(*), SUM(is_rx), MIN(timestamp_ns), MAX(timestamp_ns) \
                 FROM can_messages WHERE {RANGE_FILTER}"
            ),
            params,
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .context("count messages")?;
    let total = total.max(0) as u64;
    let rx = rx.unwrap_or(0).max(0) as u64;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT can_id, COUNT(*) AS n FROM can_messages WHERE {RANGE_FILTER} \
             GROUP BY can_id ORDER BY n DESC, can_id LIMIT ?3"
        ))
        .context("prepare id frequency")?;
    let top_ids = stmt
        .query_map((range.start_ns, range.end_ns, STATS_TOP_IDS as i64), |r| {
            Ok(IdCount {
                can_id: format!("0x{:03X}", r.get::<_, i64>(0)?),
                count: r.get::<_, i64>(1)?.max(0) as u64,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read id frequency")?;

    let (total_dtcs, unique_dtcs): (i64, i64) = conn
        .query_row(
            &format!("SELECT COUNT(*), COUNT(DISTINCT dtc_code) FROM dtcs WHERE {RANGE_FILTER}"),
            params,
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .context("count dtcs")?;

    Ok(Statistics {
        total_messages: total,
        rx_messages: rx,
        tx_messages: total.saturating_sub(rx),
        first_timestamp_ns: first,
        last_timestamp_ns: last,
        top_ids,
        total_dtcs: total_dtcs.max(0) as u64,
        unique_dtcs: unique_dtcs.max(0) as u64,
    })
}
