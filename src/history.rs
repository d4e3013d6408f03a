//! Historical candle store.
//!
//! Candles live in an external sqlite table keyed by
//! `(timestamp, exchange, base, quote)`; warmup and the replay adapter both
//! consume them as time-ordered [`Frame`]s. Rows are grouped by timestamp;
//! pairs missing from a given timestamp are simply absent from that frame.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::models::{ExchangePair, Frame, PricePoint, TradingPair};

const CANDLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS candles (
    timestamp INTEGER NOT NULL,
    exchange  TEXT NOT NULL,
    base      TEXT NOT NULL,
    quote     TEXT NOT NULL,
    price     REAL NOT NULL,
    volume    REAL NOT NULL,
    PRIMARY KEY (timestamp, exchange, base, quote)
);
"#;

/// Opens (or creates) a candle database at `path`.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("opening candle store {}", path.display()))?;
    conn.execute_batch(CANDLE_SCHEMA)
        .context("creating candle schema")?;
    Ok(conn)
}

/// Appends one candle row.
pub fn insert_candle(
    conn: &Connection,
    timestamp: i64,
    pair: &ExchangePair,
    price: f64,
    volume: f64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO candles (timestamp, exchange, base, quote, price, volume)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            timestamp,
            pair.exchange_id(),
            pair.base().id(),
            pair.quote().id(),
            price,
            volume
        ],
    )?;
    Ok(())
}

/// Wall-clock span covered by the store, for operator sanity checks.
pub fn time_range(path: &Path) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let conn = Connection::open(path)
        .with_context(|| format!("opening candle store {}", path.display()))?;
    let range: (Option<i64>, Option<i64>) = conn.query_row(
        "SELECT MIN(timestamp), MAX(timestamp) FROM candles",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    match range {
        (Some(first), Some(last)) => {
            let first = DateTime::from_timestamp(first, 0)
                .with_context(|| format!("timestamp {first} out of range"))?;
            let last = DateTime::from_timestamp(last, 0)
                .with_context(|| format!("timestamp {last} out of range"))?;
            Ok(Some((first, last)))
        }
        _ => Ok(None),
    }
}

/// Loads the requested pairs as time-ordered frames. Each returned frame
/// holds every requested pair that has a row at that timestamp.
pub fn load_frames(path: &Path, pairs: &[ExchangePair], limit: Option<usize>) -> Result<Vec<Frame>> {
    let conn = Connection::open(path)
        .with_context(|| format!("opening candle store {}", path.display()))?;

    let mut stmt = conn.prepare(
        "SELECT timestamp, exchange, base, quote, price, volume
         FROM candles
         ORDER BY timestamp ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, f64>(4)?,
            row.get::<_, f64>(5)?,
        ))
    })?;

    let mut frames: Vec<Frame> = Vec::new();
    let mut current_ts: Option<i64> = None;
    let mut current = Frame::new();
    for row in rows {
        let (timestamp, exchange, base, quote, price, volume) = row?;
        let pair = ExchangePair::new(
            exchange,
            TradingPair::new(
                crate::models::Currency::new(base),
                crate::models::Currency::new(quote),
            )?,
        );
        if !pairs.contains(&pair) {
            continue;
        }
        if current_ts != Some(timestamp) {
            if !current.is_empty() {
                frames.push(std::mem::take(&mut current));
            }
            if let Some(limit) = limit {
                if frames.len() >= limit {
                    return Ok(frames);
                }
            }
            current_ts = Some(timestamp);
        }
        current.insert(pair, PricePoint { price, volume });
    }
    if !current.is_empty() {
        frames.push(current);
    }
    if let Some(limit) = limit {
        frames.truncate(limit);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs() -> Vec<ExchangePair> {
        vec![
            "replay-BTC-USD".parse().unwrap(),
            "replay-ETH-USD".parse().unwrap(),
        ]
    }

    fn fixture(dir: &tempfile::TempDir, ticks: i64) -> std::path::PathBuf {
        let path = dir.path().join("candles.db");
        let conn = open(&path).unwrap();
        let pairs = pairs();
        for t in 0..ticks {
            insert_candle(&conn, t * 60, &pairs[0], 100.0 + t as f64, 1.0).unwrap();
            insert_candle(&conn, t * 60, &pairs[1], 10.0 + t as f64, 2.0).unwrap();
        }
        path
    }

    #[test]
    fn test_time_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, 3);
        let (first, last) = time_range(&path).unwrap().unwrap();
        assert_eq!(first.timestamp(), 0);
        assert_eq!(last.timestamp(), 120);

        let empty = dir.path().join("empty.db");
        open(&empty).unwrap();
        assert!(time_range(&empty).unwrap().is_none());
    }

    #[test]
    fn test_load_groups_rows_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, 5);
        let frames = load_frames(&path, &pairs(), None).unwrap();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].len(), 2);
        assert_eq!(frames[2][&pairs()[0]].price, 102.0);
        assert_eq!(frames[2][&pairs()[1]].volume, 2.0);
    }

    #[test]
    fn test_load_respects_limit_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, 10);
        let just_btc = vec![pairs()[0].clone()];
        let frames = load_frames(&path, &just_btc, Some(3)).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 1));
    }

    #[test]
    fn test_tolerates_missing_pairs_per_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gappy.db");
        let conn = open(&path).unwrap();
        let pairs = pairs();
        insert_candle(&conn, 0, &pairs[0], 100.0, 1.0).unwrap();
        insert_candle(&conn, 0, &pairs[1], 10.0, 1.0).unwrap();
        insert_candle(&conn, 60, &pairs[0], 101.0, 1.0).unwrap();
        let frames = load_frames(&path, &pairs, None).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].len(), 1);
    }
}
