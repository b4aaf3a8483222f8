//! Signal intake: polls the selection file and emits accepted signals.
//!
//! The file is a CSV with header, produced by an external selector. Rows
//! with `leido == "no"` are candidates; each is marked `si` (processed) or
//! `timeout` (expired) in the file before any signal is emitted, via an
//! atomic temp-write-and-rename, so a slow consumer can never cause a row
//! to be processed twice.
//!
//! Tolerant input handling: UTF-8 with or without BOM, CRLF or LF endings,
//! headers padded with spaces.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, Trim};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::BotConfig;
use crate::types::Signal;

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("intake task failed: {0}")]
    Internal(String),
}

/// Row identity within the signal file.
type RowKey = (String, String, String);

/// New `leido` value for a row.
type RowMark = (RowKey, &'static str);

/// Acceptance thresholds, extracted from the strategy config.
#[derive(Debug, Clone)]
pub struct IntakeFilters {
    pub top_n: u32,
    pub max_age_minutes: f64,
    pub min_momentum_pct: f64,
    pub min_vol_ratio: f64,
    pub min_trades_ratio: f64,
    pub allowed_quintiles: Vec<u32>,
}

impl IntakeFilters {
    pub fn from_config(cfg: &BotConfig) -> Self {
        Self {
            top_n: cfg.strategy.top_n,
            max_age_minutes: cfg.signals.max_signal_age_minutes,
            min_momentum_pct: cfg.strategy.min_momentum_pct,
            min_vol_ratio: cfg.strategy.min_vol_ratio,
            min_trades_ratio: cfg.strategy.min_trades_ratio,
            allowed_quintiles: cfg.strategy.allowed_quintiles.clone(),
        }
    }

    /// Reject reason for a parsed signal, or `None` when it passes.
    fn reject_reason(&self, sig: &Signal) -> Option<String> {
        if sig.momentum_1h_pct < self.min_momentum_pct {
            return Some(format!(
                "momentum_1h={:.2} below {}",
                sig.momentum_1h_pct, self.min_momentum_pct
            ));
        }
        if self.min_vol_ratio > 0.0 && sig.vol_ratio < self.min_vol_ratio {
            return Some(format!(
                "vol_ratio={:.2} below {}",
                sig.vol_ratio, self.min_vol_ratio
            ));
        }
        if self.min_trades_ratio > 0.0 && sig.trades_ratio < self.min_trades_ratio {
            return Some(format!(
                "trades_ratio={:.2} below {}",
                sig.trades_ratio, self.min_trades_ratio
            ));
        }
        if sig.quintile != 0 && !self.allowed_quintiles.contains(&sig.quintile) {
            return Some(format!(
                "quintile={} not in {:?}",
                sig.quintile, self.allowed_quintiles
            ));
        }
        None
    }
}

/// Scan the file content: returns accepted signals and the row markings to
/// write back. Only rows with `leido == "no"` are considered.
pub fn scan(
    content: &str,
    filters: &IntakeFilters,
    now: DateTime<Utc>,
) -> Result<(Vec<Signal>, Vec<RowMark>), SignalError> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = reader.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h == name);
    let field = |record: &csv::StringRecord, idx: Option<usize>| -> String {
        idx.and_then(|i| record.get(i)).unwrap_or("").to_string()
    };

    let (c_ts, c_pair, c_rank, c_leido) = (col("fecha_hora"), col("par"), col("top"), col("leido"));
    let (c_close, c_mom1h, c_mom, c_vol, c_trades, c_quintil) = (
        col("close"),
        col("mom_1h_pct"),
        col("mom_pct"),
        col("vol_ratio"),
        col("trades_ratio"),
        col("quintil"),
    );

    let mut signals = Vec::new();
    let mut marks: Vec<RowMark> = Vec::new();

    for record in reader.records() {
        let record = record?;
        if field(&record, c_leido).to_lowercase() != "no" {
            continue;
        }

        let source_ts = field(&record, c_ts);
        let pair = field(&record, c_pair);
        let rank_raw = field(&record, c_rank);
        let key = (source_ts.clone(), pair.clone(), rank_raw.clone());

        let Ok(naive) = NaiveDateTime::parse_from_str(&source_ts, TIMESTAMP_FORMAT) else {
            warn!(ts = %source_ts, "malformed signal timestamp");
            marks.push((key, "si"));
            continue;
        };
        let signal_dt = naive.and_utc();

        let age_minutes = (now - signal_dt).num_seconds() as f64 / 60.0;
        if age_minutes > filters.max_age_minutes {
            info!(pair = %pair, age_minutes, "signal expired");
            marks.push((key, "timeout"));
            continue;
        }

        let Ok(rank) = rank_raw.parse::<u32>() else {
            marks.push((key, "si"));
            continue;
        };
        if rank > filters.top_n {
            marks.push((key, "si"));
            continue;
        }

        let parsed = (|| -> Option<Signal> {
            Some(Signal {
                source_ts: source_ts.clone(),
                pair: pair.clone(),
                rank,
                close: field(&record, c_close).parse::<Decimal>().ok()?,
                momentum_1h_pct: field(&record, c_mom1h).parse().ok()?,
                momentum_pct: field(&record, c_mom).parse().ok()?,
                vol_ratio: field(&record, c_vol).parse().ok()?,
                trades_ratio: field(&record, c_trades).parse().ok()?,
                quintile: field(&record, c_quintil).parse::<f64>().ok()? as u32,
                received_at: now,
            })
        })();
        let Some(sig) = parsed else {
            warn!(pair = %pair, "malformed signal row");
            marks.push((key, "si"));
            continue;
        };

        if let Some(reason) = filters.reject_reason(&sig) {
            info!(pair = %pair, reason, "signal filtered out");
            marks.push((key, "si"));
            continue;
        }

        info!(
            pair = %pair,
            rank,
            momentum_1h = sig.momentum_1h_pct,
            vol_ratio = sig.vol_ratio,
            quintile = sig.quintile,
            "signal accepted"
        );
        signals.push(sig);
        marks.push((key, "si"));
    }

    Ok((signals, marks))
}

/// Rewrite the `leido` column for the marked rows, preserving unknown
/// columns and each line's own ending.
pub fn apply_marks(content: &str, marks: &[RowMark]) -> Option<String> {
    let updates: HashMap<&RowKey, &'static str> = marks.iter().map(|(k, v)| (k, *v)).collect();
    let mut lines = content.split_inclusive('\n');

    let header_line = lines.next()?;
    let headers: Vec<String> = header_line
        .trim_end_matches(['\r', '\n'])
        .split(',')
        .map(|h| h.trim().to_string())
        .collect();
    let idx = |name: &str| headers.iter().position(|h| h == name);
    let leido_idx = idx("leido")?;
    let (ts_idx, pair_idx, rank_idx) = (idx("fecha_hora"), idx("par"), idx("top"));

    let mut out = String::with_capacity(content.len());
    out.push_str(header_line);

    for line in lines {
        let stripped = line.trim_end_matches(['\r', '\n']);
        if stripped.is_empty() {
            out.push_str(line);
            continue;
        }
        let ending = &line[stripped.len()..];
        let mut parts: Vec<&str> = stripped.split(',').collect();
        let part = |i: Option<usize>| -> String {
            i.and_then(|i| parts.get(i)).map(|s| s.trim().to_string()).unwrap_or_default()
        };
        let key = (part(ts_idx), part(pair_idx), part(rank_idx));
        match updates.get(&key) {
            Some(mark) if leido_idx < parts.len() => {
                parts[leido_idx] = mark;
                out.push_str(&parts.join(","));
                out.push_str(ending);
            }
            _ => out.push_str(line),
        }
    }
    Some(out)
}

/// Polls the signal file and emits accepted signals on a channel.
pub struct SignalIntake {
    path: PathBuf,
    poll_interval: std::time::Duration,
    filters: IntakeFilters,
    out: mpsc::Sender<Signal>,
}

impl SignalIntake {
    pub fn new(cfg: &BotConfig, out: mpsc::Sender<Signal>) -> Self {
        Self {
            path: PathBuf::from(&cfg.signals.file_path),
            poll_interval: std::time::Duration::from_secs(cfg.signals.poll_interval_seconds),
            filters: IntakeFilters::from_config(cfg),
            out,
        }
    }

    /// Poll until shutdown. Each tick re-reads the file only when its
    /// modification time advanced.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(path = %self.path.display(), interval = ?self.poll_interval, "signal intake started");
        let mut last_mtime: Option<SystemTime> = None;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.poll_once(&mut last_mtime).await {
                        error!(error = %e, "signal poll failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("signal intake stopped");
                    return;
                }
            }
        }
    }

    async fn poll_once(&self, last_mtime: &mut Option<SystemTime>) -> Result<(), SignalError> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(_) => return Ok(()), // file not there yet
        };
        let mtime = meta.modified()?;
        if last_mtime.map(|prev| mtime <= prev).unwrap_or(false) {
            return Ok(());
        }
        *last_mtime = Some(mtime);

        let raw = tokio::fs::read(&self.path).await?;
        let content = decode_utf8(&raw);
        let (signals, marks) = scan(&content, &self.filters, Utc::now())?;

        // Mark rows before emitting so a slow consumer cannot re-process.
        if !marks.is_empty() {
            let path = self.path.clone();
            let marked = apply_marks(&content, &marks);
            tokio::task::spawn_blocking(move || -> Result<(), SignalError> {
                let Some(marked) = marked else {
                    warn!("signal file has no 'leido' column; rows not marked");
                    return Ok(());
                };
                write_atomic(&path, &marked)?;
                Ok(())
            })
            .await
            .map_err(|e| SignalError::Internal(e.to_string()))??;
            debug!(rows = marks.len(), "signal rows marked");
        }

        for sig in signals {
            if self.out.send(sig).await.is_err() {
                warn!("signal channel closed");
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Decode file bytes as UTF-8, stripping a leading BOM if present.
fn decode_utf8(raw: &[u8]) -> String {
    let raw = raw.strip_prefix(b"\xef\xbb\xbf").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Write via temp file and rename so concurrent readers never see a partial
/// file.
fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}
