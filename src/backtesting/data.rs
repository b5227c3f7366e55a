// Historical bar sources: CSV files and the exchange history endpoint

use chrono::{DateTime, TimeZone, Utc};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::backtesting::engine::BacktestError;
use crate::backtesting::HistoricalData;
use crate::clients::{BitgetRestClient, MAX_CANDLES_PER_CALL};
use crate::core::types::Bar;

/// Load `timestamp,open,high,low,close,volume` rows. Timestamps may be epoch
/// milliseconds or RFC3339. A header row is skipped.
pub fn load_csv<P: AsRef<Path>>(path: P, symbol: &str, interval_minutes: u32) -> Result<HistoricalData, BacktestError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| BacktestError::Io(format!("{}: {}", path.display(), e)))?;

    let mut bars = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if line_no == 0 && fields.first().map_or(false, |f| f.eq_ignore_ascii_case("timestamp")) {
            continue;
        }
        bars.push(parse_row(&fields).map_err(|reason| {
            BacktestError::MalformedData(format!("{} line {}: {}", path.display(), line_no + 1, reason))
        })?);
    }

    let data = HistoricalData::new(symbol, interval_minutes, bars);
    data.validate()?;
    info!(symbol, bars = data.len(), file = %path.display(), "📁 Loaded historical bars");
    Ok(data)
}

fn parse_row(fields: &[&str]) -> Result<Bar, String> {
    if fields.len() < 6 {
        return Err(format!("expected 6 columns, found {}", fields.len()));
    }
    let number = |i: usize| -> Result<f64, String> {
        fields[i]
            .parse::<f64>()
            .map_err(|_| format!("column {} is not a number: {:?}", i + 1, fields[i]))
    };
    Ok(Bar {
        timestamp: parse_timestamp(fields[0])?,
        open: number(1)?,
        high: number(2)?,
        low: number(3)?,
        close: number(4)?,
        volume: number(5)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| format!("timestamp out of range: {}", raw));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("unrecognized timestamp: {:?}", raw))
}

/// A bounded request for historical bars
#[derive(Debug, Clone)]
pub struct BarRequest {
    pub symbol: String,
    pub interval_minutes: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BarRequest {
    pub fn new(symbol: &str, interval_minutes: u32, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval_minutes,
            start,
            end,
        }
    }

    /// Request covering the `days` before `end`
    pub fn last_days(symbol: &str, interval_minutes: u32, days: i64, end: DateTime<Utc>) -> Self {
        Self::new(symbol, interval_minutes, end - chrono::Duration::days(days), end)
    }

    pub fn bar_count(&self) -> usize {
        let span = (self.end - self.start).num_minutes().max(0) as usize;
        span / self.interval_minutes.max(1) as usize
    }

    /// Oversized ranges are refused outright rather than truncated
    pub fn validate(&self, max_bars: usize) -> Result<(), BacktestError> {
        if self.interval_minutes == 0 {
            return Err(BacktestError::RangeRejected("interval must be positive".to_string()));
        }
        if self.end <= self.start {
            return Err(BacktestError::RangeRejected(format!(
                "empty range {} .. {}",
                self.start, self.end
            )));
        }
        let count = self.bar_count();
        if count > max_bars {
            return Err(BacktestError::RangeRejected(format!(
                "{} bars requested for {}, limit is {}",
                count, self.symbol, max_bars
            )));
        }
        Ok(())
    }
}

/// Pages through the exchange history endpoint
pub struct HistoricalClient {
    rest: BitgetRestClient,
    max_bars: usize,
}

impl HistoricalClient {
    pub fn new(rest: BitgetRestClient, max_bars: usize) -> Self {
        Self { rest, max_bars }
    }

    pub async fn fetch_range(&self, request: &BarRequest) -> Result<HistoricalData, BacktestError> {
        request.validate(self.max_bars)?;

        let step = chrono::Duration::minutes(request.interval_minutes as i64);
        let page_span = step * MAX_CANDLES_PER_CALL as i32;
        let mut bars: Vec<Bar> = Vec::with_capacity(request.bar_count());
        let mut cursor = request.start;

        while cursor < request.end {
            let page_end = (cursor + page_span).min(request.end);
            let page = self
                .rest
                .history_candles(&request.symbol, request.interval_minutes, cursor, page_end, MAX_CANDLES_PER_CALL)
                .await?;
            debug!(symbol = %request.symbol, from = %cursor, bars = page.len(), "history page");
            bars.extend(page);
            cursor = page_end;
        }

        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);

        let data = HistoricalData::new(&request.symbol, request.interval_minutes, bars);
        if data.len() < 2 {
            return Err(BacktestError::InsufficientData(format!(
                "exchange returned {} bars for {}",
                data.len(),
                request.symbol
            )));
        }
        data.validate()?;
        info!(symbol = %request.symbol, bars = data.len(), "📥 Fetched historical bars");
        Ok(data)
    }
}
