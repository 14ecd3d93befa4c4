use crate::config::AlignPolicy;
use crate::error::{AnalysisError, AnalysisResult};
use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Per-symbol history
// ──────────────────────────────────────────────────────────────────────────────

/// A single daily close.
#[derive(Clone, Debug, PartialEq)]
pub struct Candle {
    pub date: NaiveDate,
    pub close: f64,
}

/// Holds historical closes for a specific symbol, ordered by date.
#[derive(Clone, Debug)]
pub struct StockData {
    pub symbol: String,
    pub history: Vec<Candle>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
    #[serde(default)]
    adjclose: Option<Vec<YahooAdjClose>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooQuote {
    close: Vec<Option<f64>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooAdjClose {
    adjclose: Vec<Option<f64>>,
}

fn cache_dir() -> PathBuf {
    std::env::var("FRONTIER_CACHE_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".cache"))
}

fn fetch_retry_attempts() -> usize {
    std::env::var("FRONTIER_FETCH_RETRY_ATTEMPTS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(3)
}

fn unix_seconds(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Fetches daily closes from Yahoo Finance for `[start, end)`.
///
/// Responses are cached on disk for 24 hours under `FRONTIER_CACHE_DIR`.
pub async fn fetch_range(symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<StockData> {
    let dir = cache_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }

    let cache_file = dir.join(format!("{}_{}_{}.json", symbol, start, end));

    let response: YahooChartResponse = if cache_file.exists() {
        let metadata = std::fs::metadata(&cache_file)?;
        let modified = metadata.modified()?;
        let age = std::time::SystemTime::now().duration_since(modified)?;

        if age.as_secs() < 86400 {
            info!("Loading {} from cache...", symbol);
            let file = std::fs::File::open(&cache_file)?;
            let reader = std::io::BufReader::new(file);
            serde_json::from_reader(reader)?
        } else {
            info!("Cache expired for {}, fetching...", symbol);
            fetch_from_api(symbol, start, end, &cache_file).await?
        }
    } else {
        info!("Cache miss for {}, fetching...", symbol);
        fetch_from_api(symbol, start, end, &cache_file).await?
    };

    stock_data_from_chart(symbol, response, end)
}

async fn fetch_from_api(
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
    cache_path: &Path,
) -> Result<YahooChartResponse> {
    let url = format!(
        "https://query1.finance.yahoo.com/v8/finance/chart/{}?period1={}&period2={}&interval=1d&events=div%2Csplit",
        symbol,
        unix_seconds(start),
        unix_seconds(end)
    );

    let max_attempts = fetch_retry_attempts();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match reqwest::Client::new()
            .get(&url)
            .header("User-Agent", "Mozilla/5.0")
            .send()
            .await
        {
            Ok(resp) => match resp.json::<YahooChartResponse>().await {
                Ok(resp_json) => {
                    let file = std::fs::File::create(cache_path)?;
                    let writer = std::io::BufWriter::new(file);
                    serde_json::to_writer(writer, &resp_json)?;

                    return Ok(resp_json);
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        return Err(e.into());
                    }
                    warn!(
                        "Failed to parse JSON for {} (attempt {}/{}): {}",
                        symbol, attempts, max_attempts, e
                    );
                }
            },
            Err(e) => {
                if attempts >= max_attempts {
                    return Err(e.into());
                }
                warn!(
                    "Failed to fetch data for {} (attempt {}/{}): {}",
                    symbol, attempts, max_attempts, e
                );
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
    }
}

fn stock_data_from_chart(symbol: &str, response: YahooChartResponse, end: NaiveDate) -> Result<StockData> {
    let result = response
        .chart
        .result
        .as_ref()
        .and_then(|r| r.first())
        .ok_or(anyhow::anyhow!("No data found for {}", symbol))?;

    let quotes = result
        .indicators
        .quote
        .first()
        .ok_or(anyhow::anyhow!("No quotes found for {}", symbol))?;
    let adjusted = result
        .indicators
        .adjclose
        .as_ref()
        .and_then(|a| a.first())
        .map(|a| &a.adjclose);

    let mut history: Vec<Candle> = Vec::with_capacity(result.timestamp.len());
    for (i, &timestamp) in result.timestamp.iter().enumerate() {
        let close = adjusted
            .and_then(|a| a.get(i).copied().flatten())
            .or_else(|| quotes.close.get(i).copied().flatten());
        let Some(close) = close else {
            continue;
        };
        let Some(date) = DateTime::from_timestamp(timestamp, 0).map(|d| d.date_naive()) else {
            continue;
        };
        if date >= end {
            continue;
        }
        // Yahoo occasionally repeats the last session; keep the latest value.
        match history.last_mut() {
            Some(last) if last.date == date => last.close = close,
            _ => history.push(Candle { date, close }),
        }
    }

    Ok(StockData {
        symbol: symbol.to_uppercase(),
        history,
    })
}

/// Fetches every symbol; a symbol that cannot be fetched fails the whole universe.
pub async fn fetch_universe(symbols: &[String], start: NaiveDate, end: NaiveDate) -> Result<Vec<StockData>> {
    let mut out = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let data = fetch_range(symbol, start, end)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to fetch {}: {}", symbol, e))?;
        if data.history.is_empty() {
            return Err(anyhow::anyhow!(
                "{} has no closes between {} and {}",
                symbol,
                start,
                end
            ));
        }
        info!("{}: {} daily closes", data.symbol, data.history.len());
        out.push(data);
    }
    Ok(out)
}

// ──────────────────────────────────────────────────────────────────────────────
// Aligned price table
// ──────────────────────────────────────────────────────────────────────────────

/// Closing prices for a basket of assets on a shared, strictly increasing date index.
///
/// `closes[t][i]` is the close of `symbols[i]` on `dates[t]`.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceSeries {
    symbols: Vec<String>,
    dates: Vec<NaiveDate>,
    closes: Vec<Vec<f64>>,
}

impl PriceSeries {
    pub fn new(symbols: Vec<String>, dates: Vec<NaiveDate>, closes: Vec<Vec<f64>>) -> AnalysisResult<Self> {
        if dates.len() != closes.len() {
            return Err(AnalysisError::MisalignedSeries(format!(
                "{} dates but {} rows of closes",
                dates.len(),
                closes.len()
            )));
        }
        if let Some((row, values)) = closes.iter().enumerate().find(|(_, r)| r.len() != symbols.len()) {
            return Err(AnalysisError::MisalignedSeries(format!(
                "row {} has {} closes for {} symbols",
                row,
                values.len(),
                symbols.len()
            )));
        }
        if let Some(pos) = dates.windows(2).position(|w| w[1] <= w[0]) {
            return Err(AnalysisError::MisalignedSeries(format!(
                "dates are not strictly increasing at {} -> {}",
                dates[pos],
                dates[pos + 1]
            )));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = symbols.iter().find(|s| !seen.insert(s.as_str())) {
            return Err(AnalysisError::MisalignedSeries(format!("duplicate symbol {}", dup)));
        }
        Ok(Self { symbols, dates, closes })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.closes
    }

    pub fn num_assets(&self) -> usize {
        self.symbols.len()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Keeps the listed symbols (in that order) and the dates in
    /// `[start, end)`. `None` leaves that dimension untouched.
    pub fn select(
        &self,
        symbols: Option<&[String]>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> AnalysisResult<Self> {
        let columns: Vec<usize> = match symbols {
            Some(wanted) => wanted
                .iter()
                .map(|symbol| {
                    self.symbols.iter().position(|s| s == symbol).ok_or_else(|| {
                        AnalysisError::invalid_input("symbols", format!("{} is not in the price table", symbol))
                    })
                })
                .collect::<AnalysisResult<_>>()?,
            None => (0..self.symbols.len()).collect(),
        };

        let in_window = |d: &NaiveDate| start.is_none_or(|s| *d >= s) && end.is_none_or(|e| *d < e);
        let (dates, closes): (Vec<NaiveDate>, Vec<Vec<f64>>) = self
            .dates
            .iter()
            .zip(&self.closes)
            .filter(|(d, _)| in_window(*d))
            .map(|(d, row)| (*d, columns.iter().map(|&c| row[c]).collect()))
            .unzip();

        let selected = Self::new(columns.iter().map(|&c| self.symbols[c].clone()).collect(), dates, closes)?;
        if selected.is_empty() {
            return Err(AnalysisError::InsufficientData(
                "no prices fall inside the requested date window".to_string(),
            ));
        }
        Ok(selected)
    }

    /// Reconciles per-symbol histories onto one date index.
    pub fn align(histories: &[StockData], policy: AlignPolicy) -> AnalysisResult<Self> {
        if histories.is_empty() {
            return Err(AnalysisError::InsufficientData("no symbols to align".to_string()));
        }

        let maps: Vec<BTreeMap<NaiveDate, f64>> = histories
            .iter()
            .map(|h| h.history.iter().map(|c| (c.date, c.close)).collect())
            .collect();
        let symbols: Vec<String> = histories.iter().map(|h| h.symbol.clone()).collect();

        let union: BTreeSet<NaiveDate> = maps.iter().flat_map(|m| m.keys().copied()).collect();

        let (dates, closes) = match policy {
            AlignPolicy::DropMissing => {
                let dates: Vec<NaiveDate> = union
                    .iter()
                    .copied()
                    .filter(|d| maps.iter().all(|m| m.contains_key(d)))
                    .collect();
                let dropped = union.len() - dates.len();
                if dropped > 0 {
                    info!("Dropped {} dates not shared by every symbol", dropped);
                }
                let closes = dates
                    .iter()
                    .map(|d| maps.iter().map(|m| m[d]).collect())
                    .collect();
                (dates, closes)
            }
            AlignPolicy::ForwardFill => {
                let first_common = maps
                    .iter()
                    .filter_map(|m| m.keys().next().copied())
                    .max()
                    .ok_or_else(|| AnalysisError::InsufficientData("empty price history".to_string()))?;
                let mut last: Vec<Option<f64>> = maps.iter().map(|m| m.get(&first_common).copied()).collect();
                let mut dates = Vec::new();
                let mut closes = Vec::new();
                let mut filled = 0usize;
                for &date in union.range(first_common..) {
                    let mut row = Vec::with_capacity(maps.len());
                    for (i, m) in maps.iter().enumerate() {
                        match m.get(&date) {
                            Some(&close) => last[i] = Some(close),
                            None => filled += 1,
                        }
                        // Every symbol has a close on `first_common`, so `last` is populated.
                        row.push(last[i].unwrap_or(f64::NAN));
                    }
                    dates.push(date);
                    closes.push(row);
                }
                if filled > 0 {
                    info!("Forward-filled {} missing closes", filled);
                }
                (dates, closes)
            }
        };

        Self::new(symbols, dates, closes)
    }

    /// Reads a CSV with header `date,SYM1,SYM2,...` and ISO dates.
    pub fn from_csv_reader<R: Read>(reader: R) -> AnalysisResult<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = rdr
            .headers()
            .map_err(|e| AnalysisError::invalid_input("csv", e.to_string()))?
            .clone();
        if headers.len() < 2 {
            return Err(AnalysisError::invalid_input(
                "csv",
                "expected a date column followed by at least one symbol column",
            ));
        }
        let symbols: Vec<String> = headers.iter().skip(1).map(|s| s.to_uppercase()).collect();

        let mut dates = Vec::new();
        let mut closes = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| AnalysisError::invalid_input("csv", e.to_string()))?;
            let date = crate::config::parse_date(record.get(0).unwrap_or_default())?;
            let mut row = Vec::with_capacity(symbols.len());
            for (i, symbol) in symbols.iter().enumerate() {
                let cell = record.get(i + 1).unwrap_or_default();
                let value = cell.parse::<f64>().map_err(|_| {
                    AnalysisError::MisalignedSeries(format!(
                        "missing or unparseable close '{}' for {} on data line {}",
                        cell,
                        symbol,
                        line + 1
                    ))
                })?;
                row.push(value);
            }
            dates.push(date);
            closes.push(row);
        }

        Self::new(symbols, dates, closes)
    }

    pub fn from_csv_path(path: &Path) -> AnalysisResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            AnalysisError::invalid_input("csv", format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::from_csv_reader(std::io::BufReader::new(file))
    }

    /// Seeded geometric Brownian motion prices on consecutive days, for offline runs.
    pub fn synthetic(symbols: &[String], days: usize, seed: u64) -> AnalysisResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default();

        // Per-asset daily drift and volatility spread across a plausible range.
        let params: Vec<(f64, f64)> = (0..symbols.len())
            .map(|i| {
                let drift = 0.0001 + 0.0002 * i as f64;
                let vol = 0.01 + 0.004 * i as f64;
                (drift, vol)
            })
            .collect();
        let market = Normal::new(0.0, 0.008).map_err(|e| AnalysisError::Numerical(e.to_string()))?;
        let idiosyncratic: Vec<Normal<f64>> = params
            .iter()
            .map(|&(_, vol)| Normal::new(0.0, vol).map_err(|e| AnalysisError::Numerical(e.to_string())))
            .collect::<AnalysisResult<_>>()?;

        let mut prices: Vec<f64> = (0..symbols.len()).map(|i| 50.0 + 25.0 * i as f64).collect();
        let mut dates = Vec::with_capacity(days);
        let mut closes = Vec::with_capacity(days);
        for day in 0..days {
            let common = market.sample(&mut rng);
            for ((price, &(drift, vol)), idio) in prices.iter_mut().zip(params.iter()).zip(idiosyncratic.iter()) {
                let ret = drift - 0.5 * vol * vol + 0.6 * common + idio.sample(&mut rng);
                *price *= ret.exp();
            }
            dates.push(start + Duration::days(day as i64));
            closes.push(prices.clone());
        }

        Self::new(symbols.to_vec(), dates, closes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, d).unwrap()
    }

    fn history(symbol: &str, rows: &[(u32, f64)]) -> StockData {
        StockData {
            symbol: symbol.to_string(),
            history: rows.iter().map(|&(d, close)| Candle { date: day(d), close }).collect(),
        }
    }

    #[test]
    fn test_align_drop_missing_keeps_shared_dates() {
        let a = history("AAA", &[(1, 10.0), (2, 11.0), (3, 12.0), (4, 13.0)]);
        let b = history("BBB", &[(1, 20.0), (3, 22.0), (4, 23.0)]);

        let series = PriceSeries::align(&[a, b], AlignPolicy::DropMissing).unwrap();
        assert_eq!(series.dates(), &[day(1), day(3), day(4)]);
        assert_eq!(series.rows()[1], vec![12.0, 22.0]);
        assert_eq!(series.num_assets(), 2);
    }

    #[test]
    fn test_align_forward_fill_carries_last_close() {
        let a = history("AAA", &[(1, 10.0), (2, 11.0), (3, 12.0), (4, 13.0)]);
        let b = history("BBB", &[(2, 20.0), (4, 23.0)]);

        let series = PriceSeries::align(&[a, b], AlignPolicy::ForwardFill).unwrap();
        // Starts at the first date every symbol shares.
        assert_eq!(series.dates(), &[day(2), day(3), day(4)]);
        assert_eq!(series.rows()[1], vec![12.0, 20.0]);
        let filled: Vec<f64> = series.rows().iter().map(|r| r[1]).collect();
        assert_eq!(filled, vec![20.0, 20.0, 23.0]);
    }

    #[test]
    fn test_new_rejects_ragged_rows() {
        let result = PriceSeries::new(
            vec!["AAA".into(), "BBB".into()],
            vec![day(1), day(2)],
            vec![vec![1.0, 2.0], vec![1.0]],
        );
        assert!(matches!(result, Err(AnalysisError::MisalignedSeries(_))));
    }

    #[test]
    fn test_new_rejects_unsorted_dates() {
        let result = PriceSeries::new(
            vec!["AAA".into()],
            vec![day(2), day(1)],
            vec![vec![1.0], vec![1.0]],
        );
        assert!(matches!(result, Err(AnalysisError::MisalignedSeries(_))));
    }

    #[test]
    fn test_csv_reader() {
        let csv = "date,aaa,BBB\n2021-03-01,10.0,20.0\n2021-03-02, 10.5 ,19.0\n";
        let series = PriceSeries::from_csv_reader(csv.as_bytes()).unwrap();
        assert_eq!(series.symbols(), &["AAA".to_string(), "BBB".to_string()]);
        assert_eq!(series.len(), 2);
        assert_eq!(series.rows()[1], vec![10.5, 19.0]);
    }

    #[test]
    fn test_csv_reader_rejects_gaps() {
        let csv = "date,AAA,BBB\n2021-03-01,10.0,\n2021-03-02,10.5,19.0\n";
        let result = PriceSeries::from_csv_reader(csv.as_bytes());
        assert!(matches!(result, Err(AnalysisError::MisalignedSeries(_))));
    }

    #[test]
    fn test_select_symbols_and_window() {
        let csv = "date,AAA,BBB,CCC\n2021-03-01,10,20,30\n2021-03-02,11,21,31\n2021-03-03,12,22,32\n";
        let series = PriceSeries::from_csv_reader(csv.as_bytes()).unwrap();

        let wanted = vec!["CCC".to_string(), "AAA".to_string()];
        let selected = series.select(Some(wanted.as_slice()), Some(day(2)), Some(day(3))).unwrap();
        assert_eq!(selected.symbols(), wanted.as_slice());
        assert_eq!(selected.dates(), &[day(2)]);
        assert_eq!(selected.rows()[0], vec![31.0, 11.0]);

        assert_eq!(series.select(None, None, None).unwrap(), series);
        assert!(matches!(
            series.select(Some(&["ZZZ".to_string()][..]), None, None),
            Err(AnalysisError::InvalidInput { .. })
        ));
        assert!(matches!(
            series.select(None, Some(day(10)), None),
            Err(AnalysisError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_synthetic_is_seeded_and_positive() {
        let symbols: Vec<String> = vec!["AAA".into(), "BBB".into(), "CCC".into()];
        let a = PriceSeries::synthetic(&symbols, 120, 7).unwrap();
        let b = PriceSeries::synthetic(&symbols, 120, 7).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 120);
        assert!(a.rows().iter().flatten().all(|&p| p > 0.0 && p.is_finite()));
    }

    #[test]
    fn test_chart_response_prefers_adjusted_close() {
        let json = r#"{
            "chart": {
                "result": [{
                    "timestamp": [1614607200, 1614693600, 1614780000],
                    "indicators": {
                        "quote": [{"close": [10.0, null, 12.0]}],
                        "adjclose": [{"adjclose": [9.5, 10.5, null]}]
                    }
                }]
            }
        }"#;
        let response: YahooChartResponse = serde_json::from_str(json).unwrap();
        let data = stock_data_from_chart("aaa", response, day(31)).unwrap();
        assert_eq!(data.symbol, "AAA");
        let closes: Vec<f64> = data.history.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![9.5, 10.5, 12.0]);
    }
}
