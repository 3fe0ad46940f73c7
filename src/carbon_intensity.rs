/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod electricity_maps;
pub mod national_grid;

use crate::error::{self, FootprintError};
use anyhow::Context;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use std::{collections::HashMap, fmt, fs::File, io::Read, path::Path};
use tracing::{debug, warn};

const MINUTE_MS: f64 = 60_000.0;

/// Converts epoch milliseconds into a UTC timestamp.
pub fn to_timestamp(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Lookup key of a carbon intensity interval, rendered as `MM/DD-HH:MM` in UTC.
///
/// The year is deliberately not part of the key. CI files cover a handful of days and traces
/// are joined against them by calendar position only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CiKey {
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
}
impl CiKey {
    pub fn from_datetime(ts: &DateTime<Utc>) -> Self {
        CiKey {
            month: ts.month(),
            day: ts.day(),
            hour: ts.hour(),
            minute: ts.minute(),
        }
    }

    pub fn from_millis(ms: i64) -> Option<Self> {
        to_timestamp(ms).map(|ts| CiKey::from_datetime(&ts))
    }

    /// Renders the key for a timestamp, falling back to the raw millisecond value when the
    /// timestamp is out of range. Used for error reporting.
    pub fn describe(ms: i64) -> String {
        CiKey::from_millis(ms)
            .map(|key| key.to_string())
            .unwrap_or_else(|| ms.to_string())
    }
}
impl fmt::Display for CiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}/{:02}-{:02}:{:02}",
            self.month, self.day, self.hour, self.minute
        )
    }
}

/// One raw sampling interval reported by a grid operator.
#[derive(Debug, Clone, PartialEq)]
pub struct CiInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Actual carbon intensity, gCO2e/kWh.
    pub value: f64,
    pub forecast: Option<f64>,
    pub index: Option<String>,
}
impl CiInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, value: f64) -> Self {
        CiInterval {
            start,
            end,
            value,
            forecast: None,
            index: None,
        }
    }

    pub fn key(&self) -> CiKey {
        CiKey::from_datetime(&self.start)
    }

    fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

/// Time-keyed carbon intensity lookup built once from an external source and read-only
/// afterwards.
#[derive(Debug, Clone, Default)]
pub struct CiTable {
    intervals: Vec<CiInterval>,
    values: HashMap<CiKey, f64>,
}
impl CiTable {
    pub fn new(mut intervals: Vec<CiInterval>) -> Self {
        intervals.sort_by_key(|interval| interval.start);

        let mut values = HashMap::new();
        for interval in intervals.iter() {
            if values.insert(interval.key(), interval.value).is_some() {
                warn!(
                    "Duplicate carbon intensity key [{}], keeping the later interval",
                    interval.key()
                );
            }
        }

        CiTable { intervals, values }
    }

    pub fn intervals(&self) -> &[CiInterval] {
        &self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn get(&self, key: &CiKey) -> Option<f64> {
        self.values.get(key).copied()
    }

    /// Looks up the interval starting at the given bucket timestamp.
    pub fn value_at(&self, ms: i64) -> error::Result<f64> {
        CiKey::from_millis(ms)
            .and_then(|key| self.get(&key))
            .ok_or_else(|| FootprintError::MissingCiInterval {
                key: CiKey::describe(ms),
            })
    }

    /// Mean carbon intensity over `[start_ms, end_ms)`, each overlapping interval weighted by
    /// its minutes of overlap. Every millisecond of the span must be covered by the table.
    pub fn weighted_average(&self, start_ms: i64, end_ms: i64) -> error::Result<f64> {
        let mut cursor = start_ms;
        let mut weighted_sum = 0.0;
        let mut total_minutes = 0.0;

        for interval in self.intervals.iter() {
            if interval.end_ms() <= cursor {
                continue;
            }
            // done, or a gap in the table
            if cursor >= end_ms || interval.start_ms() > cursor {
                break;
            }

            let overlap_end = interval.end_ms().min(end_ms);
            let minutes = (overlap_end - cursor) as f64 / MINUTE_MS;
            weighted_sum += interval.value * minutes;
            total_minutes += minutes;
            cursor = overlap_end;
        }

        if cursor < end_ms || total_minutes <= 0.0 {
            return Err(FootprintError::MissingCiInterval {
                key: CiKey::describe(cursor),
            });
        }

        Ok(weighted_sum / total_minutes)
    }

    /// Reads the `date,start,end,forecast,actual,index` layout. Only `date`, `start` and
    /// `actual` are required; when `end` is missing each interval is assumed to last an hour.
    pub fn parse_csv<R: Read>(reader: R) -> anyhow::Result<CiTable> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let header = reader.headers()?.clone();
        let find = |name: &str| header.iter().position(|h| h == name);
        let date_i = find("date").context("CI file is missing column [date]")?;
        let start_i = find("start").context("CI file is missing column [start]")?;
        let actual_i = find("actual").context("CI file is missing column [actual]")?;
        let end_i = find("end");
        let forecast_i = find("forecast");
        let index_i = find("index");

        let mut intervals = vec![];
        for (line, row) in reader.records().enumerate() {
            let row = row?;
            let field = |i: usize| row.get(i).unwrap_or("").trim();

            let actual = field(actual_i);
            if actual.is_empty() {
                warn!("Skipping CI row {} with no actual value", line + 2);
                continue;
            }

            let date = parse_date(field(date_i))?;
            let start = parse_time(field(start_i))?;
            let start = Utc.from_utc_datetime(&date.and_time(start));

            let end = match end_i.map(field).filter(|end| !end.is_empty()) {
                Some(end) => {
                    let end = Utc.from_utc_datetime(&date.and_time(parse_time(end)?));
                    // `23:30 -> 00:00` crosses midnight
                    if end <= start {
                        end + Duration::days(1)
                    } else {
                        end
                    }
                }
                None => start + Duration::hours(1),
            };

            let value = actual
                .parse::<f64>()
                .context(format!("Unable to parse CI value [{}] on row {}", actual, line + 2))?;

            intervals.push(CiInterval {
                start,
                end,
                value,
                forecast: forecast_i.and_then(|i| field(i).parse::<f64>().ok()),
                index: index_i
                    .map(field)
                    .filter(|index| !index.is_empty())
                    .map(str::to_string),
            });
        }

        debug!("loaded {} carbon intensity intervals", intervals.len());
        Ok(CiTable::new(intervals))
    }

    pub fn from_csv(path: &Path) -> anyhow::Result<CiTable> {
        let file = File::open(path).context(format!("Unable to open CI file {:?}", path))?;
        CiTable::parse_csv(file).context(format!("Error parsing CI file {:?}", path))
    }

    pub fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer =
            csv::Writer::from_path(path).context(format!("Unable to create CI file {:?}", path))?;
        writer.write_record(["date", "start", "end", "forecast", "actual", "index"])?;

        for interval in self.intervals.iter() {
            writer.write_record([
                interval.start.format("%Y-%m-%d").to_string(),
                interval.start.format("%H:%M").to_string(),
                interval.end.format("%H:%M").to_string(),
                interval
                    .forecast
                    .map(|forecast| forecast.to_string())
                    .unwrap_or_default(),
                interval.value.to_string(),
                interval.index.clone().unwrap_or_default(),
            ])?;
        }
        writer.flush()?;

        Ok(())
    }
}

fn parse_date(date: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date, "%Y/%m/%d"))
        .context(format!("Unable to parse CI date [{}]", date))
}

fn parse_time(time: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(time, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M:%S"))
        .context(format!("Unable to parse CI time [{}]", time))
}

/// Carbon intensity applied during aggregation: either a single externally supplied value or
/// a time series.
#[derive(Debug, Clone)]
pub enum CarbonIntensity {
    Constant(f64),
    Series(CiTable),
}
impl CarbonIntensity {
    /// Interprets a CLI argument as a constant value if it parses as a number, otherwise as
    /// the path of a CI file.
    pub fn from_arg(arg: &str) -> anyhow::Result<Self> {
        match arg.trim().parse::<f64>() {
            Ok(value) => Ok(CarbonIntensity::Constant(value)),
            Err(_) => Ok(CarbonIntensity::Series(CiTable::from_csv(Path::new(arg))?)),
        }
    }

    /// Value for the bucket starting at `bucket_ms`.
    pub fn value_for(&self, bucket_ms: i64) -> error::Result<f64> {
        match self {
            CarbonIntensity::Constant(value) => Ok(*value),
            CarbonIntensity::Series(table) => table.value_at(bucket_ms),
        }
    }

    /// Value for an unbucketed span, time-weighted across the raw intervals it overlaps.
    pub fn weighted_value(&self, start_ms: i64, end_ms: i64) -> error::Result<f64> {
        match self {
            CarbonIntensity::Constant(value) => Ok(*value),
            CarbonIntensity::Series(table) => table.weighted_average(start_ms, end_ms),
        }
    }
}
