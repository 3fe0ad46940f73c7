/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    error::{self, FootprintError},
    estimate::Usage,
};
use anyhow::Context;
use phf::phf_map;
use serde::Serialize;
use std::{fs::File, io::Read, path::Path};
use tracing::debug;

/// Bytes per unit. Memory is normalised to decimal gigabytes (bytes / 1e9).
static MEMORY_UNITS: phf::Map<&'static str, f64> = phf_map! {
    "B" => 1.0,
    "KB" => 1e3, "MB" => 1e6, "GB" => 1e9, "TB" => 1e12,
    "KIB" => 1024.0, "MIB" => 1_048_576.0, "GIB" => 1_073_741_824.0, "TIB" => 1_099_511_627_776.0,
};

const BYTES_PER_GB: f64 = 1e9;

/// A single executed task taken from a workflow trace, normalised at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub name: String,
    /// Start timestamp in milliseconds since the epoch.
    pub start: i64,
    /// Completion timestamp in milliseconds since the epoch.
    pub complete: i64,
    /// Reported wall-clock runtime in milliseconds. May include overhead beyond
    /// `complete - start`.
    pub realtime: i64,
    pub cpu_count: u32,
    /// Aggregate utilisation across all cores, 100 per fully used core.
    pub cpu_usage: f64,
    pub cpu_model: Option<String>,
    pub memory_gb: f64,
}
impl TaskRecord {
    pub fn validate(&self) -> error::Result<()> {
        if self.cpu_count == 0 {
            return Err(FootprintError::invalid_record(&self.name, "zero cores allocated"));
        }
        if self.complete <= self.start {
            return Err(FootprintError::invalid_record(
                &self.name,
                format!("complete ({}) is not after start ({})", self.complete, self.start),
            ));
        }
        if self.realtime < 0 {
            return Err(FootprintError::invalid_record(&self.name, "negative realtime"));
        }
        if self.cpu_usage.is_nan() || self.cpu_usage < 0.0 {
            return Err(FootprintError::invalid_record(
                &self.name,
                "cpu usage is negative or not a number",
            ));
        }
        if self.memory_gb.is_nan() || self.memory_gb < 0.0 {
            return Err(FootprintError::invalid_record(
                &self.name,
                "memory is negative or not a number",
            ));
        }
        Ok(())
    }

    pub fn duration(&self) -> i64 {
        self.complete - self.start
    }

    /// The whole task as seen by an energy model, using its reported runtime.
    pub fn usage(&self) -> Usage<'_> {
        Usage {
            name: &self.name,
            realtime: self.realtime,
            cpu_count: self.cpu_count,
            cpu_usage: self.cpu_usage,
            cpu_model: self.cpu_model.as_deref(),
            memory_gb: self.memory_gb,
        }
    }

    /// Returns a copy of this record moved by `offset_ms` (negative moves it earlier).
    pub fn shifted(&self, offset_ms: i64) -> TaskRecord {
        TaskRecord {
            start: self.start + offset_ms,
            complete: self.complete + offset_ms,
            ..self.clone()
        }
    }
}

/// Column positions of a trace header. Only the columns the estimator needs are tracked.
#[derive(Debug)]
struct Columns {
    name: usize,
    start: usize,
    complete: usize,
    realtime: Option<usize>,
    cpus: usize,
    cpu_usage: usize,
    memory: usize,
    cpu_model: Option<usize>,
}
impl Columns {
    fn from_header(header: &csv::StringRecord) -> anyhow::Result<Self> {
        let find = |name: &str| header.iter().position(|h| h == name);
        let require = |name: &str| find(name).context(format!("Trace is missing column [{}]", name));

        Ok(Columns {
            name: require("name")?,
            start: require("start")?,
            complete: require("complete")?,
            realtime: find("realtime").or(find("duration")),
            cpus: require("cpus")?,
            cpu_usage: require("%cpu")?,
            memory: require("memory")?,
            cpu_model: find("cpu_model"),
        })
    }
}

fn is_blank(value: &str) -> bool {
    value.is_empty() || value == "-"
}

/// Parses a timestamp in ms. Fractional values (e.g. written by older shifting tools) are
/// truncated.
pub fn parse_millis(value: &str) -> anyhow::Result<i64> {
    let value = value.trim();
    match value.parse::<i64>() {
        Ok(ms) => Ok(ms),
        Err(_) => value
            .parse::<f64>()
            .map(|ms| ms as i64)
            .context(format!("Unable to parse timestamp [{}]", value)),
    }
}

/// Parses a CPU percentage such as `117.7%`.
pub fn parse_cpu_usage(value: &str) -> anyhow::Result<f64> {
    let value = value.trim();
    if is_blank(value) {
        return Ok(0.0);
    }

    value
        .trim_end_matches('%')
        .trim()
        .parse::<f64>()
        .context(format!("Unable to parse cpu usage [{}]", value))
}

/// Parses a memory amount into gigabytes. Accepts `4 GB`, `512MB`, `1.5 GiB` or a bare
/// number of bytes.
pub fn parse_memory_gb(value: &str) -> anyhow::Result<f64> {
    let value = value.trim();
    if is_blank(value) {
        return Ok(0.0);
    }

    let split_at = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (amount, unit) = value.split_at(split_at);

    let amount = amount
        .trim()
        .parse::<f64>()
        .context(format!("Unable to parse memory amount [{}]", value))?;

    let unit = unit.trim().to_uppercase();
    let bytes_per_unit = if unit.is_empty() {
        1.0
    } else {
        *MEMORY_UNITS
            .get(unit.as_str())
            .context(format!("Unknown memory unit [{}]", unit))?
    };

    Ok(amount * bytes_per_unit / BYTES_PER_GB)
}

fn parse_row(columns: &Columns, row: &csv::StringRecord) -> anyhow::Result<TaskRecord> {
    let field = |i: usize| row.get(i).unwrap_or("").trim();

    let name = field(columns.name).to_string();
    let start = parse_millis(field(columns.start))?;
    let complete = parse_millis(field(columns.complete))?;

    let realtime = match columns.realtime.map(field) {
        Some(value) if !is_blank(value) => parse_millis(value)?,
        _ => complete - start,
    };

    let cpu_count = field(columns.cpus)
        .parse::<u32>()
        .context(format!("Unable to parse cpus [{}]", field(columns.cpus)))?;

    let cpu_model = columns
        .cpu_model
        .map(field)
        .filter(|model| !is_blank(model))
        .map(str::to_string);

    Ok(TaskRecord {
        name,
        start,
        complete,
        realtime,
        cpu_count,
        cpu_usage: parse_cpu_usage(field(columns.cpu_usage))?,
        cpu_model,
        memory_gb: parse_memory_gb(field(columns.memory))?,
    })
}

/// Reads a comma delimited trace with a header row.
pub fn parse_trace<R: Read>(reader: R) -> anyhow::Result<Vec<TaskRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let columns = Columns::from_header(reader.headers()?)?;
    debug!("trace columns {:?}", columns);

    let mut records = vec![];
    for (line, row) in reader.records().enumerate() {
        let row = row?;
        let record = parse_row(&columns, &row)
            .context(format!("Error parsing trace row {}", line + 2))?;
        records.push(record);
    }

    Ok(records)
}

pub fn load_trace(path: &Path) -> anyhow::Result<Vec<TaskRecord>> {
    let file = File::open(path).context(format!("Unable to open trace {:?}", path))?;
    parse_trace(file)
}

/// Copies a trace file, moving every `start` and `complete` value by `offset_ms`. All other
/// columns are written back untouched.
pub fn shift_trace_file(input: &Path, output: &Path, offset_ms: i64) -> anyhow::Result<usize> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(input)
        .context(format!("Unable to open trace {:?}", input))?;

    let header = reader.headers()?.clone();
    let find = |name: &str| {
        header
            .iter()
            .position(|h| h.trim() == name)
            .context(format!("Trace is missing column [{}]", name))
    };
    let start_i = find("start")?;
    let complete_i = find("complete")?;

    let mut writer = csv::Writer::from_path(output)
        .context(format!("Unable to create trace {:?}", output))?;
    writer.write_record(&header)?;

    let mut rows = 0;
    for row in reader.records() {
        let row = row?;
        let shifted = row
            .iter()
            .enumerate()
            .map(|(i, value)| {
                if i == start_i || i == complete_i {
                    parse_millis(value).map(|ms| (ms + offset_ms).to_string())
                } else {
                    Ok(value.to_string())
                }
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        writer.write_record(&shifted)?;
        rows += 1;
    }
    writer.flush()?;

    Ok(rows)
}
