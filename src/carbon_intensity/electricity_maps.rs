/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Hourly exports of the Electricity Maps Data Portal.
//!
//! Portal files carry one row per hour with the UTC timestamp in the first column and the
//! direct carbon intensity in the fifth. Great Britain files write dates as `DD/MM/YYYY`,
//! every other zone as `YYYY-MM-DD`.

use super::{CiInterval, CiTable};
use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::{fs::File, io::Read, path::Path};
use tracing::{debug, info, warn};

const DATETIME_COLUMN: &str = "datetime_utc";
const CI_DIRECT_COLUMN: &str = "ci_direct";
const DATETIME_FALLBACK: usize = 0;
const CI_DIRECT_FALLBACK: usize = 4;

static DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Reads a portal export and keeps the hours falling on any day from `from` to `to`
/// inclusive. Each row becomes a one hour interval.
pub fn parse_portal<R: Read>(
    reader: R,
    from: NaiveDate,
    to: NaiveDate,
) -> anyhow::Result<CiTable> {
    if from > to {
        anyhow::bail!("Export range is reversed, {} is after {}", from, to);
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    // downloaded files use display names, renamed copies use the short ones
    let header = reader.headers()?.clone();
    let find = |name: &str| header.iter().position(|h| h == name);
    let datetime_i = find(DATETIME_COLUMN).unwrap_or(DATETIME_FALLBACK);
    let ci_i = find(CI_DIRECT_COLUMN).unwrap_or(CI_DIRECT_FALLBACK);

    let mut intervals = vec![];
    for (line, row) in reader.records().enumerate() {
        let row = row?;
        let field = |i: usize| row.get(i).unwrap_or("").trim();

        let datetime = field(datetime_i);
        let start = parse_datetime(datetime).context(format!(
            "Unable to parse portal timestamp [{}] on row {}",
            datetime,
            line + 2
        ))?;

        let day = start.date_naive();
        if day < from || day > to {
            continue;
        }

        let ci = field(ci_i);
        if ci.is_empty() {
            warn!("Skipping portal row {} with no carbon intensity", line + 2);
            continue;
        }
        let value = ci
            .parse::<f64>()
            .context(format!("Unable to parse CI value [{}] on row {}", ci, line + 2))?;

        intervals.push(CiInterval::new(start, start + Duration::hours(1), value));
    }

    if intervals.is_empty() {
        anyhow::bail!("No hourly data between {} and {}", from, to);
    }

    debug!("kept {} hourly intervals", intervals.len());
    Ok(CiTable::new(intervals))
}

/// Converts the days `from` to `to` of a portal export file into a CI table.
pub fn export_intervals(
    input: &Path,
    from: NaiveDate,
    to: NaiveDate,
) -> anyhow::Result<CiTable> {
    let file = File::open(input).context(format!("Unable to open portal export {:?}", input))?;
    let table = parse_portal(file, from, to)
        .context(format!("Error converting portal export {:?}", input))?;

    info!(
        "{} hours of carbon intensity from {} to {} read from {:?}",
        table.len(),
        from,
        to,
        input
    );
    Ok(table)
}
