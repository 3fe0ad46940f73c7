/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{CiInterval, CiTable};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, info};

const NATIONAL_GRID_API_BASE_URL: &str = "https://api.carbonintensity.org.uk/intensity/date";

fn parse_api_time(time: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(time, "%Y-%m-%dT%H:%MZ")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn try_parse_interval(json_obj: &Value) -> Option<CiInterval> {
    let start = parse_api_time(json_obj.get("from")?.as_str()?)?;
    let end = parse_api_time(json_obj.get("to")?.as_str()?)?;

    let intensity = json_obj.get("intensity")?;
    let forecast = intensity.get("forecast").and_then(Value::as_f64);
    // the most recent intervals have not been measured yet
    let value = intensity
        .get("actual")
        .and_then(Value::as_f64)
        .or(forecast)?;
    let index = intensity
        .get("index")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(CiInterval {
        start,
        end,
        value,
        forecast,
        index,
    })
}

/// Parses the body of a `/intensity/date/{date}` response.
pub fn parse_day(json_obj: &Value) -> anyhow::Result<Vec<CiInterval>> {
    let data = json_obj
        .get("data")
        .and_then(Value::as_array)
        .context("National Grid response has no data array")?;

    data.iter()
        .map(|entry| {
            try_parse_interval(entry)
                .context(format!("Error parsing National Grid interval {}", entry))
        })
        .collect()
}

/// True when the interval contains `start`, lies inside `[start, end]` or contains `end`.
pub fn within_bound(interval: &CiInterval, start: &DateTime<Utc>, end: &DateTime<Utc>) -> bool {
    (interval.start <= *start && interval.end > *start)
        || (interval.start >= *start && interval.end <= *end)
        || (interval.start < *end && interval.end >= *end)
}

async fn fetch_day(client: &reqwest::Client, day: NaiveDate) -> anyhow::Result<Vec<CiInterval>> {
    let url = format!("{}/{}", NATIONAL_GRID_API_BASE_URL, day.format("%Y-%m-%d"));
    debug!("fetching {}", url);

    let resp = client
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await?
        .error_for_status()?;

    let json_obj = resp.json().await?;
    parse_day(&json_obj)
}

/// Fetches the half-hourly carbon intensity of Great Britain for every interval overlapping
/// `[start, end]`.
pub async fn fetch_intervals(start: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<CiTable> {
    if end < start {
        anyhow::bail!("End of the requested CI range is before its start");
    }

    let client = reqwest::Client::new();
    let mut intervals = vec![];

    let mut day = start.date_naive();
    while day <= end.date_naive() {
        let day_intervals = fetch_day(&client, day)
            .await
            .context(format!("Error fetching carbon intensity for {}", day))?;

        intervals.extend(
            day_intervals
                .into_iter()
                .filter(|interval| within_bound(interval, &start, &end)),
        );
        day = day.succ_opt().context("Date out of range")?;
    }

    info!("fetched {} carbon intensity intervals", intervals.len());
    Ok(CiTable::new(intervals))
}
