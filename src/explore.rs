/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    bucket::{HourBuckets, HOUR_MS},
    carbon_intensity::{CarbonIntensity, CiTable},
    config::Config,
    error::{self, FootprintError},
    estimate::{CloudCarbonFootprint, EnergyModel, GreenAlgorithms, Method},
    footprint::{self, Totals},
    report,
    trace::TaskRecord,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use std::{fs, path::Path};
use tracing::{debug, info};

/// Footprint of a workflow moved in time by a whole number of hours. `None` means the CI
/// data does not cover the shifted run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShiftFootprint {
    pub shift_hours: i64,
    pub ga: Option<Totals>,
    pub ccf: Option<Totals>,
}
impl ShiftFootprint {
    pub fn ga_gco2e(&self) -> Option<f64> {
        self.ga.map(|totals| totals.co2e_g)
    }

    pub fn ccf_gco2e(&self) -> Option<f64> {
        self.ccf.map(|totals| totals.co2e_g)
    }
}

fn shifted_totals(
    buckets: &HourBuckets,
    ci: &CarbonIntensity,
    model: &dyn EnergyModel,
    pue: f64,
) -> error::Result<Option<Totals>> {
    match footprint::aggregate(buckets, ci, model, pue) {
        Ok(footprint) => Ok(Some(footprint.totals)),
        Err(FootprintError::MissingCiInterval { key }) => {
            debug!("no carbon intensity for [{}]", key);
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Runs the workflow at every shift from `-max_shift_hours` to `+max_shift_hours` and
/// estimates its emissions under both methods.
pub fn explore(
    tasks: &[TaskRecord],
    ci: &CarbonIntensity,
    ga: &GreenAlgorithms,
    ccf: &CloudCarbonFootprint,
    pue: f64,
    max_shift_hours: u32,
) -> error::Result<Vec<ShiftFootprint>> {
    for task in tasks {
        task.validate()?;
    }

    let max_shift_hours = max_shift_hours as i64;
    let mut results = vec![];

    for shift_hours in -max_shift_hours..=max_shift_hours {
        let shifted = tasks
            .iter()
            .map(|task| task.shifted(shift_hours * HOUR_MS))
            .collect_vec();
        let buckets = HourBuckets::from_tasks(&shifted)?;

        let result = ShiftFootprint {
            shift_hours,
            ga: shifted_totals(&buckets, ci, ga, pue)?,
            ccf: shifted_totals(&buckets, ci, ccf, pue)?,
        };
        debug!("{:?}", result);
        results.push(result);
    }

    info!(
        "explored {} shifts, {} covered by carbon intensity data",
        results.len(),
        results
            .iter()
            .filter(|result| result.ga.is_some())
            .count()
    );
    Ok(results)
}

/// The shift with the lowest emissions under the given extractor, if any shift is covered.
pub fn best_shift<F>(results: &[ShiftFootprint], co2e: F) -> Option<&ShiftFootprint>
where
    F: Fn(&ShiftFootprint) -> Option<f64>,
{
    results
        .iter()
        .filter_map(|result| co2e(result).map(|value| (result, value)))
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(result, _)| result)
}

/// A contiguous run of carbon intensity data.
#[derive(Debug, Clone, PartialEq)]
pub struct CiWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Time weighted mean carbon intensity, gCO2e/kWh.
    pub mean: f64,
}

/// Finds the `hours` long window, starting on an interval boundary, with the lowest mean
/// carbon intensity. Windows that run over a gap in the table are ignored.
pub fn lowest_ci_window(table: &CiTable, hours: u32) -> Option<CiWindow> {
    if hours == 0 {
        return None;
    }
    let span = hours as i64 * HOUR_MS;

    table
        .intervals()
        .iter()
        .filter_map(|interval| {
            let start_ms = interval.start.timestamp_millis();
            let mean = table.weighted_average(start_ms, start_ms + span).ok()?;
            Some(CiWindow {
                start: interval.start,
                end: interval.start + chrono::Duration::milliseconds(span),
                mean,
            })
        })
        .min_by(|a, b| a.mean.total_cmp(&b.mean))
}

/// Writes `shift_hours,ga_gco2e,ccf_gco2e`, leaving uncovered shifts empty.
pub fn write_footprint_csv(path: &Path, results: &[ShiftFootprint]) -> anyhow::Result<()> {
    let mut writer =
        csv::Writer::from_path(path).context(format!("Unable to create {:?}", path))?;
    writer.write_record(["shift_hours", "ga_gco2e", "ccf_gco2e"])?;

    let cell = |value: Option<f64>| value.map(|v| v.to_string()).unwrap_or_default();
    for result in results {
        writer.write_record([
            result.shift_hours.to_string(),
            cell(result.ga_gco2e()),
            cell(result.ccf_gco2e()),
        ])?;
    }
    writer.flush()?;

    Ok(())
}

/// Text summary of every shift: the run parameters followed by the totals of each method the
/// CI data covers.
pub fn shift_summary(
    trace: &str,
    ci: &str,
    config: &Config,
    results: &[ShiftFootprint],
) -> String {
    let mut sections = vec![];

    for result in results {
        let mut lines = vec![format!(
            "Trace Report for [{}] using CI Data [{}] with Shift [{:+}h]",
            trace, ci, result.shift_hours
        )];
        lines.extend(report::parameter_lines(ci, config, false, true, true));

        let covered = [(Method::Ga, result.ga), (Method::Ccf, result.ccf)]
            .into_iter()
            .filter_map(|(method, totals)| totals.map(|totals| (method, totals)))
            .collect_vec();
        if covered.is_empty() {
            lines.push("".to_string());
            lines.push("No carbon intensity data for this shift".to_string());
        }
        for (method, totals) in covered {
            lines.push("".to_string());
            lines.extend(report::totals_lines(method, &totals));
        }

        sections.push(lines.join("\n"));
    }

    sections.join("\n\n") + "\n"
}

pub fn write_summary_file(path: &Path, summary: &str) -> anyhow::Result<()> {
    fs::write(path, summary).context(format!("Unable to write {:?}", path))
}
