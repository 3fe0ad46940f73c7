/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod bucket;
pub mod carbon_intensity;
pub mod clap_args;
pub mod config;
pub mod error;
pub mod estimate;
pub mod explore;
pub mod footprint;
pub mod report;
pub mod trace;

use anyhow::Context;
use bucket::{HourBuckets, HOUR_MS};
use carbon_intensity::{electricity_maps, national_grid, CarbonIntensity, CiTable};
use chrono::{DateTime, NaiveDate, Utc};
use clap_args::{ExploreArgs, FootprintArgs};
use config::{Config, Overrides};
use estimate::{EnergyModel, Method};
use explore::ShiftFootprint;
use footprint::Footprint;
use report::Report;
use std::path::{Path, PathBuf};
use trace::TaskRecord;
use tracing::info;

const MINUTE_MS: i64 = 60 * 1000;

/// Footprint of the given tasks under every requested method, GA first.
///
/// Tasks are validated up front so a malformed record aborts the run before anything is
/// estimated.
pub fn estimate_footprints(
    tasks: &[TaskRecord],
    ci: &CarbonIntensity,
    config: &Config,
    method: Method,
    weighted: bool,
) -> error::Result<Vec<(Method, Footprint)>> {
    for task in tasks {
        task.validate()?;
    }

    let ga = config.green_algorithms();
    let ccf = config.cloud_carbon_footprint();
    let mut models: Vec<(Method, &dyn EnergyModel)> = vec![];
    if method.includes_ga() {
        models.push((Method::Ga, &ga as &dyn EnergyModel));
    }
    if method.includes_ccf() {
        models.push((Method::Ccf, &ccf as &dyn EnergyModel));
    }

    let buckets = if weighted {
        None
    } else {
        let buckets = HourBuckets::from_tasks(tasks)?;
        info!(
            "{} tasks split over {} hour buckets, overhead {}s",
            tasks.len(),
            buckets.len(),
            buckets.total_overhead() / 1000
        );
        Some(buckets)
    };

    let mut footprints = vec![];
    for (method, model) in models {
        let footprint = match &buckets {
            Some(buckets) => footprint::aggregate(buckets, ci, model, config.pue)?,
            None => footprint::aggregate_weighted(tasks, ci, model, config.pue)?,
        };
        footprints.push((method, footprint));
    }

    Ok(footprints)
}

fn load_config(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<Config> {
    Config::load(path)
        .context("Error loading config")?
        .with_overrides(overrides)
}

/// Runs the `footprint` command: estimate, print and write the report.
pub fn run_footprint(args: &FootprintArgs) -> anyhow::Result<Report> {
    let config = load_config(
        args.config.as_deref(),
        &Overrides {
            pue: args.pue,
            memory_coefficient: args.memory_coefficient,
            core_power_draw: args.core_power_draw,
            min_watts: args.min_watts,
            max_watts: args.max_watts,
        },
    )?;

    let tasks = trace::load_trace(&args.trace)?;
    let ci = CarbonIntensity::from_arg(&args.ci)?;
    info!(
        "loaded {} tasks from {:?}, method {}",
        tasks.len(),
        args.trace,
        args.method
    );

    let footprints = estimate_footprints(&tasks, &ci, &config, args.method, args.weighted)
        .context(format!("Error estimating the footprint of {:?}", args.trace))?;

    let report = Report {
        trace: report::label(&args.trace.to_string_lossy()),
        ci: args.ci.clone(),
        config,
        weighted: args.weighted,
        footprints,
    };
    report.print();
    report.write_summary_file(&args.output)?;
    report.write_trace_file(&args.output)?;

    Ok(report)
}

/// Runs the `fetch-ci` command.
pub async fn fetch_ci(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    output: &Path,
) -> anyhow::Result<CiTable> {
    let table = national_grid::fetch_intervals(from, to).await?;
    table.write_csv(output)?;
    info!("{} intervals written to {:?}", table.len(), output);
    Ok(table)
}

/// Runs the `export-ci` command.
pub fn export_ci(
    input: &Path,
    from: NaiveDate,
    to: NaiveDate,
    output: &Path,
) -> anyhow::Result<CiTable> {
    let table = electricity_maps::export_intervals(input, from, to)?;
    table.write_csv(output)?;
    info!("{} intervals written to {:?}", table.len(), output);
    Ok(table)
}

/// Signed shift in milliseconds for the `shift` command.
pub fn shift_offset(hours: i64, minutes: i64, backward: bool) -> i64 {
    let offset = hours * HOUR_MS + minutes * MINUTE_MS;
    if backward {
        -offset
    } else {
        offset
    }
}

/// Runs the `shift` command.
pub fn shift(trace: &Path, output: &Path, offset_ms: i64) -> anyhow::Result<usize> {
    let rows = trace::shift_trace_file(trace, output, offset_ms)?;
    info!("shifted {} tasks by {}ms into {:?}", rows, offset_ms, output);
    Ok(rows)
}

/// Runs the `explore` command, returning the per shift footprints and the path of the table.
/// A text summary of every shift is written next to the table.
pub fn run_explore(args: &ExploreArgs) -> anyhow::Result<(Vec<ShiftFootprint>, PathBuf)> {
    let config = load_config(
        args.config.as_deref(),
        &Overrides {
            min_watts: args.min_watts,
            max_watts: args.max_watts,
            ..Overrides::default()
        },
    )?;
    let tasks = trace::load_trace(&args.trace)?;
    let table = CiTable::from_csv(&args.ci)?;

    let earliest = tasks.iter().map(|task| task.start).min();
    let latest = tasks.iter().map(|task| task.complete).max();
    if let (Some(earliest), Some(latest)) = (earliest, latest) {
        let hours = ((latest - earliest + HOUR_MS - 1) / HOUR_MS).max(1) as u32;
        if let Some(window) = explore::lowest_ci_window(&table, hours) {
            info!(
                "lowest carbon intensity {}h window starts {} at {:.1} gCO2e/kWh",
                hours, window.start, window.mean
            );
        }
    }

    let ci = CarbonIntensity::Series(table);
    let results = explore::explore(
        &tasks,
        &ci,
        &config.green_algorithms(),
        &config.cloud_carbon_footprint(),
        config.pue,
        args.hours,
    )?;

    std::fs::create_dir_all(&args.output)
        .context(format!("Unable to create {:?}", args.output))?;
    let trace_label = report::label(&args.trace.to_string_lossy());

    let path = args.output.join(format!("{}~footprint.csv", trace_label));
    explore::write_footprint_csv(&path, &results)?;

    let summary_path = args.output.join(format!("{}~summary.txt", trace_label));
    let summary = explore::shift_summary(
        &trace_label,
        &args.ci.to_string_lossy(),
        &config,
        &results,
    );
    explore::write_summary_file(&summary_path, &summary)?;
    info!("shift summaries written to {:?}", summary_path);

    Ok((results, path))
}

/// Runs the `init` command.
pub fn init_config(path: &Path) -> anyhow::Result<()> {
    Config::write_example_to_file(path)?;
    info!("example config written to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_offset_combines_hours_and_minutes() {
        assert_eq!(shift_offset(1, 30, false), 5_400_000);
        assert_eq!(shift_offset(0, 15, true), -900_000);
        assert_eq!(shift_offset(24, 0, false), 86_400_000);
    }

    #[test]
    fn invalid_task_aborts_every_method() {
        let task = TaskRecord {
            name: "broken".to_string(),
            start: 0,
            complete: HOUR_MS,
            realtime: HOUR_MS,
            cpu_count: 0,
            cpu_usage: 100.0,
            cpu_model: None,
            memory_gb: 1.0,
        };

        let res = estimate_footprints(
            &[task],
            &CarbonIntensity::Constant(100.0),
            &Config::default(),
            Method::Both,
            false,
        );
        assert!(matches!(res, Err(error::FootprintError::InvalidRecord { .. })));
    }
}
