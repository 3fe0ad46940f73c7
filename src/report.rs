/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::Config,
    estimate::Method,
    footprint::{Footprint, FootprintRecord, Totals},
};
use anyhow::Context;
use colored::*;
use std::{
    fs,
    path::{Path, PathBuf},
};
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};
use tracing::info;

pub const TRACE_HEADERS: [&str; 11] = [
    "name",
    "co2e",
    "energy",
    "avg_ci",
    "realtime",
    "cpu_model",
    "cpu_count",
    "cpu_powerdraw",
    "cpu_usage",
    "memory",
    "memory_powerdraw",
];

/// Name a path is reported under: the file stem, or the argument itself for constants.
pub fn label(arg: &str) -> String {
    if arg.trim().parse::<f64>().is_ok() {
        return arg.trim().to_string();
    }
    Path::new(arg)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| arg.to_string())
}

/// Footprint of one workflow trace under one or more methods.
#[derive(Debug)]
pub struct Report {
    /// Label of the trace, used in output file names.
    pub trace: String,
    /// Carbon intensity argument as given: a constant value or a CI file.
    pub ci: String,
    pub config: Config,
    pub weighted: bool,
    /// Ordered GA first, then CCF.
    pub footprints: Vec<(Method, Footprint)>,
}
impl Report {
    /// Plain text summary of the run parameters and the totals of every method.
    pub fn summary(&self) -> String {
        let includes = |method: Method| self.footprints.iter().any(|(m, _)| *m == method);

        let mut lines = parameter_lines(
            &self.ci,
            &self.config,
            self.weighted,
            includes(Method::Ga),
            includes(Method::Ccf),
        );
        for (method, footprint) in self.footprints.iter() {
            lines.push("".to_string());
            lines.extend(totals_lines(*method, &footprint.totals));
        }

        lines.push("".to_string());
        lines.join("\n")
    }

    pub fn print(&self) {
        println!("\n{}", " Summary ".reversed().green());
        println!("{}:", self.trace.green());

        let mut table_rows = rows![row![
            TableCell::builder("Method".bold()).build(),
            TableCell::builder("Energy (kWh)".bold()).build(),
            TableCell::builder("Energy inc. PUE (kWh)".bold()).build(),
            TableCell::builder("Memory (kWh)".bold()).build(),
            TableCell::builder("Memory inc. PUE (kWh)".bold()).build(),
            TableCell::builder("CO2e (g)".bold()).build()
        ]];
        for (method, footprint) in self.footprints.iter() {
            let totals = &footprint.totals;
            table_rows.push(row![
                TableCell::new(method),
                TableCell::new(format!("{:.6}", totals.core_kwh)),
                TableCell::new(format!("{:.6}", totals.core_kwh_pue)),
                TableCell::new(format!("{:.6}", totals.memory_kwh)),
                TableCell::new(format!("{:.6}", totals.memory_kwh_pue)),
                TableCell::new(format!("{:.3}g", totals.co2e_g).green())
            ]);
        }

        let table = Table::builder()
            .rows(table_rows)
            .style(TableStyle::rounded())
            .build();
        println!("{}", table.render());
    }

    /// `<trace>-<ci>`, the prefix of every output file.
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.trace, label(&self.ci))
    }

    pub fn write_summary_file(&self, folder: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(folder).context(format!("Unable to create {:?}", folder))?;
        let path = folder.join(format!("{}-summary.txt", self.file_stem()));

        fs::write(&path, self.summary()).context(format!("Unable to write {:?}", path))?;
        info!("summary written to {:?}", path);
        Ok(path)
    }

    /// Writes the annotated records of the last method run. With both methods those are the
    /// CCF records.
    pub fn write_trace_file(&self, folder: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(folder).context(format!("Unable to create {:?}", folder))?;
        let path = folder.join(format!("{}-trace.csv", self.file_stem()));

        let records = self
            .footprints
            .last()
            .map(|(_, footprint)| footprint.records.as_slice())
            .unwrap_or_default();
        write_records(&path, records)?;

        info!("{} trace records written to {:?}", records.len(), path);
        Ok(path)
    }
}

/// Run parameters in the order of the text summary. Method specific parameters are only
/// listed for the methods that ran.
pub fn parameter_lines(
    ci: &str,
    config: &Config,
    weighted: bool,
    ga: bool,
    ccf: bool,
) -> Vec<String> {
    let mut lines = vec![
        "Carbon Footprint Trace:".to_string(),
        format!("- carbon-intensity: {}", ci),
        format!("- power-usage-effectiveness: {}", config.pue),
    ];
    if ga {
        lines.push(format!("- core-power-draw: {}", config.core_power_draw));
    }
    if ccf {
        lines.push(match &config.default_cpu {
            Some(watts) => format!(
                "- min to max watts: {}W to {}W",
                watts.min_watts, watts.max_watts
            ),
            None => "- min to max watts: per CPU model".to_string(),
        });
        if !config.cpus.is_empty() {
            lines.push(format!("- cpu models: {}", config.cpus.len()));
        }
    }
    lines.push(format!("- memory-power-draw: {}", config.memory_coefficient));
    if weighted {
        lines.push("- carbon-intensity weighting: per task interval".to_string());
    }
    lines
}

pub fn totals_lines(method: Method, totals: &Totals) -> Vec<String> {
    vec![
        format!("{} Method:", method_title(method)),
        format!("- Energy Consumption (exc. PUE): {}kWh", totals.core_kwh),
        format!("- Energy Consumption (inc. PUE): {}kWh", totals.core_kwh_pue),
        format!(
            "- Memory Energy Consumption (exc. PUE): {}kWh",
            totals.memory_kwh
        ),
        format!(
            "- Memory Energy Consumption (inc. PUE): {}kWh",
            totals.memory_kwh_pue
        ),
        format!("- Carbon Emissions: {}gCO2e", totals.co2e_g),
    ]
}

fn method_title(method: Method) -> &'static str {
    match method {
        Method::Ga => "Green Algorithms",
        Method::Ccf => "Cloud Carbon Footprint",
        Method::Both => "Green Algorithms + Cloud Carbon Footprint",
    }
}

pub fn write_records(path: &Path, records: &[FootprintRecord]) -> anyhow::Result<()> {
    let mut writer =
        csv::Writer::from_path(path).context(format!("Unable to create {:?}", path))?;
    writer.write_record(TRACE_HEADERS)?;

    for record in records {
        writer.write_record([
            record.name.clone(),
            record.co2e.to_string(),
            record.energy.to_string(),
            record.avg_ci.to_string(),
            record.realtime.to_string(),
            record.cpu_model.clone().unwrap_or_default(),
            record.cpu_count.to_string(),
            record
                .cpu_powerdraw
                .map(|watts| watts.to_string())
                .unwrap_or_default(),
            record.cpu_usage.to_string(),
            record.memory.to_string(),
            record.memory_powerdraw.to_string(),
        ])?;
    }
    writer.flush()?;

    Ok(())
}
