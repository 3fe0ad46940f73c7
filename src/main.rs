/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use carbon_footprint::{
    clap_args::{self, Commands},
    explore::{self, ShiftFootprint}, export_ci, fetch_ci, init_config, run_explore, run_footprint, shift, shift_offset,
};
use colored::Colorize;
use tracing::{info, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

fn get_subscriber(env_filter: &str) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber).context("Failed to set subscriber")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = clap_args::parse();
    init_subscriber(get_subscriber(if args.verbose { "debug" } else { "info" }))?;

    match args.command {
        Commands::Footprint(footprint_args) => {
            run_footprint(&footprint_args)?;
        }

        Commands::FetchCi { from, to, output } => {
            fetch_ci(from, to, &output).await?;
        }

        Commands::ExportCi {
            from,
            to,
            input,
            output,
        } => {
            export_ci(&input, from, to, &output)?;
        }

        Commands::Shift {
            trace,
            hours,
            minutes,
            backward,
            output,
        } => {
            shift(&trace, &output, shift_offset(hours, minutes, backward))?;
        }

        Commands::Explore(explore_args) => {
            let (results, path) = run_explore(&explore_args)?;

            if let Some(best) = explore::best_shift(&results, ShiftFootprint::ga_gco2e) {
                println!(
                    "Lowest emissions (GA) shifting by {}h: {}",
                    best.shift_hours,
                    format!("{:.3}gCO2e", best.ga_gco2e().unwrap_or_default()).green()
                );
            }
            if let Some(best) = explore::best_shift(&results, ShiftFootprint::ccf_gco2e) {
                println!(
                    "Lowest emissions (CCF) shifting by {}h: {}",
                    best.shift_hours,
                    format!("{:.3}gCO2e", best.ccf_gco2e().unwrap_or_default()).green()
                );
            }
            info!("footprint table written to {:?}", path);
        }

        Commands::Init { path } => {
            init_config(&path)?;
        }
    }

    Ok(())
}
