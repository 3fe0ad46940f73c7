use crate::estimate::Method;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Estimate the energy use and emissions of a workflow trace
    Footprint(FootprintArgs),

    /// Download half hourly carbon intensity for Great Britain from the National Grid API
    FetchCi {
        /// Start of the range, UTC (YYYY-MM-DDTHH:MM)
        #[arg(long, value_parser = parse_utc)]
        from: DateTime<Utc>,

        /// End of the range, UTC (YYYY-MM-DDTHH:MM)
        #[arg(long, value_parser = parse_utc)]
        to: DateTime<Utc>,

        /// CI file to write
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Convert the days of an hourly Electricity Maps Data Portal export into a CI file
    ExportCi {
        /// First day, UTC (YYYY-MM-DD)
        #[arg(long, value_parser = parse_day)]
        from: NaiveDate,

        /// Last day, UTC (YYYY-MM-DD)
        #[arg(long, value_parser = parse_day)]
        to: NaiveDate,

        /// Portal export (csv)
        #[arg(short, long)]
        input: PathBuf,

        /// CI file to write
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Move every task of a trace in time
    Shift {
        #[arg(short, long)]
        trace: PathBuf,

        #[arg(long, default_value_t = 0)]
        hours: i64,

        #[arg(long, default_value_t = 0)]
        minutes: i64,

        /// Shift into the past instead of the future
        #[arg(short, long)]
        backward: bool,

        /// Trace file to write
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Estimate emissions with the workflow started up to N hours earlier or later
    Explore(ExploreArgs),

    /// Write an example config file
    Init {
        #[arg(short, long, default_value = crate::config::DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct FootprintArgs {
    #[arg(short, long, value_enum, default_value_t = Method::Both)]
    pub method: Method,

    /// Workflow trace (csv)
    #[arg(short, long)]
    pub trace: PathBuf,

    /// Carbon intensity: a constant value in gCO2e/kWh or a CI file (csv)
    #[arg(short, long)]
    pub ci: String,

    /// Power usage effectiveness
    #[arg(long)]
    pub pue: Option<f64>,

    /// Green Algorithms: W per core
    #[arg(long)]
    pub core_power_draw: Option<f64>,

    /// W per GB of memory
    #[arg(long)]
    pub memory_coefficient: Option<f64>,

    /// Cloud Carbon Footprint: idle W of any CPU model not in the config
    #[arg(long, requires = "max_watts")]
    pub min_watts: Option<f64>,

    /// Cloud Carbon Footprint: full load W of any CPU model not in the config
    #[arg(long, requires = "min_watts")]
    pub max_watts: Option<f64>,

    /// Charge each whole task the time weighted CI of the intervals it overlaps instead of
    /// splitting it into hours
    #[arg(short, long)]
    pub weighted: bool,

    /// Config file, defaults to ./carbon-footprint.toml if present
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Folder for the summary and annotated trace
    #[arg(short, long, default_value = "output")]
    pub output: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ExploreArgs {
    /// Workflow trace (csv)
    #[arg(short, long)]
    pub trace: PathBuf,

    /// CI file (csv)
    #[arg(short, long)]
    pub ci: PathBuf,

    /// Largest shift in either direction
    #[arg(long, default_value_t = 12)]
    pub hours: u32,

    /// Cloud Carbon Footprint: idle W of any CPU model not in the config
    #[arg(long, requires = "max_watts")]
    pub min_watts: Option<f64>,

    /// Cloud Carbon Footprint: full load W of any CPU model not in the config
    #[arg(long, requires = "min_watts")]
    pub max_watts: Option<f64>,

    /// Config file, defaults to ./carbon-footprint.toml if present
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Folder for the footprint table
    #[arg(short, long, default_value = "output")]
    pub output: PathBuf,
}

fn parse_utc(value: &str) -> Result<DateTime<Utc>, String> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| format!("expected YYYY-MM-DDTHH:MM, {}", e))
}

fn parse_day(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD, {}", e))
}

pub fn parse() -> Args {
    Args::parse()
}
