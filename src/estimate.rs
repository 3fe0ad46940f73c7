/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::error::{self, FootprintError};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use tracing::{debug, warn};

const MS_PER_HOUR: f64 = 3_600_000.0;
const W_TO_KW: f64 = 0.001;

/// The view of a task (or task fragment) an energy model needs.
#[derive(Debug, Clone, Copy)]
pub struct Usage<'a> {
    pub name: &'a str,
    pub realtime: i64,
    pub cpu_count: u32,
    pub cpu_usage: f64,
    pub cpu_model: Option<&'a str>,
    pub memory_gb: f64,
}
impl Usage<'_> {
    fn hours(&self) -> f64 {
        self.realtime as f64 / MS_PER_HOUR
    }

    /// Fraction of the allocated cores that was actually used.
    fn usage_fraction(&self) -> error::Result<f64> {
        if self.cpu_count == 0 {
            return Err(FootprintError::invalid_record(self.name, "zero cores allocated"));
        }
        Ok(self.cpu_usage / (100.0 * self.cpu_count as f64))
    }
}

/// Energy drawn by a task excluding facility overhead (PUE).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Energy {
    pub core_kwh: f64,
    pub memory_kwh: f64,
}

fn memory_energy(usage: &Usage, memory_coefficient: f64) -> f64 {
    usage.hours() * usage.memory_gb * memory_coefficient * W_TO_KW
}

/// A methodology turning resource usage into energy.
pub trait EnergyModel {
    fn name(&self) -> &str;

    fn estimate(&self, usage: &Usage) -> error::Result<Energy>;

    /// Power draw per core reported alongside each record, if the model has a single value.
    fn core_power_draw(&self) -> Option<f64> {
        None
    }

    fn memory_coefficient(&self) -> f64;
}

/// Green Algorithms: core power scales linearly with usage.
#[derive(Debug, Clone, PartialEq)]
pub struct GreenAlgorithms {
    /// W per core at full load.
    pub core_power_draw: f64,
    /// W per GB of memory.
    pub memory_coefficient: f64,
}
impl EnergyModel for GreenAlgorithms {
    fn name(&self) -> &str {
        "Green Algorithms"
    }

    fn estimate(&self, usage: &Usage) -> error::Result<Energy> {
        let core_kwh = usage.hours()
            * usage.cpu_count as f64
            * self.core_power_draw
            * usage.usage_fraction()?
            * W_TO_KW;

        Ok(Energy {
            core_kwh,
            memory_kwh: memory_energy(usage, self.memory_coefficient),
        })
    }

    fn core_power_draw(&self) -> Option<f64> {
        Some(self.core_power_draw)
    }

    fn memory_coefficient(&self) -> f64 {
        self.memory_coefficient
    }
}

/// Idle and full load power of a CPU, in watts.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct MinMaxWatts {
    pub min_watts: f64,
    pub max_watts: f64,
}

/// Per CPU model wattage used by the Cloud Carbon Footprint method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuSpecs {
    models: HashMap<String, MinMaxWatts>,
    default: Option<MinMaxWatts>,
}
impl CpuSpecs {
    pub fn new(default: Option<MinMaxWatts>) -> Self {
        CpuSpecs {
            models: HashMap::new(),
            default,
        }
    }

    pub fn with_model(mut self, model: &str, watts: MinMaxWatts) -> Self {
        self.insert(model, watts);
        self
    }

    pub fn insert(&mut self, model: &str, watts: MinMaxWatts) {
        self.models.insert(model.trim().to_string(), watts);
    }

    pub fn set_default(&mut self, watts: MinMaxWatts) {
        self.default = Some(watts);
    }

    pub fn default_watts(&self) -> Option<MinMaxWatts> {
        self.default
    }

    /// Wattage for the given model. Unknown models fall back to the default pair, which is
    /// logged since it makes the estimate less accurate.
    pub fn lookup(&self, model: Option<&str>) -> error::Result<MinMaxWatts> {
        if let Some(watts) = model.and_then(|model| self.models.get(model.trim())) {
            return Ok(*watts);
        }

        let model = model.unwrap_or("unknown");
        match self.default {
            Some(watts) => {
                if self.models.is_empty() {
                    debug!("no CPU table configured, using the default pair for [{}]", model);
                } else {
                    warn!(
                        "Could not find CPU [{}], using the default {}W to {}W",
                        model, watts.min_watts, watts.max_watts
                    );
                }
                Ok(watts)
            }
            None => Err(FootprintError::MissingCpuSpec {
                model: model.to_string(),
            }),
        }
    }
}

/// Cloud Carbon Footprint: power interpolates between idle and full load of the CPU model.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudCarbonFootprint {
    pub specs: CpuSpecs,
    /// W per GB of memory.
    pub memory_coefficient: f64,
}
impl EnergyModel for CloudCarbonFootprint {
    fn name(&self) -> &str {
        "Cloud Carbon Footprint"
    }

    fn estimate(&self, usage: &Usage) -> error::Result<Energy> {
        let usage_fraction = usage.usage_fraction()?;
        let MinMaxWatts {
            min_watts,
            max_watts,
        } = self.specs.lookup(usage.cpu_model)?;

        let core_kwh =
            usage.hours() * (min_watts + usage_fraction * (max_watts - min_watts)) * W_TO_KW;

        Ok(Energy {
            core_kwh,
            memory_kwh: memory_energy(usage, self.memory_coefficient),
        })
    }

    fn memory_coefficient(&self) -> f64 {
        self.memory_coefficient
    }
}

/// Which methodologies to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Ga,
    Ccf,
    Both,
}
impl Method {
    pub fn includes_ga(&self) -> bool {
        matches!(self, Method::Ga | Method::Both)
    }

    pub fn includes_ccf(&self) -> bool {
        matches!(self, Method::Ccf | Method::Both)
    }
}
impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Ga => write!(f, "GA"),
            Method::Ccf => write!(f, "CCF"),
            Method::Both => write!(f, "BOTH"),
        }
    }
}
