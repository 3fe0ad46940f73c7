/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::estimate::{CloudCarbonFootprint, CpuSpecs, GreenAlgorithms, MinMaxWatts};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::Path,
};
use tracing::debug;

static EXAMPLE_CONFIG: &str = include_str!("templates/carbon-footprint.toml");

pub const DEFAULT_CONFIG_PATH: &str = "carbon-footprint.toml";

fn default_pue() -> f64 {
    1.67
}

fn default_memory_coefficient() -> f64 {
    0.392
}

fn default_core_power_draw() -> f64 {
    12.0
}

fn default_cpu() -> Option<MinMaxWatts> {
    Some(MinMaxWatts {
        min_watts: 0.74,
        max_watts: 3.5,
    })
}

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_pue")]
    pub pue: f64,
    /// W per GB.
    #[serde(default = "default_memory_coefficient")]
    pub memory_coefficient: f64,
    /// W per core at full load.
    #[serde(default = "default_core_power_draw")]
    pub core_power_draw: f64,
    /// Wattage for any CPU model not in `cpus`.
    #[serde(default = "default_cpu")]
    pub default_cpu: Option<MinMaxWatts>,
    #[serde(default, rename(serialize = "cpu", deserialize = "cpu"))]
    pub cpus: Vec<Cpu>,
}
impl Default for Config {
    fn default() -> Self {
        Config {
            pue: default_pue(),
            memory_coefficient: default_memory_coefficient(),
            core_power_draw: default_core_power_draw(),
            default_cpu: default_cpu(),
            cpus: vec![],
        }
    }
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file =
            File::create_new(path).context(format!("Unable to create config {:?}", path))?;
        File::write_all(&mut file, EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config {:?}", path))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the config at `path` if given, otherwise the default config file if it exists,
    /// otherwise the built in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        match path {
            Some(path) => Config::try_from_path(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Config::try_from_path(path)
                } else {
                    debug!("no config file found, using defaults");
                    Ok(Config::default())
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pue.is_nan() || self.pue < 1.0 {
            anyhow::bail!("pue must be at least 1.0, got {}", self.pue);
        }
        if self.memory_coefficient.is_nan() || self.memory_coefficient < 0.0 {
            anyhow::bail!(
                "memory_coefficient must not be negative, got {}",
                self.memory_coefficient
            );
        }
        if self.core_power_draw.is_nan() || self.core_power_draw < 0.0 {
            anyhow::bail!(
                "core_power_draw must not be negative, got {}",
                self.core_power_draw
            );
        }

        if let Some(watts) = &self.default_cpu {
            validate_watts("default_cpu", watts)?;
        }
        for cpu in self.cpus.iter() {
            validate_watts(&cpu.model, &cpu.watts())?;
        }

        Ok(())
    }

    /// Applies values given on the command line on top of this config.
    pub fn with_overrides(mut self, overrides: &Overrides) -> anyhow::Result<Config> {
        if let Some(pue) = overrides.pue {
            self.pue = pue;
        }
        if let Some(memory_coefficient) = overrides.memory_coefficient {
            self.memory_coefficient = memory_coefficient;
        }
        if let Some(core_power_draw) = overrides.core_power_draw {
            self.core_power_draw = core_power_draw;
        }

        match (overrides.min_watts, overrides.max_watts) {
            (Some(min_watts), Some(max_watts)) => {
                self.default_cpu = Some(MinMaxWatts {
                    min_watts,
                    max_watts,
                })
            }
            (None, None) => {}
            _ => anyhow::bail!("--min-watts and --max-watts must be given together"),
        }

        self.validate()?;
        Ok(self)
    }

    pub fn cpu_specs(&self) -> CpuSpecs {
        let mut specs = CpuSpecs::new(self.default_cpu);
        for cpu in self.cpus.iter() {
            specs.insert(&cpu.model, cpu.watts());
        }
        specs
    }

    pub fn green_algorithms(&self) -> GreenAlgorithms {
        GreenAlgorithms {
            core_power_draw: self.core_power_draw,
            memory_coefficient: self.memory_coefficient,
        }
    }

    pub fn cloud_carbon_footprint(&self) -> CloudCarbonFootprint {
        CloudCarbonFootprint {
            specs: self.cpu_specs(),
            memory_coefficient: self.memory_coefficient,
        }
    }
}

fn validate_watts(name: &str, watts: &MinMaxWatts) -> anyhow::Result<()> {
    let ordered = watts.min_watts >= 0.0 && watts.min_watts <= watts.max_watts;
    if !ordered {
        anyhow::bail!(
            "CPU [{}] needs 0 <= min_watts <= max_watts, got {}W to {}W",
            name,
            watts.min_watts,
            watts.max_watts
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Cpu {
    pub model: String,
    pub min_watts: f64,
    pub max_watts: f64,
}
impl Cpu {
    pub fn watts(&self) -> MinMaxWatts {
        MinMaxWatts {
            min_watts: self.min_watts,
            max_watts: self.max_watts,
        }
    }
}

/// Methodology parameters given on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub pue: Option<f64>,
    pub memory_coefficient: Option<f64>,
    pub core_power_draw: Option<f64>,
    pub min_watts: Option<f64>,
    pub max_watts: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn example_config_is_valid() -> anyhow::Result<()> {
        let config = Config::try_from_str(EXAMPLE_CONFIG)?;

        assert_relative_eq!(config.pue, 1.67, epsilon = 1e-9);
        assert_relative_eq!(config.memory_coefficient, 0.392, epsilon = 1e-9);
        assert_relative_eq!(config.core_power_draw, 12.0, epsilon = 1e-9);
        assert_eq!(config.cpus.len(), 1);
        assert!(config.default_cpu.is_some());
        Ok(())
    }

    #[test]
    fn missing_fields_take_defaults() -> anyhow::Result<()> {
        let config = Config::try_from_str("pue = 1.2")?;

        assert_relative_eq!(config.pue, 1.2, epsilon = 1e-9);
        assert_relative_eq!(config.memory_coefficient, 0.392, epsilon = 1e-9);
        assert_eq!(config.default_cpu, Config::default().default_cpu);
        assert!(config.cpus.is_empty());
        Ok(())
    }

    #[test]
    fn default_config_covers_unlisted_cpu_models() -> anyhow::Result<()> {
        let specs = Config::default().cpu_specs();

        assert_eq!(
            specs.lookup(Some("AMD EPYC 7742"))?,
            MinMaxWatts {
                min_watts: 0.74,
                max_watts: 3.5
            }
        );
        assert_eq!(specs.lookup(None)?, specs.lookup(Some("Pentium II"))?);
        Ok(())
    }

    #[test]
    fn cpu_table_is_built_from_config() -> anyhow::Result<()> {
        let config = Config::try_from_str(
            r#"
            [default_cpu]
            min_watts = 1.0
            max_watts = 2.0

            [[cpu]]
            model = "AMD EPYC 7742"
            min_watts = 65.0
            max_watts = 219.0
            "#,
        )?;
        let specs = config.cpu_specs();

        assert_eq!(
            specs.lookup(Some("AMD EPYC 7742"))?,
            MinMaxWatts {
                min_watts: 65.0,
                max_watts: 219.0
            }
        );
        assert_eq!(
            specs.lookup(Some("Pentium II"))?,
            MinMaxWatts {
                min_watts: 1.0,
                max_watts: 2.0
            }
        );
        Ok(())
    }

    #[test]
    fn invalid_values_should_cause_error() {
        assert!(Config::try_from_str("pue = 0.9").is_err());
        assert!(Config::try_from_str("memory_coefficient = -1.0").is_err());
        assert!(Config::try_from_str(
            r#"
            [[cpu]]
            model = "backwards"
            min_watts = 20.0
            max_watts = 10.0
            "#
        )
        .is_err());
        assert!(Config::try_from_str("pue = \"high\"").is_err());
    }

    #[test]
    fn overrides_replace_config_values() -> anyhow::Result<()> {
        let config = Config::default().with_overrides(&Overrides {
            pue: Some(1.0),
            core_power_draw: Some(50.0),
            min_watts: Some(10.0),
            max_watts: Some(110.0),
            ..Overrides::default()
        })?;

        assert_relative_eq!(config.pue, 1.0, epsilon = 1e-9);
        assert_relative_eq!(config.core_power_draw, 50.0, epsilon = 1e-9);
        assert_relative_eq!(config.memory_coefficient, 0.392, epsilon = 1e-9);
        assert_eq!(
            config.default_cpu,
            Some(MinMaxWatts {
                min_watts: 10.0,
                max_watts: 110.0
            })
        );

        let half = Overrides {
            min_watts: Some(10.0),
            ..Overrides::default()
        };
        assert!(Config::default().with_overrides(&half).is_err());
        Ok(())
    }

    #[test]
    fn can_write_example_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(DEFAULT_CONFIG_PATH);

        Config::write_example_to_file(&path)?;
        let config = Config::try_from_path(&path)?;
        assert_eq!(config, Config::try_from_str(EXAMPLE_CONFIG)?);

        // never overwrites an existing file
        assert!(Config::write_example_to_file(&path).is_err());
        Ok(())
    }
}
