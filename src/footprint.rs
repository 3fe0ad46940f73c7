/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    bucket::HourBuckets,
    carbon_intensity::{CarbonIntensity, CiKey},
    error,
    estimate::{EnergyModel, Usage},
    trace::TaskRecord,
};
use serde::Serialize;
use std::{iter::Sum, ops::Add};
use tracing::{debug, info};

/// Running sums over every fragment or task of a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Totals {
    pub core_kwh: f64,
    pub core_kwh_pue: f64,
    pub memory_kwh: f64,
    pub memory_kwh_pue: f64,
    pub co2e_g: f64,
}
impl Add<&Totals> for Totals {
    type Output = Totals;

    fn add(self, rhs: &Totals) -> Totals {
        Totals {
            core_kwh: self.core_kwh + rhs.core_kwh,
            core_kwh_pue: self.core_kwh_pue + rhs.core_kwh_pue,
            memory_kwh: self.memory_kwh + rhs.memory_kwh,
            memory_kwh_pue: self.memory_kwh_pue + rhs.memory_kwh_pue,
            co2e_g: self.co2e_g + rhs.co2e_g,
        }
    }
}
impl Add<Totals> for Totals {
    type Output = Totals;

    fn add(self, rhs: Totals) -> Totals {
        self + &rhs
    }
}
impl<'a> Sum<&'a Totals> for Totals {
    fn sum<I: Iterator<Item = &'a Totals>>(iter: I) -> Self {
        iter.fold(Totals::default(), |acc, item| acc + item)
    }
}
impl Sum<Totals> for Totals {
    fn sum<I: Iterator<Item = Totals>>(iter: I) -> Self {
        iter.fold(Totals::default(), |acc, item| acc + item)
    }
}

/// A fragment or whole task annotated with its footprint. Field order matches the trace
/// report columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FootprintRecord {
    pub name: String,
    /// gCO2e.
    pub co2e: f64,
    /// Core energy including PUE, kWh.
    pub energy: f64,
    /// Carbon intensity applied, gCO2e/kWh.
    pub avg_ci: f64,
    pub realtime: i64,
    pub cpu_model: Option<String>,
    pub cpu_count: u32,
    pub cpu_powerdraw: Option<f64>,
    pub cpu_usage: f64,
    /// GB.
    pub memory: f64,
    pub memory_powerdraw: f64,
}

/// Totals plus the annotated records, in chronological order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Footprint {
    pub totals: Totals,
    pub records: Vec<FootprintRecord>,
}
impl Footprint {
    fn push(&mut self, totals: Totals, record: FootprintRecord) {
        self.totals = self.totals + totals;
        self.records.push(record);
    }
}

fn annotate(
    usage: &Usage,
    ci: f64,
    model: &dyn EnergyModel,
    pue: f64,
) -> error::Result<(Totals, FootprintRecord)> {
    let energy = model.estimate(usage)?;

    let core_kwh_pue = energy.core_kwh * pue;
    let memory_kwh_pue = energy.memory_kwh * pue;
    let co2e_g = (core_kwh_pue + memory_kwh_pue) * ci;

    let totals = Totals {
        core_kwh: energy.core_kwh,
        core_kwh_pue,
        memory_kwh: energy.memory_kwh,
        memory_kwh_pue,
        co2e_g,
    };
    let record = FootprintRecord {
        name: usage.name.to_string(),
        co2e: co2e_g,
        energy: core_kwh_pue,
        avg_ci: ci,
        realtime: usage.realtime,
        cpu_model: usage.cpu_model.map(str::to_string),
        cpu_count: usage.cpu_count,
        cpu_powerdraw: model.core_power_draw(),
        cpu_usage: usage.cpu_usage,
        memory: usage.memory_gb,
        memory_powerdraw: model.memory_coefficient(),
    };

    Ok((totals, record))
}

/// Joins every fragment with the carbon intensity of its bucket and sums the result.
///
/// Empty buckets are skipped. The CI value of a bucket is resolved before any of its
/// fragments are estimated, and the first error aborts the whole run so no partial totals
/// ever escape.
pub fn aggregate(
    buckets: &HourBuckets,
    ci: &CarbonIntensity,
    model: &dyn EnergyModel,
    pue: f64,
) -> error::Result<Footprint> {
    let mut footprint = Footprint::default();

    for bucket in buckets.non_empty() {
        let ci_value = ci.value_for(bucket.start)?;
        debug!(
            "bucket {} uses {} gCO2e/kWh for {} fragments",
            CiKey::describe(bucket.start),
            ci_value,
            bucket.fragments.len()
        );

        for fragment in bucket.fragments.iter() {
            let (totals, record) = annotate(&fragment.usage(), ci_value, model, pue)?;
            footprint.push(totals, record);
        }
    }

    info!(
        "{}: {:.6} gCO2e over {} fragments",
        model.name(),
        footprint.totals.co2e_g,
        footprint.records.len()
    );
    Ok(footprint)
}

/// Whole-task variant: each task is charged the mean carbon intensity of the raw intervals it
/// overlaps, weighted by minutes of overlap. Tasks are not split into hours.
pub fn aggregate_weighted(
    tasks: &[TaskRecord],
    ci: &CarbonIntensity,
    model: &dyn EnergyModel,
    pue: f64,
) -> error::Result<Footprint> {
    let mut footprint = Footprint::default();

    for task in tasks {
        task.validate()?;
        let ci_value = ci.weighted_value(task.start, task.complete)?;
        let (totals, record) = annotate(&task.usage(), ci_value, model, pue)?;
        footprint.push(totals, record);
    }

    info!(
        "{} (interval weighted): {:.6} gCO2e over {} tasks",
        model.name(),
        footprint.totals.co2e_g,
        footprint.records.len()
    );
    Ok(footprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        carbon_intensity::{to_timestamp, CiInterval, CiTable},
        error::FootprintError,
        estimate::{CloudCarbonFootprint, CpuSpecs, GreenAlgorithms, MinMaxWatts},
    };
    use anyhow::Context;
    use approx::assert_relative_eq;

    const HOUR: i64 = 3_600_000;

    fn task(name: &str, start: i64, complete: i64) -> TaskRecord {
        TaskRecord {
            name: name.to_string(),
            start,
            complete,
            realtime: complete - start,
            cpu_count: 2,
            cpu_usage: 100.0,
            cpu_model: None,
            memory_gb: 4.0,
        }
    }

    fn ga() -> GreenAlgorithms {
        GreenAlgorithms {
            core_power_draw: 50.0,
            memory_coefficient: 0.4,
        }
    }

    fn table(values: &[(i64, i64, f64)]) -> anyhow::Result<CiTable> {
        let intervals = values
            .iter()
            .map(|(start, end, value)| {
                let start = to_timestamp(*start).context("bad start")?;
                let end = to_timestamp(*end).context("bad end")?;
                Ok(CiInterval::new(start, end, *value))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(CiTable::new(intervals))
    }

    #[test]
    fn one_hour_task_at_constant_ci() -> anyhow::Result<()> {
        let buckets = HourBuckets::from_tasks(&[task("align", 0, HOUR)])?;
        let footprint = aggregate(&buckets, &CarbonIntensity::Constant(100.0), &ga(), 1.0)?;

        assert_relative_eq!(footprint.totals.core_kwh, 0.05, epsilon = 1e-12);
        assert_relative_eq!(footprint.totals.memory_kwh, 0.0016, epsilon = 1e-12);
        assert_relative_eq!(footprint.totals.co2e_g, 5.16, epsilon = 1e-9);

        assert_eq!(footprint.records.len(), 1);
        let record = &footprint.records[0];
        assert_relative_eq!(record.avg_ci, 100.0, epsilon = 1e-9);
        assert_relative_eq!(record.energy, 0.05, epsilon = 1e-12);
        assert_eq!(record.cpu_powerdraw, Some(50.0));
        Ok(())
    }

    #[test]
    fn pue_scales_energy_and_emissions() -> anyhow::Result<()> {
        let buckets = HourBuckets::from_tasks(&[task("align", 0, HOUR)])?;
        let footprint = aggregate(&buckets, &CarbonIntensity::Constant(100.0), &ga(), 1.5)?;

        assert_relative_eq!(footprint.totals.core_kwh, 0.05, epsilon = 1e-12);
        assert_relative_eq!(footprint.totals.core_kwh_pue, 0.075, epsilon = 1e-12);
        assert_relative_eq!(footprint.totals.memory_kwh_pue, 0.0024, epsilon = 1e-12);
        assert_relative_eq!(footprint.totals.co2e_g, 5.16 * 1.5, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn fragments_are_charged_the_ci_of_their_own_hour() -> anyhow::Result<()> {
        let ci = CarbonIntensity::Series(table(&[
            (-HOUR, 0, 999.0),
            (0, HOUR, 100.0),
            (HOUR, 2 * HOUR, 200.0),
        ])?);
        let buckets = HourBuckets::from_tasks(&[task("long", 0, 5_400_000)])?;
        let footprint = aggregate(&buckets, &ci, &ga(), 1.0)?;

        assert_eq!(footprint.records.len(), 2);
        assert_relative_eq!(footprint.records[0].avg_ci, 100.0, epsilon = 1e-9);
        assert_relative_eq!(footprint.records[1].avg_ci, 200.0, epsilon = 1e-9);

        // first hour 5.16g, second half hour at twice the intensity
        assert_relative_eq!(footprint.totals.co2e_g, 5.16 + 5.16, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn missing_ci_aborts_without_partial_totals() -> anyhow::Result<()> {
        let ci = CarbonIntensity::Series(table(&[(0, HOUR, 100.0)])?);
        let buckets = HourBuckets::from_tasks(&[task("long", 0, 5_400_000)])?;

        let err = aggregate(&buckets, &ci, &ga(), 1.0).unwrap_err();
        assert_eq!(
            err,
            FootprintError::MissingCiInterval {
                key: "01/01-01:00".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn empty_buckets_need_no_ci() -> anyhow::Result<()> {
        // only the bucket holding the task has an interval
        let ci = CarbonIntensity::Series(table(&[(0, HOUR, 100.0)])?);
        let buckets = HourBuckets::from_tasks(&[task("align", 0, HOUR)])?;

        assert!(buckets.len() > 1);
        assert!(aggregate(&buckets, &ci, &ga(), 1.0).is_ok());
        Ok(())
    }

    #[test]
    fn aggregation_is_idempotent() -> anyhow::Result<()> {
        let tasks = vec![
            task("a", 0, 5_400_000),
            task("b", 600_000, 2_000_000),
            task("c", 3_000_000, 9_000_000),
        ];
        let ci = CarbonIntensity::Series(table(&[
            (-HOUR, 0, 50.0),
            (0, HOUR, 100.0),
            (HOUR, 2 * HOUR, 200.0),
            (2 * HOUR, 3 * HOUR, 150.0),
        ])?);
        let buckets = HourBuckets::from_tasks(&tasks)?;

        let first = aggregate(&buckets, &ci, &ga(), 1.67)?;
        let second = aggregate(&buckets, &ci, &ga(), 1.67)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn ccf_records_have_no_single_core_power_draw() -> anyhow::Result<()> {
        let ccf = CloudCarbonFootprint {
            specs: CpuSpecs::new(Some(MinMaxWatts {
                min_watts: 10.0,
                max_watts: 110.0,
            })),
            memory_coefficient: 0.392,
        };
        let buckets = HourBuckets::from_tasks(&[task("align", 0, HOUR)])?;
        let footprint = aggregate(&buckets, &CarbonIntensity::Constant(100.0), &ccf, 1.0)?;

        assert_eq!(footprint.records[0].cpu_powerdraw, None);
        // 1h * (10W + 50% * 100W)
        assert_relative_eq!(footprint.totals.core_kwh, 0.06, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn weighted_variant_charges_whole_tasks() -> anyhow::Result<()> {
        let half = HOUR / 2;
        let ci = CarbonIntensity::Series(table(&[
            (0, half, 100.0),
            (half, HOUR, 200.0),
            (HOUR, HOUR + half, 300.0),
        ])?);
        // 20 minutes at 100, 30 at 200, 10 at 300
        let minute = 60_000;
        let tasks = vec![task("align", 10 * minute, 70 * minute)];

        let footprint = aggregate_weighted(&tasks, &ci, &ga(), 1.0)?;
        let avg_ci = (20.0 * 100.0 + 30.0 * 200.0 + 10.0 * 300.0) / 60.0;

        assert_eq!(footprint.records.len(), 1);
        assert_relative_eq!(footprint.records[0].avg_ci, avg_ci, epsilon = 1e-9);
        assert_relative_eq!(footprint.totals.co2e_g, 0.0516 * avg_ci, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn weighted_variant_rejects_invalid_tasks() {
        let mut broken = task("broken", HOUR, 0);
        broken.realtime = 0;

        assert!(matches!(
            aggregate_weighted(&[broken], &CarbonIntensity::Constant(100.0), &ga(), 1.0),
            Err(FootprintError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn totals_sum() {
        let one = Totals {
            core_kwh: 1.0,
            core_kwh_pue: 2.0,
            memory_kwh: 3.0,
            memory_kwh_pue: 4.0,
            co2e_g: 5.0,
        };
        let total: Totals = [one, one, one].iter().sum();
        assert_eq!(
            total,
            Totals {
                core_kwh: 3.0,
                core_kwh_pue: 6.0,
                memory_kwh: 9.0,
                memory_kwh_pue: 12.0,
                co2e_g: 15.0,
            }
        );
    }
}
