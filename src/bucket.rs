/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    carbon_intensity::{to_timestamp, CiKey},
    error,
    estimate::Usage,
    trace::TaskRecord,
};
use chrono::Timelike;
use itertools::Itertools;
use serde::Serialize;
use tracing::debug;

/// Width of a bucket: one hour in milliseconds.
pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// Rounds a timestamp to the closest hour boundary. Anything from half past onwards rounds up.
pub fn round_to_nearest_hour(ms: i64) -> i64 {
    let floor = ms.div_euclid(HOUR_MS) * HOUR_MS;
    let minute = to_timestamp(ms)
        .map(|ts| ts.minute() as i64)
        .unwrap_or_else(|| (ms - floor) / 60_000);

    if minute >= 30 {
        floor + HOUR_MS
    } else {
        floor
    }
}

/// The portion of a task that falls inside a single hour bucket.
///
/// Fragments are independent values, annotating one never touches the task it was cut from
/// or any of its sibling fragments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFragment {
    /// Position of the owning task in the input slice.
    pub task_index: usize,
    pub name: String,
    pub start: i64,
    pub complete: i64,
    /// Always `complete - start`.
    pub realtime: i64,
    pub cpu_count: u32,
    pub cpu_usage: f64,
    pub cpu_model: Option<String>,
    pub memory_gb: f64,
}
impl TaskFragment {
    fn clipped(task_index: usize, task: &TaskRecord, start: i64, complete: i64) -> Self {
        TaskFragment {
            task_index,
            name: task.name.clone(),
            start,
            complete,
            realtime: complete - start,
            cpu_count: task.cpu_count,
            cpu_usage: task.cpu_usage,
            cpu_model: task.cpu_model.clone(),
            memory_gb: task.memory_gb,
        }
    }

    pub fn usage(&self) -> Usage<'_> {
        Usage {
            name: &self.name,
            realtime: self.realtime,
            cpu_count: self.cpu_count,
            cpu_usage: self.cpu_usage,
            cpu_model: self.cpu_model.as_deref(),
            memory_gb: self.memory_gb,
        }
    }
}

/// How a task overlaps a bucket `[i, i + HOUR_MS)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    /// Starts and completes inside the bucket.
    Contained,
    /// Started in an earlier bucket and completes in this one.
    TailFits,
    /// Starts in this bucket and completes in a later one.
    HeadFits,
    /// Starts before and completes after the bucket.
    Spans,
}

/// Classifies the overlap of `[start, complete)` with the bucket starting at `i`. Cases are
/// tested in order and are mutually exclusive; `None` means the task does not touch the
/// bucket.
pub fn classify(start: i64, complete: i64, i: i64) -> Option<Overlap> {
    let end = i + HOUR_MS;

    if start >= i && complete <= end {
        Some(Overlap::Contained)
    } else if complete > i && complete <= end && start < i {
        Some(Overlap::TailFits)
    } else if start >= i && start < end && complete > end {
        Some(Overlap::HeadFits)
    } else if start < i && complete > end {
        Some(Overlap::Spans)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    /// Start of the hour, ms since the epoch.
    pub start: i64,
    pub fragments: Vec<TaskFragment>,
    /// Longest stretch by which a task starting in this hour runs into the next one.
    pub overhead: i64,
}
impl Bucket {
    pub fn end(&self) -> i64 {
        self.start + HOUR_MS
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn key(&self) -> Option<CiKey> {
        CiKey::from_millis(self.start)
    }
}

/// Tasks of a workflow split into a continuous, chronological series of hour buckets.
/// Empty buckets are kept so the key sequence has no holes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HourBuckets {
    buckets: Vec<Bucket>,
}
impl HourBuckets {
    /// Buckets the given tasks. The series starts one hour before the rounded earliest start
    /// and runs up to and including the rounded latest completion.
    ///
    /// Every task is validated first, an invalid record fails the whole call.
    pub fn from_tasks(tasks: &[TaskRecord]) -> error::Result<Self> {
        for task in tasks {
            task.validate()?;
        }

        let earliest = tasks.iter().map(|task| task.start).min();
        let latest = tasks.iter().map(|task| task.complete).max();

        match (earliest, latest) {
            (Some(earliest), Some(latest)) => {
                let first = round_to_nearest_hour(earliest) - HOUR_MS;
                let last = round_to_nearest_hour(latest);
                Ok(HourBuckets::over_range(first, last, tasks))
            }
            _ => Ok(HourBuckets::default()),
        }
    }

    /// Buckets the given tasks into every hour starting at `first` up to and including `last`.
    /// Both bounds must be hour aligned.
    fn over_range(first: i64, last: i64, tasks: &[TaskRecord]) -> Self {
        let mut buckets = vec![];

        let mut i = first;
        while i <= last {
            let mut fragments = vec![];
            let mut overhead = 0;

            for (task_index, task) in tasks.iter().enumerate() {
                let fragment = match classify(task.start, task.complete, i) {
                    Some(Overlap::Contained) => {
                        TaskFragment::clipped(task_index, task, task.start, task.complete)
                    }
                    Some(Overlap::TailFits) => {
                        TaskFragment::clipped(task_index, task, i, task.complete)
                    }
                    Some(Overlap::HeadFits) => {
                        overhead = overhead.max(i + HOUR_MS - task.start);
                        TaskFragment::clipped(task_index, task, task.start, i + HOUR_MS)
                    }
                    Some(Overlap::Spans) => TaskFragment::clipped(task_index, task, i, i + HOUR_MS),
                    None => continue,
                };
                fragments.push(fragment);
            }

            debug!(
                "bucket {} has {} fragments, overhead {}ms",
                CiKey::describe(i),
                fragments.len(),
                overhead
            );
            buckets.push(Bucket {
                start: i,
                fragments,
                overhead,
            });
            i += HOUR_MS;
        }

        HourBuckets { buckets }
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, bucket_start: i64) -> Option<&Bucket> {
        self.buckets
            .iter()
            .find(|bucket| bucket.start == bucket_start)
    }

    /// Buckets holding at least one fragment, in chronological order.
    pub fn non_empty(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter().filter(|bucket| !bucket.is_empty())
    }

    /// Per-bucket overhead in the same chronological order as the buckets.
    pub fn overheads(&self) -> Vec<i64> {
        self.buckets.iter().map(|bucket| bucket.overhead).collect()
    }

    pub fn total_overhead(&self) -> i64 {
        self.buckets.iter().map(|bucket| bucket.overhead).sum()
    }

    /// Sum of the runtime of every fragment.
    pub fn total_runtime(&self) -> i64 {
        self.fragments().map(|fragment| fragment.realtime).sum()
    }

    pub fn fragments(&self) -> impl Iterator<Item = &TaskFragment> {
        self.buckets.iter().flat_map(|bucket| bucket.fragments.iter())
    }

    /// All fragments cut from the task at `task_index`, in chronological order.
    pub fn fragments_of(&self, task_index: usize) -> Vec<&TaskFragment> {
        self.fragments()
            .filter(|fragment| fragment.task_index == task_index)
            .collect_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    // 2024-03-01T09:00:00Z
    const NINE: i64 = 1_709_283_600_000;
    const MINUTE: i64 = 60_000;

    #[test]
    fn rounds_half_past_up() {
        assert_eq!(round_to_nearest_hour(NINE), NINE);
        assert_eq!(round_to_nearest_hour(NINE + 29 * MINUTE + 59_999), NINE);
        assert_eq!(round_to_nearest_hour(NINE + 30 * MINUTE), NINE + HOUR_MS);
        assert_eq!(round_to_nearest_hour(NINE + 59 * MINUTE), NINE + HOUR_MS);
    }

    #[test]
    fn rounding_up_at_midnight_rolls_over_the_day() {
        // 2024-02-29T23:45:00Z -> 2024-03-01T00:00:00Z
        let late = NINE - 9 * HOUR_MS - 15 * MINUTE;
        assert_eq!(round_to_nearest_hour(late), NINE - 9 * HOUR_MS);
    }

    #[test]
    fn classifies_each_case() {
        let i = NINE;
        let end = NINE + HOUR_MS;

        assert_eq!(classify(i + 10, end - 10, i), Some(Overlap::Contained));
        assert_eq!(classify(i, end, i), Some(Overlap::Contained));
        assert_eq!(classify(i - 10, i + 10, i), Some(Overlap::TailFits));
        assert_eq!(classify(i - 10, end, i), Some(Overlap::TailFits));
        assert_eq!(classify(i + 10, end + 10, i), Some(Overlap::HeadFits));
        assert_eq!(classify(i, end + 10, i), Some(Overlap::HeadFits));
        assert_eq!(classify(i - 10, end + 10, i), Some(Overlap::Spans));
        assert_eq!(classify(i - 10, i, i), None);
        assert_eq!(classify(end, end + 10, i), None);
    }

    #[test]
    fn contained_task_produces_a_single_identical_fragment() -> anyhow::Result<()> {
        let align = task("align", NINE + 5 * MINUTE, NINE + 50 * MINUTE);
        let buckets = HourBuckets::from_tasks(&[align.clone()])?;

        let fragments = buckets.fragments().collect_vec();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].start, align.start);
        assert_eq!(fragments[0].complete, align.complete);
        assert_eq!(fragments[0].realtime, align.realtime);
        assert_eq!(buckets.total_overhead(), 0);
        Ok(())
    }

    #[test]
    fn reported_runtime_does_not_change_fragment_runtime() -> anyhow::Result<()> {
        // 45 minutes wall clock, 46 reported
        let mut inside = task("inside", NINE + 5 * MINUTE, NINE + 50 * MINUTE);
        inside.realtime = 46 * MINUTE;
        // the same span moved across a boundary
        let mut across = task("across", NINE + 40 * MINUTE, NINE + HOUR_MS + 25 * MINUTE);
        across.realtime = 46 * MINUTE;

        for record in [inside, across] {
            let buckets = HourBuckets::from_tasks(&[record.clone()])?;
            for fragment in buckets.fragments() {
                assert_eq!(fragment.realtime, fragment.complete - fragment.start);
            }
            assert_eq!(buckets.total_runtime(), 45 * MINUTE, "{}", record.name);
            assert_eq!(buckets.total_runtime(), record.duration());
        }
        Ok(())
    }

    #[test]
    fn invalid_tasks_are_rejected_before_bucketing() {
        let backwards = task("backwards", NINE + 30 * MINUTE, NINE + 10 * MINUTE);
        assert!(matches!(
            HourBuckets::from_tasks(&[task("fine", NINE, NINE + MINUTE), backwards]),
            Err(crate::error::FootprintError::InvalidRecord { .. })
        ));

        let mut idle = task("idle", NINE, NINE + MINUTE);
        idle.cpu_count = 0;
        assert!(HourBuckets::from_tasks(&[idle]).is_err());
    }

    #[test]
    fn ninety_minute_task_is_split_into_an_hour_and_a_half_hour() -> anyhow::Result<()> {
        let buckets = HourBuckets::from_tasks(&[task("long", 0, 5_400_000)])?;

        let first = buckets.get(0).expect("bucket at 0");
        assert_eq!(first.fragments.len(), 1);
        assert_eq!(first.fragments[0].realtime, 3_600_000);
        assert_eq!(first.overhead, 3_600_000);

        let second = buckets.get(HOUR_MS).expect("bucket at 1h");
        assert_eq!(second.fragments.len(), 1);
        assert_eq!(second.fragments[0].start, HOUR_MS);
        assert_eq!(second.fragments[0].realtime, 1_800_000);

        assert_eq!(buckets.total_runtime(), 5_400_000);
        Ok(())
    }

    #[test]
    fn task_starting_on_a_boundary_is_not_split_into_the_previous_bucket() -> anyhow::Result<()>
    {
        let buckets = HourBuckets::from_tasks(&[task("edge", NINE, NINE + 20 * MINUTE)])?;

        let previous = buckets.get(NINE - HOUR_MS).expect("previous bucket");
        assert!(previous.is_empty());

        let own = buckets.get(NINE).expect("own bucket");
        assert_eq!(own.fragments.len(), 1);
        assert_eq!(own.fragments[0].realtime, 20 * MINUTE);
        Ok(())
    }

    #[test]
    fn task_ending_on_a_boundary_is_not_split_into_the_next_bucket() -> anyhow::Result<()> {
        let buckets =
            HourBuckets::from_tasks(&[task("edge", NINE + 40 * MINUTE, NINE + HOUR_MS)])?;

        assert_eq!(buckets.fragments().count(), 1);
        assert!(buckets
            .get(NINE + HOUR_MS)
            .map(|bucket| bucket.is_empty())
            .unwrap_or(true));
        Ok(())
    }

    #[test]
    fn fragmentation_preserves_duration() -> anyhow::Result<()> {
        let tasks = vec![
            task("a", NINE + 10 * MINUTE, NINE + 3 * HOUR_MS + 7 * MINUTE),
            task("b", NINE + 59 * MINUTE, NINE + HOUR_MS + MINUTE),
            task("c", NINE, NINE + 2 * HOUR_MS),
            task("d", NINE + 5 * HOUR_MS + 31 * MINUTE, NINE + 7 * HOUR_MS + 29 * MINUTE),
            task("e", NINE + 12 * MINUTE, NINE + 13 * MINUTE),
        ];
        let buckets = HourBuckets::from_tasks(&tasks)?;

        for (task_index, task) in tasks.iter().enumerate() {
            let fragments = buckets.fragments_of(task_index);
            let total: i64 = fragments.iter().map(|fragment| fragment.realtime).sum();
            assert_eq!(total, task.duration(), "task {}", task.name);

            // fragments are contiguous and each lies inside a single hour
            for (a, b) in fragments.iter().tuple_windows() {
                assert_eq!(a.complete, b.start);
            }
            for fragment in fragments {
                let hour = fragment.start.div_euclid(HOUR_MS);
                assert!(fragment.complete <= (hour + 1) * HOUR_MS);
                assert_eq!(fragment.realtime, fragment.complete - fragment.start);
            }
        }

        let expected: i64 = tasks.iter().map(TaskRecord::duration).sum();
        assert_eq!(buckets.total_runtime(), expected);
        Ok(())
    }

    #[test]
    fn keeps_the_longest_overhang_per_bucket() -> anyhow::Result<()> {
        let tasks = vec![
            task("short", NINE + 50 * MINUTE, NINE + HOUR_MS + 10 * MINUTE),
            task("long", NINE + 20 * MINUTE, NINE + HOUR_MS + 5 * MINUTE),
        ];
        let buckets = HourBuckets::from_tasks(&tasks)?;

        assert_eq!(buckets.get(NINE).expect("bucket").overhead, 40 * MINUTE);
        assert_eq!(buckets.total_overhead(), 40 * MINUTE);
        assert_eq!(buckets.overheads().len(), buckets.len());
        Ok(())
    }

    #[test]
    fn empty_buckets_are_kept_to_preserve_the_sequence() -> anyhow::Result<()> {
        let tasks = vec![
            task("early", NINE + 5 * MINUTE, NINE + 10 * MINUTE),
            task("late", NINE + 4 * HOUR_MS + 5 * MINUTE, NINE + 4 * HOUR_MS + 10 * MINUTE),
        ];
        let buckets = HourBuckets::from_tasks(&tasks)?;

        let starts = buckets.buckets().iter().map(|bucket| bucket.start).collect_vec();
        for (a, b) in starts.iter().tuple_windows() {
            assert_eq!(b - a, HOUR_MS);
        }
        assert_eq!(starts.first(), Some(&(NINE - HOUR_MS)));
        assert_eq!(starts.last(), Some(&(NINE + 4 * HOUR_MS)));
        assert_eq!(buckets.non_empty().count(), 2);
        Ok(())
    }

    #[test]
    fn fragments_are_independent_copies() -> anyhow::Result<()> {
        let original = task("long", 0, 5_400_000);
        let buckets = HourBuckets::from_tasks(&[original.clone()])?;

        let mut fragments = buckets.fragments().cloned().collect_vec();
        fragments[0].cpu_usage = 0.0;
        fragments[0].name.push_str(" (edited)");

        assert_eq!(fragments[1].cpu_usage, original.cpu_usage);
        assert_eq!(fragments[1].name, original.name);
        assert_eq!(buckets.fragments_of(0)[0].name, original.name);
        Ok(())
    }

    #[test]
    fn no_tasks_gives_no_buckets() -> anyhow::Result<()> {
        assert!(HourBuckets::from_tasks(&[])?.is_empty());
        Ok(())
    }
}
