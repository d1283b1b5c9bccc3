//! Weighted progress aggregation for the update pipeline.
//!
//! Every command registers one or more contributors before the pipeline starts
//! so the overall fraction is meaningful from the first tick. Download
//! contributors also carry byte counters and a sliding-window speed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

const SAMPLE_LIFETIME: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug)]
struct SpeedSample {
    bytes: u64,
    duration_ms: u64,
    added_at: Instant,
}

/// Sliding-window transfer rate. Samples older than ten seconds are dropped.
#[derive(Clone, Debug)]
pub struct DownloadSpeedCalculator {
    samples: VecDeque<SpeedSample>,
    last_bytes: u64,
    last_time: Instant,
}

impl DownloadSpeedCalculator {
    pub fn new(now: Instant) -> Self {
        Self {
            samples: VecDeque::new(),
            last_bytes: 0,
            last_time: now,
        }
    }

    pub fn restart(&mut self, now: Instant) {
        self.samples.clear();
        self.last_bytes = 0;
        self.last_time = now;
    }

    /// Records the cumulative byte count observed at `now`.
    pub fn add_sample(&mut self, total_bytes: u64, now: Instant) {
        let duration_ms = now.saturating_duration_since(self.last_time).as_millis() as u64;
        let bytes = total_bytes.saturating_sub(self.last_bytes);

        self.samples
            .retain(|sample| now.saturating_duration_since(sample.added_at) <= SAMPLE_LIFETIME);
        self.samples.push_back(SpeedSample {
            bytes,
            duration_ms,
            added_at: now,
        });

        self.last_bytes = total_bytes;
        self.last_time = now;
    }

    /// Kilobytes (1000 bytes) per second over the retained samples.
    pub fn speed_kbps(&self) -> f64 {
        let bytes: u64 = self.samples.iter().map(|sample| sample.bytes).sum();
        let duration: u64 = self.samples.iter().map(|sample| sample.duration_ms).sum();
        if bytes == 0 || duration == 0 {
            return 0.0;
        }
        bytes as f64 / duration as f64
    }
}

#[derive(Debug)]
enum ContributorState {
    Step {
        value: f64,
    },
    Download {
        value: f64,
        bytes: u64,
        total_bytes: u64,
        is_downloading: bool,
        speed: DownloadSpeedCalculator,
        touched: u64,
    },
}

#[derive(Debug)]
struct Contributor {
    weight: f64,
    state: ContributorState,
}

impl Contributor {
    fn value(&self) -> f64 {
        match &self.state {
            ContributorState::Step { value } => *value,
            ContributorState::Download { value, .. } => *value,
        }
    }
}

#[derive(Debug, Default)]
struct AggregatorState {
    contributors: Vec<Contributor>,
    tick: u64,
}

/// Snapshot returned by [`ProgressAggregator::overall`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallStatus {
    pub progress: f64,
    pub download_bytes: u64,
    pub download_total_bytes: u64,
    pub download_speed_kbps: f64,
    pub is_downloading: bool,
}

#[derive(Clone, Default)]
pub struct ProgressAggregator {
    state: Arc<Mutex<AggregatorState>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        match self.state.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, weight: f64, state: ContributorState) -> usize {
        let mut locked = self.lock();
        locked.contributors.push(Contributor {
            weight: sanitize_weight(weight),
            state,
        });
        locked.contributors.len() - 1
    }

    pub fn add_step_progress(&self, weight: f64) -> StepReporter {
        let index = self.push(weight, ContributorState::Step { value: 0.0 });
        StepReporter {
            aggregator: self.clone(),
            index,
        }
    }

    pub fn add_download_progress(&self, weight: f64) -> DownloadReporter {
        let index = self.push(
            weight,
            ContributorState::Download {
                value: 0.0,
                bytes: 0,
                total_bytes: 0,
                is_downloading: false,
                speed: DownloadSpeedCalculator::new(Instant::now()),
                touched: 0,
            },
        );
        DownloadReporter {
            aggregator: self.clone(),
            index,
        }
    }

    pub fn contributor_count(&self) -> usize {
        self.lock().contributors.len()
    }

    pub fn reset(&self) {
        let mut locked = self.lock();
        locked.contributors.clear();
        locked.tick = 0;
    }

    pub fn overall(&self) -> OverallStatus {
        let locked = self.lock();

        let weights: f64 = locked.contributors.iter().map(|item| item.weight).sum();
        let weighted: f64 = locked
            .contributors
            .iter()
            .map(|item| item.weight * item.value())
            .sum();
        let progress = if weights > 0.0 {
            (weighted / weights).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let mut snapshot = OverallStatus {
            progress,
            ..OverallStatus::default()
        };

        // Byte counters come from the most recently updated active download.
        let mut latest_touch = 0u64;
        for contributor in &locked.contributors {
            if let ContributorState::Download {
                bytes,
                total_bytes,
                is_downloading,
                speed,
                touched,
                ..
            } = &contributor.state
            {
                if *is_downloading && *touched >= latest_touch {
                    latest_touch = *touched;
                    snapshot.is_downloading = true;
                    snapshot.download_bytes = *bytes;
                    snapshot.download_total_bytes = *total_bytes;
                    snapshot.download_speed_kbps = speed.speed_kbps();
                }
            }
        }

        snapshot
    }

    fn with_contributor<F>(&self, index: usize, mutator: F)
    where
        F: FnOnce(&mut ContributorState, u64),
    {
        let mut locked = self.lock();
        locked.tick = locked.tick.saturating_add(1);
        let tick = locked.tick;
        if let Some(contributor) = locked.contributors.get_mut(index) {
            mutator(&mut contributor.state, tick);
        }
    }
}

/// Zero, negative and non-finite weights contribute nothing to the mean.
fn sanitize_weight(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

#[derive(Clone)]
pub struct StepReporter {
    aggregator: ProgressAggregator,
    index: usize,
}

impl StepReporter {
    pub fn set(&self, value: f64) {
        let value = clamp_fraction(value);
        self.aggregator
            .with_contributor(self.index, |state, _| {
                if let ContributorState::Step { value: current } = state {
                    *current = value;
                }
            });
    }

    /// Convenience for loops: reports `done / total`, or complete when `total` is 0.
    pub fn set_ratio(&self, done: usize, total: usize) {
        if total == 0 {
            self.set(1.0);
        } else {
            self.set(done as f64 / total as f64);
        }
    }
}

#[derive(Clone)]
pub struct DownloadReporter {
    aggregator: ProgressAggregator,
    index: usize,
}

impl DownloadReporter {
    pub fn start(&self) {
        let now = Instant::now();
        self.aggregator.with_contributor(self.index, |state, tick| {
            if let ContributorState::Download {
                value,
                bytes,
                total_bytes,
                is_downloading,
                speed,
                touched,
            } = state
            {
                *value = 0.0;
                *bytes = 0;
                *total_bytes = 0;
                *is_downloading = true;
                speed.restart(now);
                *touched = tick;
            }
        });
    }

    pub fn update(&self, transferred: u64, total: u64) {
        self.update_at(transferred, total, Instant::now());
    }

    pub fn update_at(&self, transferred: u64, total: u64, now: Instant) {
        self.aggregator.with_contributor(self.index, |state, tick| {
            if let ContributorState::Download {
                value,
                bytes,
                total_bytes,
                is_downloading,
                speed,
                touched,
            } = state
            {
                *bytes = transferred;
                *total_bytes = total;
                *value = if total == 0 {
                    0.0
                } else {
                    clamp_fraction(transferred as f64 / total as f64)
                };
                *is_downloading = true;
                speed.add_sample(transferred, now);
                *touched = tick;
            }
        });
    }

    pub fn finish(&self) {
        self.aggregator.with_contributor(self.index, |state, tick| {
            if let ContributorState::Download {
                value,
                bytes,
                total_bytes,
                is_downloading,
                touched,
                ..
            } = state
            {
                *value = 1.0;
                *bytes = *total_bytes;
                *is_downloading = false;
                *touched = tick;
            }
        });
    }

    pub fn speed_kbps(&self) -> f64 {
        let locked = self.aggregator.lock();
        match locked.contributors.get(self.index).map(|item| &item.state) {
            Some(ContributorState::Download { speed, .. }) => speed.speed_kbps(),
            _ => 0.0,
        }
    }
}

/// Weight model: mebibytes of I/O scaled per kind of work.
pub struct StatusWeights;

impl StatusWeights {
    fn bytes_to_weight(bytes: u64) -> f64 {
        bytes as f64 / 1024.0 / 1024.0
    }

    pub fn resource_download(size: u64) -> f64 {
        Self::bytes_to_weight(size)
    }

    pub fn unarchive_package(size: u64) -> f64 {
        Self::bytes_to_weight(size) * 0.1
    }

    pub fn check_integrity(size: u64) -> f64 {
        Self::bytes_to_weight(size) * 0.05
    }

    pub fn copy_files(size: u64) -> f64 {
        Self::bytes_to_weight(size) * 0.01
    }

    pub fn install_diff(size: u64) -> f64 {
        Self::bytes_to_weight(size) * 0.2
    }

    /// Steps without measurable I/O (license prompt, disk probe, cleanup).
    pub fn fixed_step() -> f64 {
        0.001
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-9
    }

    #[test]
    fn empty_aggregator_reports_zero() {
        let aggregator = ProgressAggregator::new();
        let overall = aggregator.overall();
        assert_eq!(overall.progress, 0.0);
        assert!(!overall.is_downloading);
    }

    #[test]
    fn overall_is_weighted_mean_of_contributors() {
        let aggregator = ProgressAggregator::new();
        let first = aggregator.add_step_progress(1.0);
        let second = aggregator.add_step_progress(3.0);
        let download = aggregator.add_download_progress(4.0);

        first.set(1.0);
        second.set(0.5);
        download.update(25, 100);

        let expected = (1.0 * 1.0 + 3.0 * 0.5 + 4.0 * 0.25) / 8.0;
        let overall = aggregator.overall();
        assert!(approx(overall.progress, expected), "{}", overall.progress);
        assert!(overall.is_downloading);
        assert_eq!(overall.download_bytes, 25);
        assert_eq!(overall.download_total_bytes, 100);
    }

    #[test]
    fn progress_stays_within_bounds_for_any_values() {
        let aggregator = ProgressAggregator::new();
        let weights = [0.5, 2.0, 7.25, 100.0, 0.01];
        let values = [-3.0, 0.2, 9.0, f64::NAN, 1.0];
        for (weight, value) in weights.iter().zip(values.iter()) {
            aggregator.add_step_progress(*weight).set(*value);
        }
        let progress = aggregator.overall().progress;
        assert!((0.0..=1.0).contains(&progress), "{}", progress);
    }

    #[test]
    fn all_zero_weights_report_zero_progress() {
        let aggregator = ProgressAggregator::new();
        aggregator.add_step_progress(0.0).set(1.0);
        aggregator.add_step_progress(0.0).set(1.0);
        aggregator.add_download_progress(-2.0).finish();
        aggregator.add_step_progress(f64::NAN).set(1.0);
        assert_eq!(aggregator.overall().progress, 0.0);
    }

    #[test]
    fn zero_weight_contributor_does_not_dilute_the_mean() {
        let aggregator = ProgressAggregator::new();
        aggregator.add_step_progress(0.0).set(0.0);
        aggregator.add_step_progress(2.0).set(0.5);
        assert!(approx(aggregator.overall().progress, 0.5));
    }

    #[test]
    fn zero_total_download_counts_as_zero() {
        let aggregator = ProgressAggregator::new();
        let download = aggregator.add_download_progress(1.0);
        download.update(500, 0);
        assert_eq!(aggregator.overall().progress, 0.0);
    }

    #[test]
    fn finished_download_is_complete_and_idle() {
        let aggregator = ProgressAggregator::new();
        let download = aggregator.add_download_progress(2.0);
        download.start();
        download.update(10, 40);
        download.finish();
        let overall = aggregator.overall();
        assert!(approx(overall.progress, 1.0));
        assert!(!overall.is_downloading);
    }

    #[test]
    fn reset_clears_contributors() {
        let aggregator = ProgressAggregator::new();
        aggregator.add_step_progress(1.0).set(1.0);
        aggregator.reset();
        assert_eq!(aggregator.contributor_count(), 0);
        assert_eq!(aggregator.overall().progress, 0.0);
    }

    #[test]
    fn speed_uses_retained_samples_only() {
        let start = Instant::now();
        let mut calculator = DownloadSpeedCalculator::new(start);
        assert_eq!(calculator.speed_kbps(), 0.0);

        calculator.add_sample(1_000, start + Duration::from_millis(1_000));
        calculator.add_sample(3_000, start + Duration::from_millis(2_000));
        assert!(approx(calculator.speed_kbps(), 3_000.0 / 2_000.0));

        // Fifteen seconds later the first two samples have aged out.
        calculator.add_sample(13_000, start + Duration::from_millis(17_000));
        assert!(approx(calculator.speed_kbps(), 10_000.0 / 15_000.0));
    }

    #[test]
    fn download_reporter_feeds_speed() {
        let aggregator = ProgressAggregator::new();
        let download = aggregator.add_download_progress(1.0);
        download.start();
        let now = Instant::now();
        download.update_at(4_000, 8_000, now + Duration::from_millis(2_000));
        assert!(download.speed_kbps() > 0.0);
        assert!(aggregator.overall().download_speed_kbps > 0.0);
    }
}
