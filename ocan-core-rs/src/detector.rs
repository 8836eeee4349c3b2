//! CAN intrusion detection
//!
//! Watches every frame on the bus and raises alarms when traffic leaves the
//! declared normal profile. Four independent checks run per frame:
//!
//! | Check | Alarm | Fires when |
//! |-------|-------|------------|
//! | Unknown identifier | `UNKNOWN_ID` | id not in the normal set |
//! | Malicious identifier | `MALICIOUS_ID` | id is a compromised-firmware sentinel |
//! | Frequency skew | `HIGH_FREQUENCY` | one id carries more than half of all traffic |
//! | Inter-arrival | `INTERVAL_ANOMALY` | latest gap is a 3-sigma outlier |
//!
//! Detection is purely observational: nothing here feeds back into the
//! gateway or relay paths.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::BusReader;
use crate::types::{format_id, ids, CanId, Frame};

/// Kind of anomaly raised by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmKind {
    UnknownId,
    MaliciousId,
    HighFrequency,
    IntervalAnomaly,
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmKind::UnknownId => write!(f, "UNKNOWN_ID"),
            AlarmKind::MaliciousId => write!(f, "MALICIOUS_ID"),
            AlarmKind::HighFrequency => write!(f, "HIGH_FREQUENCY"),
            AlarmKind::IntervalAnomaly => write!(f, "INTERVAL_ANOMALY"),
        }
    }
}

/// A raised alarm. Append-only; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub kind: AlarmKind,
    pub id: CanId,
    pub detail: String,
    pub raised_at: DateTime<Utc>,
}

/// Detector tuning
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Identifiers expected on a healthy bus
    pub normal_ids: HashSet<CanId>,

    /// Identifiers only seen when firmware has been tampered with
    pub malicious_ids: HashSet<CanId>,

    /// Share of total traffic above which one identifier is flooding
    pub frequency_ratio_threshold: f64,

    /// Outlier distance, in standard deviations
    pub sigma_threshold: f64,

    /// Intervals required before the timing check runs
    pub min_intervals: usize,

    /// Intervals retained per identifier (oldest evicted)
    pub interval_capacity: usize,

    /// Period of the summary report
    pub summary_interval: Duration,

    /// The summary is skipped until this many frames were seen
    pub summary_min_frames: u64,

    /// Buffer of the live alarm feed
    pub alarm_feed_capacity: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            normal_ids: ids::KNOWN.into_iter().collect(),
            malicious_ids: [ids::MALICIOUS].into_iter().collect(),
            frequency_ratio_threshold: 0.5,
            sigma_threshold: 3.0,
            min_intervals: 10,
            interval_capacity: 50,
            summary_interval: Duration::from_secs(30),
            summary_min_frames: 10,
            alarm_feed_capacity: 256,
        }
    }
}

impl DetectorConfig {
    /// Replace the normal identifier set
    pub fn with_normal_ids(mut self, normal: impl IntoIterator<Item = CanId>) -> Self {
        self.normal_ids = normal.into_iter().collect();
        self
    }

    /// Add a malicious sentinel identifier
    pub fn with_malicious_id(mut self, id: CanId) -> Self {
        self.malicious_ids.insert(id);
        self
    }

    pub fn with_frequency_threshold(mut self, ratio: f64) -> Self {
        self.frequency_ratio_threshold = ratio;
        self
    }

    pub fn with_sigma_threshold(mut self, sigma: f64) -> Self {
        self.sigma_threshold = sigma;
        self
    }

    pub fn with_summary_interval(mut self, interval: Duration) -> Self {
        self.summary_interval = interval;
        self
    }
}

/// Rolling per-identifier statistics
#[derive(Debug, Clone)]
pub struct TrafficWindow {
    pub count: u64,
    pub last_seen: DateTime<Utc>,
    intervals: VecDeque<f64>,
    capacity: usize,
}

impl TrafficWindow {
    fn new(first_seen: DateTime<Utc>, capacity: usize) -> Self {
        Self {
            count: 0,
            last_seen: first_seen,
            intervals: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Count a frame seen at `at`, returning the gap since the previous one
    fn record(&mut self, at: DateTime<Utc>) -> Option<f64> {
        let interval = if self.count > 0 {
            let gap = (at - self.last_seen)
                .num_microseconds()
                .map(|us| us as f64 / 1_000_000.0)
                .unwrap_or(f64::MAX);
            if self.intervals.len() == self.capacity {
                self.intervals.pop_front();
            }
            if self.capacity > 0 {
                self.intervals.push_back(gap);
            }
            Some(gap)
        } else {
            None
        };

        self.count += 1;
        self.last_seen = at;
        interval
    }

    /// Recorded inter-arrival gaps in seconds, oldest first
    pub fn intervals(&self) -> impl Iterator<Item = f64> + '_ {
        self.intervals.iter().copied()
    }

    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    /// Mean and sample standard deviation of the recorded gaps
    pub fn interval_stats(&self) -> Option<(f64, f64)> {
        let n = self.intervals.len();
        if n < 2 {
            return None;
        }
        let mean = self.intervals.iter().sum::<f64>() / n as f64;
        let variance = self
            .intervals
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        Some((mean, variance.sqrt()))
    }
}

#[derive(Debug, Default)]
struct DetectorState {
    windows: HashMap<CanId, TrafficWindow>,
    total_frames: u64,
}

/// Point-in-time view of bus traffic
#[derive(Debug, Clone, Serialize)]
pub struct TrafficSummary {
    pub total_frames: u64,
    pub unique_ids: usize,
    pub total_alarms: usize,
    /// Most frequent identifiers, busiest first
    pub top_ids: Vec<(CanId, u64)>,
    pub id_frequency: BTreeMap<CanId, u64>,
    pub recent_alarms: Vec<Alarm>,
}

/// Streaming CAN intrusion detector
pub struct IntrusionDetector {
    config: DetectorConfig,
    state: Mutex<DetectorState>,
    alarms: RwLock<Vec<Alarm>>,
    alarm_tx: broadcast::Sender<Alarm>,
    last_report: RwLock<Option<TrafficSummary>>,
}

impl IntrusionDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let (alarm_tx, _) = broadcast::channel(config.alarm_feed_capacity.max(1));
        Self {
            config,
            state: Mutex::new(DetectorState::default()),
            alarms: RwLock::new(Vec::new()),
            alarm_tx,
            last_report: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Analyse one frame, returning the alarms it raised.
    ///
    /// The window update and all four checks run under one lock, so frames
    /// are analysed strictly one after another and readers never see a
    /// half-updated window.
    pub fn observe(&self, frame: &Frame) -> Vec<Alarm> {
        let mut state = self.state.lock();
        let id = frame.id;

        state.total_frames += 1;
        let total = state.total_frames;
        let capacity = self.config.interval_capacity;
        let window = state
            .windows
            .entry(id)
            .or_insert_with(|| TrafficWindow::new(frame.observed_at, capacity));
        let interval = window.record(frame.observed_at);

        let mut raised = Vec::new();
        let mut raise = |kind: AlarmKind, detail: String| {
            raised.push(Alarm {
                kind,
                id,
                detail,
                raised_at: Utc::now(),
            });
        };

        if !self.config.normal_ids.contains(&id) {
            raise(
                AlarmKind::UnknownId,
                format!("unknown CAN ID {}", format_id(id)),
            );
        }

        if self.config.malicious_ids.contains(&id) {
            raise(
                AlarmKind::MaliciousId,
                format!("malicious CAN frame {} ({})", format_id(id), frame.hex()),
            );
        }

        let ratio = window.count as f64 / total as f64;
        if ratio > self.config.frequency_ratio_threshold {
            raise(
                AlarmKind::HighFrequency,
                format!(
                    "{} carries {:.1}% of bus traffic",
                    format_id(id),
                    ratio * 100.0
                ),
            );
        }

        if let Some(last) = interval {
            if window.interval_count() >= self.config.min_intervals {
                if let Some((mean, stdev)) = window.interval_stats() {
                    if stdev > 0.0 && (last - mean).abs() > self.config.sigma_threshold * stdev {
                        raise(
                            AlarmKind::IntervalAnomaly,
                            format!(
                                "{} interval anomaly (expected {:.2}s, got {:.2}s)",
                                format_id(id),
                                mean,
                                last
                            ),
                        );
                    }
                }
            }
        }

        if !raised.is_empty() {
            // Appended before the state lock is released to keep frame order
            let mut log = self.alarms.write();
            for alarm in &raised {
                warn!("ALARM [{}]: {}", alarm.kind, alarm.detail);
                log.push(alarm.clone());
                let _ = self.alarm_tx.send(alarm.clone());
            }
        }

        raised
    }

    /// The last `n` alarms, oldest first
    pub fn recent_alarms(&self, n: usize) -> Vec<Alarm> {
        let log = self.alarms.read();
        let start = log.len().saturating_sub(n);
        log[start..].to_vec()
    }

    /// Take every alarm raised so far, leaving the log empty
    pub fn drain_alarms(&self) -> Vec<Alarm> {
        std::mem::take(&mut *self.alarms.write())
    }

    pub fn alarm_count(&self) -> usize {
        self.alarms.read().len()
    }

    /// Live feed of alarms as they are raised
    pub fn subscribe_alarms(&self) -> broadcast::Receiver<Alarm> {
        self.alarm_tx.subscribe()
    }

    /// Copy of the traffic window for one identifier
    pub fn window(&self, id: CanId) -> Option<TrafficWindow> {
        self.state.lock().windows.get(&id).cloned()
    }

    pub fn summary(&self) -> TrafficSummary {
        let state = self.state.lock();
        let alarms = self.alarms.read();

        let id_frequency: BTreeMap<CanId, u64> = state
            .windows
            .iter()
            .map(|(id, window)| (*id, window.count))
            .collect();

        let mut top_ids: Vec<(CanId, u64)> = id_frequency.iter().map(|(k, v)| (*k, *v)).collect();
        top_ids.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top_ids.truncate(5);

        let start = alarms.len().saturating_sub(10);

        TrafficSummary {
            total_frames: state.total_frames,
            unique_ids: state.windows.len(),
            total_alarms: alarms.len(),
            top_ids,
            id_frequency,
            recent_alarms: alarms[start..].to_vec(),
        }
    }

    /// Consume frames until the bus closes
    pub async fn run(self: Arc<Self>, mut reader: BusReader) {
        info!("CAN-IDS monitoring started");
        while let Some(frame) = reader.recv().await {
            debug!("CAN-IDS observed {}", frame);
            self.observe(&frame);
        }
        info!("Bus closed, CAN-IDS monitor stopping");
    }

    /// Log a traffic summary once at least `summary_min_frames` were seen
    pub fn report(&self) -> Option<TrafficSummary> {
        let summary = self.summary();
        if summary.total_frames < self.config.summary_min_frames {
            return None;
        }

        info!("=== CAN-IDS statistics ===");
        info!("Total frames: {}", summary.total_frames);
        info!("Distinct CAN IDs: {}", summary.unique_ids);
        info!("Total alarms: {}", summary.total_alarms);
        for (id, count) in &summary.top_ids {
            info!("  {}: {} frames", format_id(*id), count);
        }

        *self.last_report.write() = Some(summary.clone());
        Some(summary)
    }

    /// Most recent summary logged by [`report`](Self::report)
    pub fn last_report(&self) -> Option<TrafficSummary> {
        self.last_report.read().clone()
    }

    /// Call [`report`](Self::report) every `summary_interval`
    pub async fn report_periodically(self: Arc<Self>) {
        let period = self.config.summary_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            self.report();
        }
    }

    /// Start the monitor and the summary reporter as background tasks
    pub fn spawn(self: &Arc<Self>, reader: BusReader) -> DetectorHandle {
        DetectorHandle {
            monitor: tokio::spawn(Arc::clone(self).run(reader)),
            summary: tokio::spawn(Arc::clone(self).report_periodically()),
        }
    }
}

impl Default for IntrusionDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

/// Background tasks of a running detector
pub struct DetectorHandle {
    monitor: JoinHandle<()>,
    summary: JoinHandle<()>,
}

impl DetectorHandle {
    /// Stop monitoring and reporting
    pub fn stop(self) {
        self.monitor.abort();
        self.summary.abort();
    }

    /// Wait for the monitored bus to close, then stop reporting
    pub async fn join(self) {
        let _ = self.monitor.await;
        self.summary.abort();
    }
}
