//! This file contains all of the code for keeping stats for the current session

use chrono::Local;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::misc::{log_enabled, LOG_STAT};

// Helper function to format a group of stats
fn format_group(title: &str, stats: &[(String, String)]) -> String {
    let stats_str = stats
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect::<Vec<_>>()
        .join(" | ");
    format!("\x1b[1;32m{}:\x1b[0m {}", title, stats_str)
}

fn format_count(count: usize) -> String {
    match count {
        0..=999 => format!("{}", count),
        1_000..=999_999 => format!("{:.2}K", count as f64 / 1_000.0),
        _ => format!("{:.3}M", count as f64 / 1_000_000.0),
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let total_seconds = elapsed.as_secs();
    let days = total_seconds / 86400;
    let hours = (total_seconds % 86400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
}

/// Counters every worker adds to. Workers never share anything else besides
/// the stop flag
pub struct SessionState {
    pub start_str: String,
    start: Instant,
    workers: usize,
    stop: AtomicBool,

    pub iterations: AtomicUsize,
    pub inputs: AtomicUsize,
    pub violations: AtomicUsize,
    pub noise: AtomicUsize,
    pub inconclusive: AtomicUsize,
    pub spec_filtered: AtomicUsize,
    pub invalid: AtomicUsize,

    last_violation: Mutex<Option<Instant>>,
}

impl SessionState {
    pub fn new(workers: usize) -> Self {
        SessionState {
            start_str: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            start: Instant::now(),
            workers,
            stop: AtomicBool::new(false),
            iterations: AtomicUsize::new(0),
            inputs: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            noise: AtomicUsize::new(0),
            inconclusive: AtomicUsize::new(0),
            spec_filtered: AtomicUsize::new(0),
            invalid: AtomicUsize::new(0),
            last_violation: Mutex::new(None),
        }
    }

    #[inline]
    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }

    /// Take the next program number, None once `budget` programs were
    /// handed out
    pub fn claim_iteration(&self, budget: usize) -> Option<usize> {
        self.iterations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < budget).then_some(n + 1)
            })
            .ok()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn record_violation(&self) {
        Self::add(&self.violations, 1);
        if let Ok(mut last) = self.last_violation.lock() {
            *last = Some(Instant::now());
        }
    }

    fn last_violation_str(&self) -> String {
        let last = self.last_violation.lock().ok().and_then(|last| *last);
        match last {
            None => "none".to_string(),
            Some(when) => {
                let elapsed = when.elapsed().as_secs();
                format!(
                    "{}h {}m {}s ago",
                    elapsed / 3600,
                    (elapsed % 3600) / 60,
                    elapsed % 60
                )
            }
        }
    }

    fn session_groups(&self) -> Vec<String> {
        let iterations = Self::get(&self.iterations);
        let seconds = self.elapsed().as_secs_f64().max(f64::EPSILON);

        let globals = [
            ("uptime".to_string(), format_elapsed(self.elapsed())),
            ("workers".to_string(), self.workers.to_string()),
            ("programs".to_string(), format_count(iterations)),
            (
                "programs/s".to_string(),
                format!("{:.2}", iterations as f64 / seconds),
            ),
            ("inputs".to_string(), format_count(Self::get(&self.inputs))),
        ];

        let findings = [
            (
                "violations".to_string(),
                Self::get(&self.violations).to_string(),
            ),
            ("last".to_string(), self.last_violation_str()),
        ];

        let filters = [
            ("noise".to_string(), Self::get(&self.noise).to_string()),
            (
                "inconclusive".to_string(),
                Self::get(&self.inconclusive).to_string(),
            ),
            (
                "no speculation".to_string(),
                Self::get(&self.spec_filtered).to_string(),
            ),
            ("invalid inputs".to_string(), Self::get(&self.invalid).to_string()),
        ];

        vec![
            format_group("globals", &globals),
            format_group("findings", &findings),
            format_group("filtered", &filters),
        ]
    }

    /// Summary printed once the session is over, however it ended
    pub fn print_summary(&self) {
        println!(
            "\n\x1b[1;35m[probefuzz summary (start time: {})]\x1b[0m",
            self.start_str
        );
        for group in self.session_groups() {
            println!("{}", group);
        }
    }
}

/// Per-worker batch, the time each stage took since the last report
#[derive(Clone, Default)]
pub struct Stats {
    pub id: usize,
    stat_interval: u128, // How often we report stats in millis

    batch_iters: usize,
    batch_start: Option<Instant>,
    pub batch_generate: Duration,
    pub batch_model: Duration,
    pub batch_executor: Duration,
    pub batch_filter: Duration,
    pub batch_minimize: Duration,
}

impl Stats {
    pub fn new(config: &Config, id: usize) -> Self {
        Stats {
            id,
            stat_interval: (config.stat_interval as u128).wrapping_mul(1_000),
            ..Default::default()
        }
    }

    #[inline]
    pub fn start_session(&mut self) {
        self.batch_start = Some(Instant::now());
    }

    // Update 1 test program
    #[inline]
    pub fn update(&mut self) {
        self.batch_iters += 1;
    }

    // Only worker 0 reports, and only if asked to
    pub fn report_ready(&self) -> bool {
        if self.id != 0 || !log_enabled(LOG_STAT) {
            return false;
        }

        match self.batch_start {
            Some(batch_start) => batch_start.elapsed().as_millis() > self.stat_interval,
            None => false,
        }
    }

    fn cpu_group(&self) -> String {
        let batch_millis = self
            .batch_start
            .map(|start| start.elapsed().as_millis() as f64)
            .unwrap_or(0.0)
            .max(1.0);
        let share = |d: Duration| (d.as_millis() as f64 / batch_millis) * 100.0;

        let cpu_generate = share(self.batch_generate);
        let cpu_model = share(self.batch_model);
        let cpu_executor = share(self.batch_executor);
        let cpu_filter = share(self.batch_filter);
        let cpu_minimize = share(self.batch_minimize);
        let cpu_misc =
            (100.0 - (cpu_generate + cpu_model + cpu_executor + cpu_filter + cpu_minimize)).max(0.0);

        let cpu = [
            (
                "programs/s".to_string(),
                format!("{:.2}", self.batch_iters as f64 / (batch_millis / 1000.0)),
            ),
            ("generate".to_string(), format!("{:.1}%", cpu_generate)),
            ("model".to_string(), format!("{:.1}%", cpu_model)),
            ("executor".to_string(), format!("{:.1}%", cpu_executor)),
            ("filter".to_string(), format!("{:.1}%", cpu_filter)),
            ("minimize".to_string(), format!("{:.1}%", cpu_minimize)),
            ("misc".to_string(), format!("{:.1}%", cpu_misc)),
        ];
        format_group("cpu (worker 0)", &cpu)
    }

    pub fn print_stats(&self, session: &SessionState) {
        println!(
            "\n\x1b[1;35m[probefuzz stats (start time: {})]\x1b[0m",
            session.start_str
        );
        for group in session.session_groups() {
            println!("{}", group);
        }
        println!("{}", self.cpu_group());
    }

    // Report the stats and start a new batch
    pub fn report(&mut self, session: &SessionState) {
        self.print_stats(session);

        self.batch_iters = 0;
        self.batch_start = Some(Instant::now());
        self.batch_generate = Duration::new(0, 0);
        self.batch_model = Duration::new(0, 0);
        self.batch_executor = Duration::new(0, 0);
        self.batch_filter = Duration::new(0, 0);
        self.batch_minimize = Duration::new(0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_format() {
        assert_eq!(format_count(12), "12");
        assert_eq!(format_count(1_500), "1.50K");
        assert_eq!(format_count(2_000_000), "2.000M");
        assert_eq!(format_elapsed(Duration::from_secs(90_061)), "1d 1h 1m 1s");
    }

    #[test]
    fn session_counters() {
        let session = SessionState::new(2);
        let mut stats = Stats::new(&Config::default(), 1);
        stats.start_session();
        assert_eq!(session.claim_iteration(2), Some(0));
        assert_eq!(session.claim_iteration(2), Some(1));
        assert_eq!(session.claim_iteration(2), None);
        stats.update();
        stats.update();
        session.record_violation();

        assert_eq!(SessionState::get(&session.iterations), 2);
        assert_eq!(SessionState::get(&session.violations), 1);
        assert_eq!(stats.batch_iters, 2);
        assert!(session.last_violation_str().ends_with("ago"));

        // Only worker 0 ever reports
        assert!(!stats.report_ready());

        assert!(!session.stop_requested());
        session.request_stop();
        assert!(session.stop_requested());
    }
}
