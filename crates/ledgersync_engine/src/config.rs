//! Configuration for the sync engine and scheduler.

use crate::error::{SyncError, SyncResult};
use ledgersync_protocol::ConflictStrategy;
use ledgersync_queue::{QueueOptions, DEFAULT_COMPACT_THRESHOLD};
use rand::Rng;
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Master switch. When off, changes are still queued but never sent.
    pub enabled: bool,
    /// Time between scheduled cycles.
    pub interval: Duration,
    /// Whether the scheduler runs a cycle shortly after start.
    pub sync_on_startup: bool,
    /// Delay before the startup cycle.
    pub startup_delay: Duration,
    /// Failed pushes per entry before it is parked for manual review.
    pub max_retries: u32,
    /// Entries claimed per push batch.
    pub batch_size: usize,
    /// Records requested per pull page.
    pub pull_page_size: u32,
    /// Deadline for each remote request.
    pub request_timeout: Duration,
    /// How long synced entries are kept before pruning.
    pub retention: Duration,
    /// Journal size in bytes past which reconciliation compacts the queue.
    pub compact_threshold: u64,
    /// Backoff after cycle-level failures.
    pub backoff: RetryConfig,
    /// Tables to sync and their conflict strategy.
    pub tables: BTreeMap<String, ConflictStrategy>,
}

impl SyncConfig {
    /// Creates a configuration with default settings and no tables.
    pub fn new() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            sync_on_startup: true,
            startup_delay: Duration::from_secs(5),
            max_retries: 5,
            batch_size: 50,
            pull_page_size: 100,
            request_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            backoff: RetryConfig::default(),
            tables: BTreeMap::new(),
        }
    }

    /// Enables or disables sync.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the scheduled interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets whether a cycle runs on startup.
    pub fn with_sync_on_startup(mut self, sync_on_startup: bool) -> Self {
        self.sync_on_startup = sync_on_startup;
        self
    }

    /// Sets the delay before the startup cycle.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Sets the retry cap.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the push batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the pull page size.
    pub fn with_pull_page_size(mut self, size: u32) -> Self {
        self.pull_page_size = size;
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how long synced entries are retained.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the journal size that triggers compaction.
    pub fn with_compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }

    /// Queue options matching this configuration.
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions::default()
            .with_max_retries(self.max_retries)
            .with_compact_threshold(self.compact_threshold)
    }

    /// Sets the backoff used after cycle-level failures.
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Adds a table with its conflict strategy.
    pub fn with_table(mut self, table: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.tables.insert(table.into(), strategy);
        self
    }

    /// Reads the configuration from `SYNC_*` environment variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults.
    ///
    /// Recognized keys: `SYNC_ENABLED`, `SYNC_INTERVAL` (seconds),
    /// `SYNC_ON_STARTUP`, `SYNC_STARTUP_DELAY` (seconds), `SYNC_MAX_RETRIES`,
    /// `SYNC_BATCH_SIZE`, `SYNC_PULL_PAGE_SIZE`, `SYNC_TIMEOUT` (seconds),
    /// `SYNC_RETENTION_DAYS`, `SYNC_COMPACT_BYTES` and `SYNC_TABLES`
    /// (`contacts=remote-first,invoices=merge`; a bare name means local-first).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SyncResult<Self> {
        let mut config = Self::new();

        if let Some(v) = lookup("SYNC_ENABLED") {
            config.enabled = parse_bool("SYNC_ENABLED", &v)?;
        }
        if let Some(v) = lookup("SYNC_INTERVAL") {
            config.interval = Duration::from_secs(parse_num("SYNC_INTERVAL", &v)?);
        }
        if let Some(v) = lookup("SYNC_ON_STARTUP") {
            config.sync_on_startup = parse_bool("SYNC_ON_STARTUP", &v)?;
        }
        if let Some(v) = lookup("SYNC_STARTUP_DELAY") {
            config.startup_delay = Duration::from_secs(parse_num("SYNC_STARTUP_DELAY", &v)?);
        }
        if let Some(v) = lookup("SYNC_MAX_RETRIES") {
            config.max_retries = parse_num("SYNC_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("SYNC_BATCH_SIZE") {
            config.batch_size = parse_num("SYNC_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("SYNC_PULL_PAGE_SIZE") {
            config.pull_page_size = parse_num("SYNC_PULL_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("SYNC_TIMEOUT") {
            config.request_timeout = Duration::from_secs(parse_num("SYNC_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("SYNC_RETENTION_DAYS") {
            let days: u64 = parse_num("SYNC_RETENTION_DAYS", &v)?;
            config.retention = Duration::from_secs(days.saturating_mul(24 * 60 * 60));
        }
        if let Some(v) = lookup("SYNC_COMPACT_BYTES") {
            config.compact_threshold = parse_num("SYNC_COMPACT_BYTES", &v)?;
        }
        if let Some(v) = lookup("SYNC_TABLES") {
            for item in v.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let (name, strategy) = match item.split_once('=') {
                    Some((name, strategy)) => (
                        name.trim(),
                        strategy
                            .parse::<ConflictStrategy>()
                            .map_err(|e| SyncError::Config(format!("SYNC_TABLES: {e}")))?,
                    ),
                    None => (item, ConflictStrategy::default()),
                };
                config.tables.insert(name.to_string(), strategy);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that sizes and durations are usable.
    pub fn validate(&self) -> SyncResult<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch size must be at least 1".into()));
        }
        if self.pull_page_size == 0 {
            return Err(SyncError::Config("pull page size must be at least 1".into()));
        }
        if self.interval.is_zero() {
            return Err(SyncError::Config("interval must be positive".into()));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(key: &str, value: &str) -> SyncResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SyncError::Config(format!("{key}: expected a boolean, got '{other}'"))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> SyncResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("{key}: expected a number, got '{value}'")))
}

/// Exponential backoff for cycle-level failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a backoff starting at `initial_delay`.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(60 * 60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay after `failures` consecutive failures.
    ///
    /// Zero failures means no delay. The delay never exceeds `max_delay`,
    /// jitter included.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        let mut delay = base.min(max);

        if self.add_jitter {
            delay += delay * 0.25 * rand::thread_rng().gen::<f64>();
            delay = delay.min(max);
        }

        Duration::from_secs_f64(delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
