//! Runtime configuration.
//!
//! Everything has a working default; `RuntimeConfig::from_env` layers
//! `ISLET_*` environment overrides on top of those defaults.

use std::time::Duration;

/// Default time slice before a running process is asked to yield.
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(2);

/// Continuation steps a process may take per slice before it yields
/// regardless of wall-clock time.
pub const REDUCTIONS_PER_SLICE: usize = 2000;

/// Default upper bound on concurrently live processes.
pub const DEFAULT_MAX_PROCESSES: usize = 65_536;

/// Default cap on threads serving blocking sections.
pub const DEFAULT_MAX_BLOCKING_THREADS: usize = 512;

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPUs)
    pub num_workers: usize,
    /// Wall-clock budget of one scheduling slice
    pub quantum: Duration,
    /// Step budget of one scheduling slice
    pub reductions_per_slice: usize,
    /// Capacity of the process table
    pub max_processes: usize,
    /// Upper bound on blocking-section threads
    pub max_blocking_threads: usize,
    /// How long an idle blocking thread lingers before exiting
    pub blocking_keep_alive: Duration,
    /// Configuration applied to every process heap
    pub heap: HeapConfig,
    /// Prefix for worker thread names
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            quantum: DEFAULT_QUANTUM,
            reductions_per_slice: REDUCTIONS_PER_SLICE,
            max_processes: DEFAULT_MAX_PROCESSES,
            max_blocking_threads: DEFAULT_MAX_BLOCKING_THREADS,
            blocking_keep_alive: Duration::from_secs(10),
            heap: HeapConfig::default(),
            thread_name: "islet-worker".to_string(),
        }
    }
}

/// Per-process heap settings.
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Initial capacity of the object table (number of objects)
    pub initial_capacity: usize,
    /// Bytes allocated since the last collection before one is suggested
    pub gc_threshold: usize,
    /// Hard limit on live bytes; allocations beyond it fail
    pub max_bytes: Option<usize>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 64,
            gc_threshold: 1024 * 1024, // 1MB
            max_bytes: None,
        }
    }
}

impl HeapConfig {
    /// Settings for a throwaway heap that holds one message in transit.
    pub(crate) fn staging() -> Self {
        Self {
            initial_capacity: 0,
            gc_threshold: usize::MAX,
            max_bytes: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by environment variables.
    ///
    /// Recognised: `ISLET_WORKERS`, `ISLET_QUANTUM_US`, `ISLET_REDUCTIONS`,
    /// `ISLET_MAX_PROCESSES`, `ISLET_MAX_BLOCKING_THREADS`. Values that do
    /// not parse are logged and ignored.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = parse_var(&lookup, "ISLET_WORKERS") {
            self.num_workers = n;
        }
        if let Some(us) = parse_var::<u64>(&lookup, "ISLET_QUANTUM_US") {
            if us > 0 {
                self.quantum = Duration::from_micros(us);
            }
        }
        if let Some(n) = parse_var(&lookup, "ISLET_REDUCTIONS") {
            self.reductions_per_slice = n;
        }
        if let Some(n) = parse_var(&lookup, "ISLET_MAX_PROCESSES") {
            self.max_processes = n;
        }
        if let Some(n) = parse_var(&lookup, "ISLET_MAX_BLOCKING_THREADS") {
            self.max_blocking_threads = n;
        }
        self
    }

    /// Resolved worker count (never zero).
    pub fn worker_count(&self) -> usize {
        if self.num_workers > 0 {
            self.num_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Values the runtime clamps before use.
    pub(crate) fn normalized(mut self) -> Self {
        self.reductions_per_slice = self.reductions_per_slice.max(1);
        self.max_processes = self.max_processes.clamp(1, u32::MAX as usize);
        self.max_blocking_threads = self.max_blocking_threads.max(1);
        if self.quantum.is_zero() {
            self.quantum = DEFAULT_QUANTUM;
        }
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable runtime setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.quantum, Duration::from_millis(2));
        assert_eq!(config.reductions_per_slice, 2000);
        assert_eq!(config.max_processes, 65_536);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_env_overrides() {
        let config = RuntimeConfig::default().with_overrides(lookup_from(&[
            ("ISLET_WORKERS", "3"),
            ("ISLET_QUANTUM_US", "500"),
            ("ISLET_MAX_PROCESSES", "128"),
        ]));
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.quantum, Duration::from_micros(500));
        assert_eq!(config.max_processes, 128);
        assert_eq!(config.reductions_per_slice, REDUCTIONS_PER_SLICE);
    }

    #[test]
    fn test_bad_override_is_ignored() {
        let config = RuntimeConfig::default().with_overrides(lookup_from(&[
            ("ISLET_WORKERS", "many"),
            ("ISLET_QUANTUM_US", "0"),
        ]));
        assert_eq!(config.num_workers, 0);
        assert_eq!(config.quantum, DEFAULT_QUANTUM);
    }

    #[test]
    fn test_normalized_clamps() {
        let config = RuntimeConfig {
            reductions_per_slice: 0,
            max_processes: 0,
            quantum: Duration::ZERO,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.reductions_per_slice, 1);
        assert_eq!(config.max_processes, 1);
        assert_eq!(config.quantum, DEFAULT_QUANTUM);
    }
}
