//! Engine-wide defaults. No environment or file loading — nothing here is
//! meant to survive a process restart — but the ambient concern is still a
//! typed, embeddable struct rather than scattered constants, following the
//! `with_*` consuming-builder style used throughout the reference client
//! configs this crate is modeled on.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub request_timeout: Duration,
    pub device_concurrency: usize,
    pub batch_concurrency: usize,
    pub trace_capacity: usize,
    pub pe_version_major: u8,
    pub pe_version_minor: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            device_concurrency: 4,
            batch_concurrency: 4,
            trace_capacity: 200,
            pe_version_major: 0,
            pe_version_minor: 2,
        }
    }
}

impl EngineConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_device_concurrency(mut self, n: usize) -> Self {
        self.device_concurrency = n.max(1);
        self
    }

    pub fn with_batch_concurrency(mut self, n: usize) -> Self {
        self.batch_concurrency = n.max(1);
        self
    }

    pub fn with_trace_capacity(mut self, n: usize) -> Self {
        self.trace_capacity = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.device_concurrency, 4);
        assert_eq!(config.batch_concurrency, 4);
        assert_eq!(config.trace_capacity, 200);
        assert_eq!((config.pe_version_major, config.pe_version_minor), (0, 2));
    }

    #[test]
    fn builders_override_fields() {
        let config = EngineConfig::default()
            .with_request_timeout(Duration::from_millis(250))
            .with_device_concurrency(8);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.device_concurrency, 8);
    }
}
