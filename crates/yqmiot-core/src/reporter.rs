//! Throttled property reporting.
//!
//! A property report goes out when the values changed or when the minimum
//! interval has passed since the last report, whichever comes first.
//! Static state is therefore still resent periodically.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::codec::Params;

/// Default minimum interval between unchanged property reports.
pub const DEFAULT_REPORT_MIN_INTERVAL: Duration = Duration::from_millis(10_000);

/// Last property report sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportState {
    pub last_properties: Params,
    pub last_report_at: Instant,
}

/// Decides which property reports are sent.
#[derive(Debug)]
pub struct PropertyReporter {
    min_interval: Duration,
    state: Mutex<Option<ReportState>>,
}

impl PropertyReporter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Check whether `params` should be reported at `now`, recording it as
    /// the last report if so.
    pub fn admit(&self, params: &Params, now: Instant) -> bool {
        let mut state = self.state.lock();
        let send = match state.as_ref() {
            None => true,
            Some(last) => {
                last.last_properties != *params
                    || now.saturating_duration_since(last.last_report_at) >= self.min_interval
            }
        };
        if send {
            *state = Some(ReportState {
                last_properties: params.clone(),
                last_report_at: now,
            });
        }
        send
    }

    /// Forget the last report so the next one is always sent.
    pub fn invalidate(&self) {
        *self.state.lock() = None;
    }

    pub fn state(&self) -> Option<ReportState> {
        self.state.lock().clone()
    }
}

impl Default for PropertyReporter {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_MIN_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_first_report_always_sent() {
        let reporter = PropertyReporter::default();
        assert!(reporter.admit(&params(json!({"a": 1})), Instant::now()));
    }

    #[test]
    fn test_unchanged_within_interval_suppressed() {
        let reporter = PropertyReporter::new(Duration::from_secs(10));
        let start = Instant::now();
        let p = params(json!({"a": 1}));

        assert!(reporter.admit(&p, start));
        assert!(!reporter.admit(&p, start + Duration::from_secs(3)));
        assert!(!reporter.admit(&p, start + Duration::from_millis(9_999)));
        assert!(reporter.admit(&p, start + Duration::from_secs(10)));
    }

    #[test]
    fn test_changed_params_sent_immediately() {
        let reporter = PropertyReporter::new(Duration::from_secs(10));
        let start = Instant::now();

        assert!(reporter.admit(&params(json!({"a": 1})), start));
        assert!(reporter.admit(&params(json!({"a": 2})), start));
        assert!(reporter.admit(&params(json!({"a": 2, "b": true})), start));

        let state = reporter.state().unwrap();
        assert_eq!(state.last_properties, params(json!({"a": 2, "b": true})));
    }

    #[test]
    fn test_suppressed_report_keeps_timestamp() {
        let reporter = PropertyReporter::new(Duration::from_secs(10));
        let start = Instant::now();
        let p = params(json!({"a": 1}));

        reporter.admit(&p, start);
        reporter.admit(&p, start + Duration::from_secs(5));
        assert_eq!(reporter.state().unwrap().last_report_at, start);
    }

    #[test]
    fn test_invalidate() {
        let reporter = PropertyReporter::default();
        let now = Instant::now();
        let p = params(json!({"a": 1}));
        reporter.admit(&p, now);
        reporter.invalidate();
        assert!(reporter.admit(&p, now));
    }
}
