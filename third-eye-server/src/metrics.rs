//! Service counters rendered in Prometheus text format.
//!
//! Besides the flat request counters, every provider call is recorded
//! per tool (eye name or `routing`): outcome, cumulative latency, and
//! the token usage the provider reported.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct ProviderCallStats {
    pub successes: u64,
    pub failures: u64,
    pub latency_ms_total: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub request_errors_total: AtomicU64,
    pub orchestrations_total: AtomicU64,
    pub eye_failures_total: AtomicU64,
    pub quota_rejections_total: AtomicU64,
    pub provider_errors_total: AtomicU64,
    provider_calls: Mutex<BTreeMap<String, ProviderCallStats>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one provider round trip for `tool`. Failed calls still
    /// contribute latency; token counts are zero unless the provider
    /// reported usage.
    pub fn record_provider_call(
        &self,
        tool: &str,
        latency: Duration,
        success: bool,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        let mut calls = self.provider_calls.lock().unwrap_or_else(|e| e.into_inner());
        let stats = calls.entry(tool.to_string()).or_default();
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.latency_ms_total += latency.as_millis() as u64;
        stats.input_tokens += input_tokens;
        stats.output_tokens += output_tokens;
    }

    pub fn provider_call_stats(&self, tool: &str) -> Option<ProviderCallStats> {
        self.provider_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tool)
            .cloned()
    }

    /// Prometheus exposition format. `bus_dropped_events` is owned by the
    /// pipeline bus and passed in at render time.
    pub fn render(&self, bus_dropped_events: u64) -> String {
        let mut out = String::new();
        let mut gauge = |name: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP third_eye_{} {}\n", name, help));
            out.push_str(&format!("# TYPE third_eye_{} counter\n", name));
            out.push_str(&format!("third_eye_{} {}\n", name, value));
        };
        gauge(
            "requests_total",
            "Requests received on the HTTP surface",
            self.requests_total.load(Ordering::Relaxed),
        );
        gauge(
            "request_errors_total",
            "Requests that ended in an error response",
            self.request_errors_total.load(Ordering::Relaxed),
        );
        gauge(
            "orchestrations_total",
            "Orchestrations started",
            self.orchestrations_total.load(Ordering::Relaxed),
        );
        gauge(
            "eye_failures_total",
            "Eye invocations that failed after retry",
            self.eye_failures_total.load(Ordering::Relaxed),
        );
        gauge(
            "quota_rejections_total",
            "Requests rejected by tenant or key limits",
            self.quota_rejections_total.load(Ordering::Relaxed),
        );
        gauge(
            "provider_errors_total",
            "Classified provider failures",
            self.provider_errors_total.load(Ordering::Relaxed),
        );
        gauge(
            "bus_dropped_events_total",
            "Events shed from slow subscriber queues",
            bus_dropped_events,
        );

        let calls = self.provider_calls.lock().unwrap_or_else(|e| e.into_inner());
        if !calls.is_empty() {
            out.push_str(
                "# HELP third_eye_provider_calls_total Provider calls by tool and outcome\n\
                 # TYPE third_eye_provider_calls_total counter\n",
            );
            for (tool, stats) in calls.iter() {
                out.push_str(&format!(
                    "third_eye_provider_calls_total{{tool=\"{}\",outcome=\"success\"}} {}\n",
                    tool, stats.successes
                ));
                out.push_str(&format!(
                    "third_eye_provider_calls_total{{tool=\"{}\",outcome=\"failure\"}} {}\n",
                    tool, stats.failures
                ));
            }
            out.push_str(
                "# HELP third_eye_provider_latency_ms_total Cumulative provider latency per tool\n\
                 # TYPE third_eye_provider_latency_ms_total counter\n",
            );
            for (tool, stats) in calls.iter() {
                out.push_str(&format!(
                    "third_eye_provider_latency_ms_total{{tool=\"{}\"}} {}\n",
                    tool, stats.latency_ms_total
                ));
            }
            out.push_str(
                "# HELP third_eye_provider_tokens_total Provider token usage per tool\n\
                 # TYPE third_eye_provider_tokens_total counter\n",
            );
            for (tool, stats) in calls.iter() {
                out.push_str(&format!(
                    "third_eye_provider_tokens_total{{tool=\"{}\",direction=\"input\"}} {}\n",
                    tool, stats.input_tokens
                ));
                out.push_str(&format!(
                    "third_eye_provider_tokens_total{{tool=\"{}\",direction=\"output\"}} {}\n",
                    tool, stats.output_tokens
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_emits_every_counter_with_help_and_type() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.requests_total);
        Metrics::incr(&metrics.requests_total);
        let text = metrics.render(5);
        assert!(text.contains("third_eye_requests_total 2"));
        assert!(text.contains("third_eye_bus_dropped_events_total 5"));
        assert!(text.contains("# TYPE third_eye_requests_total counter"));
        assert!(text.contains("# HELP third_eye_quota_rejections_total"));
        // No provider series before the first call.
        assert!(!text.contains("provider_calls_total{"));
    }

    #[test]
    fn provider_calls_accumulate_per_tool() {
        let metrics = Metrics::new();
        metrics.record_provider_call("rinnegan", Duration::from_millis(120), true, 800, 90);
        metrics.record_provider_call("rinnegan", Duration::from_millis(80), false, 0, 0);
        metrics.record_provider_call("routing", Duration::from_millis(40), true, 300, 30);

        let stats = metrics.provider_call_stats("rinnegan").unwrap();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.latency_ms_total, 200);
        assert_eq!(stats.input_tokens, 800);
        assert_eq!(stats.output_tokens, 90);

        let text = metrics.render(0);
        assert!(text.contains(
            "third_eye_provider_calls_total{tool=\"rinnegan\",outcome=\"success\"} 1"
        ));
        assert!(text.contains(
            "third_eye_provider_calls_total{tool=\"rinnegan\",outcome=\"failure\"} 1"
        ));
        assert!(text.contains("third_eye_provider_latency_ms_total{tool=\"routing\"} 40"));
        assert!(text.contains(
            "third_eye_provider_tokens_total{tool=\"routing\",direction=\"input\"} 300"
        ));
        assert!(metrics.provider_call_stats("ghost").is_none());
    }
}
