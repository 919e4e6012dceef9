use metrics::{describe_counter, describe_histogram, register_counter, register_histogram};
use metrics::{Counter, Histogram};
use std::time::Duration;
use tracing::info;

/// Handles for every metric the service records
///
/// Handles are registered against whatever recorder is installed when the
/// struct is built; without one they are no-ops.
pub struct Metrics {
    pub renders_total: Counter,
    pub renders_cached: Counter,
    pub renders_passed_through: Counter,
    pub renders_without_result: Counter,
    pub fallbacks_served: Counter,
    pub cache_writes: Counter,
    pub cache_evictions: Counter,
    pub navigation_timeouts: Counter,
    pub browser_restarts: Counter,
    pub transform_failures: Counter,
    pub render_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            renders_total: register_counter!("prerender_renders_total"),
            renders_cached: register_counter!("prerender_renders_cached_total"),
            renders_passed_through: register_counter!("prerender_renders_passed_through_total"),
            renders_without_result: register_counter!("prerender_renders_without_result_total"),
            fallbacks_served: register_counter!("prerender_fallbacks_served_total"),
            cache_writes: register_counter!("prerender_cache_writes_total"),
            cache_evictions: register_counter!("prerender_cache_evictions_total"),
            navigation_timeouts: register_counter!("prerender_navigation_timeouts_total"),
            browser_restarts: register_counter!("prerender_browser_restarts_total"),
            transform_failures: register_counter!("prerender_transform_failures_total"),
            render_duration: register_histogram!("prerender_render_duration_seconds"),
        }
    }

    pub fn record_render(&self, duration: Duration) {
        self.renders_total.increment(1);
        self.render_duration.record(duration.as_secs_f64());
    }

    pub fn record_cached(&self) {
        self.renders_cached.increment(1);
        self.cache_writes.increment(1);
    }

    pub fn record_pass_through(&self, evicted: bool) {
        self.renders_passed_through.increment(1);
        if evicted {
            self.cache_evictions.increment(1);
        }
    }

    pub fn record_no_result(&self) {
        self.renders_without_result.increment(1);
    }

    pub fn record_fallback(&self) {
        self.fallbacks_served.increment(1);
    }

    pub fn record_navigation_timeout(&self) {
        self.navigation_timeouts.increment(1);
    }

    pub fn record_browser_restart(&self) {
        self.browser_restarts.increment(1);
    }

    pub fn record_transform_failure(&self) {
        self.transform_failures.increment(1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_metrics() {
    describe_counter!("prerender_renders_total", "Render requests handled");
    describe_counter!("prerender_renders_cached_total", "Renders stored in the content cache");
    describe_counter!(
        "prerender_renders_passed_through_total",
        "Renders with a non-cacheable status returned as-is"
    );
    describe_counter!(
        "prerender_renders_without_result_total",
        "Renders that produced no result"
    );
    describe_counter!("prerender_fallbacks_served_total", "Stale cache entries served");
    describe_counter!("prerender_cache_writes_total", "Content cache writes");
    describe_counter!("prerender_cache_evictions_total", "Content cache evictions");
    describe_counter!("prerender_navigation_timeouts_total", "Navigations that hit their timeout");
    describe_counter!("prerender_browser_restarts_total", "Browser processes restarted");
    describe_counter!("prerender_transform_failures_total", "Failed background transforms");
    describe_histogram!("prerender_render_duration_seconds", "Wall-clock time per render");
}

pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Install the global recorder and serve `/metrics` on the configured port.
    ///
    /// Must run inside a tokio runtime and before [`Metrics::new`].
    pub fn start(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], self.port))
            .install()?;
        describe_metrics();

        info!("Serving Prometheus metrics on port {}", self.port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        let metrics = Metrics::new();
        metrics.record_render(Duration::from_millis(120));
        metrics.record_cached();
        metrics.record_pass_through(true);
        metrics.record_fallback();
        metrics.record_navigation_timeout();
        metrics.record_browser_restart();
        metrics.record_transform_failure();
        metrics.record_no_result();
    }
}
