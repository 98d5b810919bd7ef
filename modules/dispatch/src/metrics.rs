use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub executions_total: IntCounterVec,
    pub retries_total: IntCounterVec,
    pub dead_letters_total: IntCounterVec,
    pub dedup_hits_total: IntCounter,
    pub overlapping_deliveries_total: IntCounter,
    pub publish_failures_total: IntCounter,

    // Histograms
    pub execution_duration_seconds: HistogramVec,

    // Gauges
    pub routing_generation: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let executions_total = IntCounterVec::new(
            Opts::new("dispatch_executions_total", "Executor runs by outcome"),
            &["binding", "outcome"], // published|rejected_*|failed_*|timeout
        )?;

        let retries_total = IntCounterVec::new(
            Opts::new("dispatch_retries_total", "In-process retries"),
            &["binding"],
        )?;

        let dead_letters_total = IntCounterVec::new(
            Opts::new("dispatch_dead_letters_total", "Dead-letter diagnostics published"),
            &["binding", "class"],
        )?;

        let dedup_hits_total = IntCounter::new(
            "dispatch_dedup_hits_total",
            "Deliveries acknowledged without re-execution",
        )?;

        let overlapping_deliveries_total = IntCounter::new(
            "dispatch_overlapping_deliveries_total",
            "Redeliveries skipped while another copy was still executing",
        )?;

        let publish_failures_total = IntCounter::new(
            "dispatch_publish_failures_total",
            "Publishes that failed after retries (event nacked)",
        )?;

        let execution_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dispatch_execution_duration_seconds",
                "Executor run duration seconds",
            ),
            &["kind"], // deterministic|decision
        )?;

        let routing_generation = IntGauge::new(
            "dispatch_routing_generation",
            "Routing generation currently serving",
        )?;

        registry.register(Box::new(executions_total.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(dead_letters_total.clone()))?;
        registry.register(Box::new(dedup_hits_total.clone()))?;
        registry.register(Box::new(overlapping_deliveries_total.clone()))?;
        registry.register(Box::new(publish_failures_total.clone()))?;
        registry.register(Box::new(execution_duration_seconds.clone()))?;
        registry.register(Box::new(routing_generation.clone()))?;

        Ok(Self {
            registry,
            executions_total,
            retries_total,
            dead_letters_total,
            dedup_hits_total,
            overlapping_deliveries_total,
            publish_failures_total,
            execution_duration_seconds,
            routing_generation,
        })
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics
            .executions_total
            .with_label_values(&["score", "published"])
            .inc();
        metrics.routing_generation.set(4);

        let text = metrics.render().unwrap();
        assert!(text.contains("dispatch_executions_total{binding=\"score\",outcome=\"published\"} 1"));
        assert!(text.contains("dispatch_routing_generation 4"));
    }
}
