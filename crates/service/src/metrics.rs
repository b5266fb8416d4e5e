use std::time::Duration;

use prometheus::{CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

/// Counters and timings of order settlements.
#[derive(Clone)]
pub struct SettlementMetrics {
    registry: Registry,
    settlements_total: CounterVec,
    settlement_duration_seconds: Histogram,
}

impl SettlementMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let settlements_total = CounterVec::new(
            Opts::new("settlements_total", "Settlement attempts by outcome"),
            &["outcome"],
        )?;
        let settlement_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "settlement_duration_seconds",
            "Settlement duration in seconds",
        ))?;

        registry.register(Box::new(settlements_total.clone()))?;
        registry.register(Box::new(settlement_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            settlements_total,
            settlement_duration_seconds,
        })
    }

    /// `outcome` is `committed` or an error kind label.
    pub fn record(&self, outcome: &str, duration: Duration) {
        self.settlements_total.with_label_values(&[outcome]).inc();
        self.settlement_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn settlements(&self, outcome: &str) -> u64 {
        self.settlements_total.with_label_values(&[outcome]).get() as u64
    }

    /// Text exposition of every metric.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_are_counted_and_exposed() {
        let metrics = SettlementMetrics::new().unwrap();
        metrics.record("committed", Duration::from_millis(3));
        metrics.record("committed", Duration::from_millis(4));
        metrics.record("insufficient_stock", Duration::from_millis(1));

        assert_eq!(metrics.settlements("committed"), 2);
        assert_eq!(metrics.settlements("insufficient_stock"), 1);

        let text = metrics.gather().unwrap();
        assert!(text.contains("settlements_total{outcome=\"committed\"} 2"));
        assert!(text.contains("settlement_duration_seconds_count 3"));
    }
}
