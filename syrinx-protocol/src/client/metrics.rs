//! Prometheus metrics for the connection pool.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};

/// Pool instrumentation. Construct once and share via `Arc`.
pub struct PoolMetrics {
    pub idle_connections: IntGauge,
    pub active_connections: IntGauge,
    pub connections_created: IntCounterVec,
    pub connection_errors: IntCounterVec,
    pub acquire_duration: HistogramVec,
}

impl PoolMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(PoolMetrics {
            idle_connections: IntGauge::new(
                "syrinx_pool_idle_connections",
                "Connections sitting idle in the pool",
            )?,
            active_connections: IntGauge::new(
                "syrinx_pool_active_connections",
                "Connections currently handed out",
            )?,
            connections_created: IntCounterVec::new(
                Opts::new(
                    "syrinx_pool_connections_created_total",
                    "Connection establishment attempts by outcome",
                ),
                &["outcome"],
            )?,
            connection_errors: IntCounterVec::new(
                Opts::new(
                    "syrinx_pool_connection_errors_total",
                    "Connections discarded by reason",
                ),
                &["reason"],
            )?,
            acquire_duration: HistogramVec::new(
                HistogramOpts::new(
                    "syrinx_pool_acquire_duration_seconds",
                    "Time to acquire a connection from the pool",
                ),
                &["source"],
            )?,
        })
    }

    /// Register every collector with `registry`.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.idle_connections.clone()))?;
        registry.register(Box::new(self.active_connections.clone()))?;
        registry.register(Box::new(self.connections_created.clone()))?;
        registry.register(Box::new(self.connection_errors.clone()))?;
        registry.register(Box::new(self.acquire_duration.clone()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_cleanly() {
        let metrics = PoolMetrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();
        metrics.idle_connections.set(3);
        metrics
            .connections_created
            .with_label_values(&["success"])
            .inc();
        assert_eq!(registry.gather().len(), 3);
    }
}
