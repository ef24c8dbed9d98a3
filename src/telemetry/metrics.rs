//! Engine metrics

/// Counter metric types
#[derive(Debug, Clone, Copy)]
pub enum CounterMetric {
    /// Signals produced by the evaluator
    SignalsGenerated,
    /// Orders placed against the venue
    OrdersPlaced,
    /// Orders cancelled
    OrdersCancelled,
    /// Book sequence gaps detected
    SequenceGaps,
    /// Venue call failures
    VenueErrors,
}

/// Gauge metric types
#[derive(Debug, Clone, Copy)]
pub enum GaugeMetric {
    /// Markets currently tracked
    ActiveMarkets,
    /// Markets quarantined after invariant violations
    QuarantinedMarkets,
    /// Realized PnL
    RealizedPnl,
    /// Open position count across markets
    OpenPositions,
    /// Aggregated spot price
    SpotPrice,
}

/// Record a counter increment
pub fn record_counter(metric: CounterMetric, value: u64) {
    let name = match metric {
        CounterMetric::SignalsGenerated => "polyscalper_signals_generated_total",
        CounterMetric::OrdersPlaced => "polyscalper_orders_placed_total",
        CounterMetric::OrdersCancelled => "polyscalper_orders_cancelled_total",
        CounterMetric::SequenceGaps => "polyscalper_sequence_gaps_total",
        CounterMetric::VenueErrors => "polyscalper_venue_errors_total",
    };
    tracing::debug!(metric = name, value, "counter");
}

/// Set a gauge value
pub fn set_gauge(metric: GaugeMetric, value: f64) {
    let name = match metric {
        GaugeMetric::ActiveMarkets => "polyscalper_active_markets",
        GaugeMetric::QuarantinedMarkets => "polyscalper_quarantined_markets",
        GaugeMetric::RealizedPnl => "polyscalper_realized_pnl_usd",
        GaugeMetric::OpenPositions => "polyscalper_open_positions",
        GaugeMetric::SpotPrice => "polyscalper_spot_price_usd",
    };
    tracing::debug!(metric = name, value, "gauge");
}
