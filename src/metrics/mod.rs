// Counters for the request pipeline and refresh coordinator

mod collector;

pub use collector::{AuthMetrics, MetricsSnapshot};
