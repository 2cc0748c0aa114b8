//! Adaptive connection limit driven by observed per-segment throughput.

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Increase,
    Decrease,
    Hold,
}

/// Decides how the connection limit should move given the latest throughput
/// samples (bytes/s) of the currently active segments. Zero samples are
/// ignored; with no nonzero sample nothing changes.
pub fn evaluate<I>(samples: I, limit: usize, config: &EngineConfig) -> Adjustment
where
    I: IntoIterator<Item = f64>,
{
    let (total, count) = samples
        .into_iter()
        .filter(|speed| *speed > 0.0)
        .fold((0.0, 0usize), |(total, count), speed| (total + speed, count + 1));
    if count == 0 {
        return Adjustment::Hold;
    }

    let average = total / count as f64;
    if average > config.healthy_speed && limit < config.max_connections {
        Adjustment::Increase
    } else if average < config.healthy_speed / 2.0 && limit > 1 {
        Adjustment::Decrease
    } else {
        Adjustment::Hold
    }
}

/// Applies [`evaluate`] and returns the new limit. Only affects how many new
/// segments may start; running segments are never cancelled.
pub fn next_limit<I>(samples: I, limit: usize, config: &EngineConfig) -> usize
where
    I: IntoIterator<Item = f64>,
{
    match evaluate(samples, limit, config) {
        Adjustment::Increase => limit + 1,
        Adjustment::Decrease => limit - 1,
        Adjustment::Hold => limit,
    }
}
