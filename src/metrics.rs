use tracing::trace;

// Lightweight metrics helpers that are safe in demo builds.
// These intentionally avoid pulling in metrics macros to keep deps stable.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "shaken.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn event_elapsed(outcome: &'static str, elapsed_ms: u128) {
    trace!(
        target = "shaken.metrics",
        outcome = outcome,
        elapsed_ms = elapsed_ms as u64,
        "event_elapsed"
    );
}
