use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static GATE_VERDICTS: OnceLock<IntCounterVec> = OnceLock::new();
static TURNS_RECORDED: OnceLock<IntCounter> = OnceLock::new();
static EVICTIONS: OnceLock<IntCounter> = OnceLock::new();
static LONG_TERM_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();

fn register<T>(cell: &OnceLock<T>, make: impl FnOnce() -> prometheus::Result<T>) -> anyhow::Result<()>
where
    T: prometheus::core::Collector + Clone + 'static,
{
    if cell.get().is_some() {
        return Ok(());
    }
    let collector = make()?;
    if cell.set(collector.clone()).is_ok() {
        REGISTRY.register(Box::new(collector)).ok();
    }
    Ok(())
}

/// Register the process collectors; safe to call more than once
pub fn init_metrics() -> anyhow::Result<()> {
    register(&GATE_VERDICTS, || {
        IntCounterVec::new(
            prometheus::opts!("gate_verdicts_total", "SQL gate verdicts by outcome"),
            &["verdict", "reason"],
        )
    })?;
    register(&TURNS_RECORDED, || {
        IntCounter::new("turns_recorded_total", "Turns recorded into short-term memory")
    })?;
    register(&EVICTIONS, || {
        IntCounter::new("short_term_evictions_total", "Turns evicted from short-term windows")
    })?;
    register(&LONG_TERM_FAILURES, || {
        IntCounterVec::new(
            prometheus::opts!("long_term_failures_total", "Long-term store failures by operation"),
            &["operation"],
        )
    })?;
    register(&ACTIVE_SESSIONS, || {
        IntGauge::new("active_sessions", "Open memory sessions")
    })?;
    Ok(())
}

pub fn inc_gate_verdict(verdict: &str, reason: &str) {
    if let Some(counter) = GATE_VERDICTS.get() {
        counter.with_label_values(&[verdict, reason]).inc();
    }
}

pub fn inc_turns_recorded() {
    if let Some(counter) = TURNS_RECORDED.get() {
        counter.inc();
    }
}

pub fn add_evictions(count: usize) {
    if let Some(counter) = EVICTIONS.get() {
        counter.inc_by(count as u64);
    }
}

pub fn inc_long_term_failure(operation: &str) {
    if let Some(counter) = LONG_TERM_FAILURES.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

pub fn inc_sessions() {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.inc();
    }
}

pub fn dec_sessions() {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.dec();
    }
}

/// Prometheus text exposition of every registered collector
pub fn render_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_rendered() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        inc_gate_verdict("unsafe", "ddl_verb");
        inc_turns_recorded();
        inc_long_term_failure("index");

        let text = render_metrics().unwrap();
        assert!(text.contains("gate_verdicts_total{reason=\"ddl_verb\",verdict=\"unsafe\"}"));
        assert!(text.contains("turns_recorded_total"));
        assert!(text.contains("long_term_failures_total{operation=\"index\"}"));
    }
}
