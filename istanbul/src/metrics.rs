use crate::types::{Address, Code};
use commonware_runtime::Metrics as RuntimeMetrics;
use commonware_utils::hex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Outbound {
    pub message: i32,
}

impl Outbound {
    pub fn new(code: Code) -> Self {
        Self {
            message: u8::from(code) as i32,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Inbound {
    pub peer: String,
    pub message: i32,
}

impl Inbound {
    pub fn new(peer: &Address, code: Code) -> Self {
        Self {
            peer: hex(peer),
            message: u8::from(code) as i32,
        }
    }
}

/// Metrics shared by both state machines.
///
/// Handles are reference counted, so clones update the same series.
#[derive(Clone)]
pub struct Metrics {
    pub sequence: Gauge,
    pub round: Gauge,
    pub backlog: Gauge,
    pub round_changes: Counter,
    pub commits: Counter,
    pub invalid: Counter,
    pub inbound: Family<Inbound, Counter>,
    pub outbound: Family<Outbound, Counter>,
    pub consensus_latency: Histogram,
}

impl Metrics {
    /// Register all metrics with `context`.
    pub fn init(context: &impl RuntimeMetrics) -> Self {
        let metrics = Self {
            sequence: Gauge::default(),
            round: Gauge::default(),
            backlog: Gauge::default(),
            round_changes: Counter::default(),
            commits: Counter::default(),
            invalid: Counter::default(),
            inbound: Family::default(),
            outbound: Family::default(),
            consensus_latency: Histogram::new(exponential_buckets(0.01, 2.0, 14)),
        };
        context.register("sequence", "current sequence", metrics.sequence.clone());
        context.register("round", "current round", metrics.round.clone());
        context.register("backlog", "backlogged messages", metrics.backlog.clone());
        context.register(
            "round_changes",
            "rounds started after a round change",
            metrics.round_changes.clone(),
        );
        context.register("commits", "proposals committed", metrics.commits.clone());
        context.register(
            "invalid",
            "messages rejected after decoding",
            metrics.invalid.clone(),
        );
        context.register("inbound", "inbound messages", metrics.inbound.clone());
        context.register("outbound", "outbound messages", metrics.outbound.clone());
        context.register(
            "consensus_latency",
            "seconds from accepted PRE-PREPARE to final commit",
            metrics.consensus_latency.clone(),
        );
        metrics
    }
}
