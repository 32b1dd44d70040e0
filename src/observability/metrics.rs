// observability/metrics.rs - Engine Metrics

//! Counters and gauges recorded through the `metrics` facade. Wiring an
//! exporter (Prometheus, statsd, ...) is the embedding host's concern;
//! without a recorder installed these calls are no-ops.

use metrics::{counter, gauge};

/// Protocol instance metrics.
pub struct ProtocolMetrics;

impl ProtocolMetrics {
    pub const STARTED_TOTAL: &'static str = "shardnet_protocol_instances_started_total";
    pub const TERMINATED_TOTAL: &'static str = "shardnet_protocol_instances_terminated_total";
    pub const ACTIVE: &'static str = "shardnet_protocol_instances_active";
    pub const ERRORS_TOTAL: &'static str = "shardnet_protocol_errors_total";
}

/// Message-related metrics.
pub struct MessageMetrics;

impl MessageMetrics {
    pub const SENT_TOTAL: &'static str = "shardnet_messages_sent_total";
    pub const DROPPED_TOTAL: &'static str = "shardnet_messages_dropped_total";
    pub const DUPLICATES_SUPPRESSED_TOTAL: &'static str =
        "shardnet_duplicates_suppressed_total";
}

pub fn record_instance_started(kind: &'static str) {
    counter!(ProtocolMetrics::STARTED_TOTAL, "kind" => kind).increment(1);
    gauge!(ProtocolMetrics::ACTIVE).increment(1.0);
}

pub fn record_instance_terminated(kind: &'static str) {
    counter!(ProtocolMetrics::TERMINATED_TOTAL, "kind" => kind).increment(1);
    gauge!(ProtocolMetrics::ACTIVE).decrement(1.0);
}

pub fn record_error_reported() {
    counter!(ProtocolMetrics::ERRORS_TOTAL).increment(1);
}

pub fn record_message_sent(kind: &'static str) {
    counter!(MessageMetrics::SENT_TOTAL, "kind" => kind).increment(1);
}

pub fn record_message_dropped(reason: &'static str) {
    counter!(MessageMetrics::DROPPED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_duplicate_suppressed() {
    counter!(MessageMetrics::DUPLICATES_SUPPRESSED_TOTAL).increment(1);
}
