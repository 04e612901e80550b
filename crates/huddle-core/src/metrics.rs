//! Metrics recorded by the signaling runtime.
//!
//! Recording goes through the `metrics` facade; nothing is exported unless
//! the embedding binary installs a recorder.

use huddle_protocol::SignalKind;
use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const MESSAGES_SENT: &str = "huddle_messages_sent_total";
    pub const SEND_FAILURES: &str = "huddle_send_failures_total";
    pub const TRANSPORT_RECYCLES: &str = huddle_transport::pool::RECYCLES_METRIC;
    pub const PEERS_KNOWN: &str = "huddle_peers_known";
    pub const ELASTIC_IN_FLIGHT: &str = "huddle_elastic_in_flight";
    pub const TOKEN_REFRESHES: &str = "huddle_token_refreshes_total";
}

/// Describe all metrics. Call once after installing a recorder.
pub fn describe() {
    metrics::describe_counter!(names::MESSAGES_SENT, "Messages accepted by the send endpoint");
    metrics::describe_counter!(names::SEND_FAILURES, "Failed message sends");
    metrics::describe_counter!(
        names::TRANSPORT_RECYCLES,
        "Transport generations replaced by the recycle sweep"
    );
    metrics::describe_gauge!(names::PEERS_KNOWN, "Peers in the presence registry");
    metrics::describe_gauge!(names::ELASTIC_IN_FLIGHT, "Elastic sends currently in flight");
    metrics::describe_counter!(names::TOKEN_REFRESHES, "Message tokens obtained");
}

/// Record a delivered message.
pub fn record_message_sent(message_type: &str) {
    counter!(names::MESSAGES_SENT, "type" => type_label(message_type)).increment(1);
}

/// Presence kinds get their own label; application types share `app`.
fn type_label(message_type: &str) -> &'static str {
    SignalKind::from_message_type(message_type).map_or("app", |kind| kind.as_str())
}

/// Record a failed send.
pub fn record_send_failure() {
    counter!(names::SEND_FAILURES).increment(1);
}

/// Record a message token refresh.
pub fn record_token_refresh() {
    counter!(names::TOKEN_REFRESHES).increment(1);
}

/// Update the peer registry size.
pub fn set_peers_known(count: usize) {
    gauge!(names::PEERS_KNOWN).set(count as f64);
}

/// Update the number of elastic sends in flight.
pub fn set_elastic_in_flight(count: usize) {
    gauge!(names::ELASTIC_IN_FLIGHT).set(count as f64);
}
