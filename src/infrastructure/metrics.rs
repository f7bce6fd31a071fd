//! Signaling counters
//!
//! Recorded through the `metrics` facade; installing an exporter is up to the
//! embedding application.

use metrics::{counter, describe_counter};

/// Describe every counter this crate records
pub fn describe_metrics() {
    describe_counter!(
        "sip_subscribe_requests_total",
        "Total number of SUBSCRIBE requests sent"
    );
    describe_counter!(
        "sip_subscription_refreshes_total",
        "Total number of subscription refreshes triggered by the refresh timer"
    );
    describe_counter!(
        "sip_subscriptions_failed_total",
        "Total number of subscriptions that failed"
    );
    describe_counter!(
        "sip_subscriptions_terminated_total",
        "Total number of subscriptions terminated by a NOTIFY"
    );
    describe_counter!(
        "sip_keep_alive_probes_total",
        "Total number of keep-alive probes sent"
    );
    describe_counter!(
        "sip_connection_failures_total",
        "Total number of connection failures reported to the registration"
    );
}

/// Record a SUBSCRIBE send
pub fn record_subscribe_sent(package: &'static str, unsubscribe: bool) {
    counter!("sip_subscribe_requests_total", "package" => package, "unsubscribe" => unsubscribe.to_string())
        .increment(1);
}

pub fn record_subscription_refresh(package: &'static str) {
    counter!("sip_subscription_refreshes_total", "package" => package).increment(1);
}

pub fn record_subscription_failed(package: &'static str, status_code: u16) {
    counter!("sip_subscriptions_failed_total", "package" => package, "status" => status_code.to_string())
        .increment(1);
}

pub fn record_subscription_terminated(package: &'static str) {
    counter!("sip_subscriptions_terminated_total", "package" => package).increment(1);
}

/// Record a keep-alive probe
pub fn record_keep_alive_probe(method: &'static str) {
    counter!("sip_keep_alive_probes_total", "method" => method).increment(1);
}

pub fn record_connection_failure(source: &'static str) {
    counter!("sip_connection_failures_total", "source" => source).increment(1);
}
