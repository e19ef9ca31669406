pub mod sip {
    /// Increment for every SIP request sent or received
    pub fn message(method: &str, direction: &str) {
        metrics::counter!(
            "sipswitch_sip_messages_total",
            "method" => method.to_string(),
            "direction" => direction.to_string()
        )
        .increment(1);
    }

    /// Record SIP response code
    pub fn response(status_code: u16, method: &str) {
        let code_class = status_code / 100;
        metrics::counter!(
            "sipswitch_sip_responses_total",
            "status_class" => format!("{}xx", code_class),
            "status_code" => status_code.to_string(),
            "method" => method.to_string()
        )
        .increment(1);
    }

    /// Record how long a request handler ran
    pub fn handler_latency_seconds(duration_secs: f64, method: &str) {
        metrics::histogram!(
            "sipswitch_sip_handler_seconds",
            "method" => method.to_string()
        )
        .record(duration_secs);
    }

    /// Increment when a registration succeeds
    pub fn registration_succeeded() {
        metrics::counter!("sipswitch_sip_registrations_succeeded_total").increment(1);
    }

    /// Increment when a registration is rejected
    pub fn registration_failed(reason: &str) {
        metrics::counter!(
            "sipswitch_sip_registrations_failed_total",
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn set_active_registrations(count: usize) {
        metrics::gauge!("sipswitch_sip_registrations_active").set(count as f64);
    }

    pub fn set_active_dialogs(count: usize) {
        metrics::gauge!("sipswitch_sip_dialogs_active").set(count as f64);
    }

    pub fn set_invite_transactions(count: usize) {
        metrics::gauge!("sipswitch_sip_invite_transactions").set(count as f64);
    }
}
