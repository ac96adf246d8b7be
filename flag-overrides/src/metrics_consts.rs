// Store mutations, labelled by operation and outcome
pub const FLAG_MUTATIONS_COUNTER: &str = "flags_mutations_total";
pub const EFFECTIVE_FLAGS_REQUESTS_COUNTER: &str = "flags_effective_flags_requests_total";

// Audit trail
pub const AUDIT_ENTRIES_WRITTEN_COUNTER: &str = "flags_audit_entries_written_total";
pub const AUDIT_WRITE_FAILURES_COUNTER: &str = "flags_audit_write_failures_total";

// Change propagation
pub const BROADCASTS_COUNTER: &str = "flags_broadcasts_total";
pub const BROADCAST_DELIVERIES_COUNTER: &str = "flags_broadcast_deliveries_total";
pub const BROADCAST_DELIVERY_FAILURES_COUNTER: &str = "flags_broadcast_delivery_failures_total";
pub const BROADCAST_DURATION_SECONDS: &str = "flags_broadcast_duration_seconds";
pub const CONNECTIONS_GAUGE: &str = "flags_registered_connections";
pub const CONNECTIONS_EVICTED_COUNTER: &str = "flags_connections_evicted_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations_match_recorder_buckets() {
        // The recorder's histogram buckets are in seconds
        assert!(BROADCAST_DURATION_SECONDS.ends_with("_seconds"));
    }
}
