// ==== Producer ====
/// Counter for records acknowledged by the stream
pub const RECORDS_SENT: &str = "stream_records_sent_total";

/// Counter for send attempts that failed and were retried
pub const SEND_RETRIES: &str = "stream_send_retries_total";

/// Counter for sends that failed terminally (with kind label)
pub const SEND_FAILURES: &str = "stream_send_failures_total";

/// Histogram for time from send call to acknowledgment
pub const SEND_DURATION: &str = "stream_send_duration_seconds";

/// Counter for connections opened by producers and receivers
pub const CONNECTIONS_OPENED: &str = "stream_connections_opened_total";

// ==== Receiver ====
/// Counter for records handed to a record handler (with partition label)
pub const RECORDS_DELIVERED: &str = "stream_records_delivered_total";

/// Counter for record handler failures
pub const HANDLER_ERRORS: &str = "stream_handler_errors_total";

/// Counter for records skipped because a checkpoint already covered them
pub const RECORDS_SKIPPED: &str = "stream_records_skipped_total";

/// Gauge for receivers currently streaming
pub const ACTIVE_RECEIVERS: &str = "stream_active_receivers";

// ==== Checkpoints ====
/// Counter for accepted checkpoint writes
pub const CHECKPOINT_UPDATES: &str = "stream_checkpoint_updates_total";

/// Counter for contested checkpoint writes (with outcome label)
pub const CHECKPOINT_CONFLICTS: &str = "stream_checkpoint_conflicts_total";

/// Counter for compare-and-set retries after a concurrent write
pub const CHECKPOINT_CAS_RETRIES: &str = "stream_checkpoint_cas_retries_total";

// ==== Coordinator ====
/// Counter for rebalances that moved at least one partition
pub const REBALANCES: &str = "stream_rebalances_total";

/// Counter for revocations forced after the revocation timeout
pub const REVOCATION_TIMEOUTS: &str = "stream_revocation_timeouts_total";

/// Gauge for live members of the consumer group
pub const GROUP_MEMBERS: &str = "stream_group_members";
