// ==== Consumption ====
/// Counter for messages received from the source topic
pub const MESSAGES_RECEIVED: &str = "minute_agg_messages_received";
/// Counter for events applied to an accumulator
pub const EVENTS_AGGREGATED: &str = "minute_agg_events_aggregated";
/// Counter for consumer receive errors, labelled by kind
pub const CONSUMER_ERRORS: &str = "minute_agg_consumer_errors";
/// Counter for offset commits, labelled by outcome
pub const OFFSETS_COMMITTED: &str = "minute_agg_offsets_committed";
/// Gauge for the committed offset of each partition
pub const COMMITTED_OFFSET: &str = "minute_agg_committed_offset";

// ==== Dead letters ====
/// Counter for rejected messages, labelled by reason code
pub const DEAD_LETTER_EVENTS: &str = "minute_agg_dead_letter_events";
/// Counter for dead-letter records that never reached the destination, labelled by cause
pub const DEAD_LETTER_DROPPED: &str = "minute_agg_dead_letter_dropped";
/// Counter for dead-letter records written to the destination
pub const DEAD_LETTER_WRITTEN: &str = "minute_agg_dead_letter_written";

// ==== Flush ====
pub const FLUSH_TICKS: &str = "minute_agg_flush_ticks";
pub const FLUSH_DURATION: &str = "minute_agg_flush_duration_ms";
/// Counter for sink write attempts, labelled by outcome
pub const SINK_WRITE_ATTEMPTS: &str = "minute_agg_sink_write_attempts";
pub const SNAPSHOTS_WRITTEN: &str = "minute_agg_snapshots_written";
/// Counter for snapshots left dirty after every retry failed
pub const SNAPSHOTS_DEFERRED: &str = "minute_agg_snapshots_deferred";
pub const WINDOWS_EVICTED: &str = "minute_agg_windows_evicted";
pub const KEYS_PAUSED: &str = "minute_agg_keys_paused";

// ==== Memory pressure ====
pub const ACTIVE_WINDOWS: &str = "minute_agg_active_windows";
pub const DIRTY_WINDOWS: &str = "minute_agg_dirty_windows";
pub const BUFFERED_EVENTS: &str = "minute_agg_buffered_events";
pub const TRACKED_USERS: &str = "minute_agg_tracked_users";

// ==== Shutdown ====
/// Counter for windows whose latest state could not be stored before exit
pub const STATE_LOST_ON_SHUTDOWN: &str = "minute_agg_state_lost_on_shutdown";

// ==== HTTP ====
/// Counter for served requests, labelled by route and status
pub const HTTP_REQUESTS: &str = "minute_agg_http_requests";
pub const HTTP_REQUEST_DURATION: &str = "minute_agg_http_request_duration_seconds";
