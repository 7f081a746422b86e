//! Metric names recorded by the transport.
//!
//! Recording goes through the `metrics` facade; installing an exporter is
//! the embedding binary's job.

/// Live sessions held by a registry (gauge).
pub const SESSIONS_ACTIVE: &str = "tether_sessions_active";
/// Sessions closed (counter).
pub const SESSIONS_CLOSED_TOTAL: &str = "tether_sessions_closed_total";
/// Links opened (counter).
pub const LINKS_OPENED_TOTAL: &str = "tether_links_opened_total";
/// Links closed (counter).
pub const LINKS_CLOSED_TOTAL: &str = "tether_links_closed_total";
/// Inbound requests accepted (counter, labels: kind).
pub const LOCAL_OPERATIONS_TOTAL: &str = "tether_local_operations_total";
/// Outbound requests submitted (counter, labels: kind).
pub const REMOTE_OPERATIONS_TOTAL: &str = "tether_remote_operations_total";
/// Operations retired by the consistency monitor (counter, labels: direction).
pub const INCONSISTENCY_RETIRED_TOTAL: &str = "tether_inconsistency_retired_total";
/// Responses that could not be handed to any link (counter).
pub const DELIVERY_FAILURES_TOTAL: &str = "tether_delivery_failures_total";
/// Frames that failed to decode (counter).
pub const DECODE_FAILURES_TOTAL: &str = "tether_decode_failures_total";
/// Round-trip of remote operations, send to terminal reply (histogram).
pub const REMOTE_OPERATION_SECONDS: &str = "tether_remote_operation_seconds";
