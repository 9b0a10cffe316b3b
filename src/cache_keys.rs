//! Centralized store key names
//!
//! Every key the orchestrator, lock manager and syncer touch in the shared
//! store is derived here so that separate instances agree on the layout.

/// Default key of the cached query result set
pub const BIDDERS: &str = "dune:auction_bidders";

/// Hash of lowercased bidder address -> canceled bid count, plus the
/// `CANCELLATIONS_CURSOR` field
pub const CANCELLATIONS: &str = "sync:cancellations";

/// Field of `CANCELLATIONS` holding the next block to scan. Lives in the
/// same hash so counts and resume point move in one write.
pub const CANCELLATIONS_CURSOR: &str = "next_block";

/// Guards a single cancellation sync cycle at a time
pub const CANCELLATIONS_LOCK: &str = "sync:cancellations:lock";

pub fn refresh_lock(cache_key: &str) -> String {
    format!("{}:lock", cache_key)
}

/// Execution id of a refresh in flight, shared so a later refresher can
/// join it instead of paying for a new one.
pub fn pending_execution(cache_key: &str) -> String {
    format!("{}:execution", cache_key)
}
