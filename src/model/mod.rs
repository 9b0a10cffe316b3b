pub use self::{
    cache_entry::{CacheEntry, CachedData, DataSource},
    sync_report::SyncReport,
};

mod cache_entry;
mod sync_report;
