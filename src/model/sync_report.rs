#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReport {
    /// Another sync cycle holds the sync lock
    Skipped,
    UpToDate { next_block: u64, head: u64 },
    Synced {
        from_block: u64,
        next_block: u64,
        chunks: u32,
        events: u64,
    },
}
