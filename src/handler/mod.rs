pub use self::{
    event_syncer::EventSyncer,
    lock::{HeldLock, LockManager},
    orchestrator::{CacheOrchestrator, CacheTarget},
};

pub mod event_syncer;
pub mod lock;
pub mod orchestrator;
