pub use self::{
    dune::{AnalyticsApi, CompletedExecution, DuneClient},
    memory_store::MemoryStore,
    redis_store::RedisStore,
    rpc::{ChainRpc, RpcClient},
    store::CacheStore,
};

pub mod dune;
mod memory_store;
mod redis_store;
pub mod rpc;
mod store;
