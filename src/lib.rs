pub mod cache_keys;
pub mod cli;
pub mod clock;
pub mod configuration;
pub mod controller;
pub mod error;
pub mod handler;
pub mod model;
pub mod provider;
pub mod server;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;
