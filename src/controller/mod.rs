//! HTTP endpoints

pub mod cache;
pub mod health;
