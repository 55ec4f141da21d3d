//! Request-scoped object cache over a shared key-value store, plus a full-page
//! HTTP cache built on top of it.

pub mod cache;
pub mod config;
pub mod infra;
pub mod page;
