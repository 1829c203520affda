#![forbid(unsafe_code)]

pub mod backoff;
pub mod connection_manager;
pub mod event_bus;
pub mod health;
pub mod persistence;
pub mod reporter;
