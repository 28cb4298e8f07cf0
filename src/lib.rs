//! Fit Pipeline: durable async task processing for a fitness app.

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod fitness;
pub mod inference;
pub mod storage;
pub mod store;
pub mod tasks;
pub mod workflows;
