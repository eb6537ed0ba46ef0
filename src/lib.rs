//! Network packet field ingestion into per-sensor, per-day histograms with
//! a globally consistent annotation dictionary, kept in a shared store.

pub mod config;
pub mod dictionary;
pub mod export;
pub mod field;
pub mod histogram;
pub mod ingest;
pub mod route;
pub mod store;
