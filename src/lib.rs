pub mod config;
pub mod error;
pub mod influx;
pub mod ingest;
pub mod mqtt;
pub mod point;
pub mod reading;
