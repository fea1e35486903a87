//! A block cache service exporting cache-accelerated devices over an in-memory engine.
pub mod memory_disk;
pub mod memory_engine;
pub mod service;
pub mod workload;
