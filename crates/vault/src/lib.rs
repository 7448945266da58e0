//! Tenant credential vault: envelope encryption with per-tenant DEKs, resumable
//! key rotation, and the tenant-aware task orchestrator that drives it.

pub mod aws;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod dek;
pub mod kms;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod snapshot;
pub mod storage;
pub mod tasks;
pub mod telemetry;
