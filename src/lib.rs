//! `syncpipe` — the server-side core of a checksum-verified sync pipeline.
//!
//! A source database is replicated into an append-only, gap-free per-bucket
//! operation log (`op_log`). Sync rules partition that log into buckets
//! (`rules`); clients stream bucket contents in priority order through a
//! per-connection orchestrator (`orchestrator`, `connection`) that verifies
//! every checkpoint against an independently maintained checksum
//! (`checksum`). A checkpoint-change demultiplexer (`checkpoint`) fans a
//! single upstream notification stream out to every active connection
//! without ever queuing more than the latest value per subscriber. Clients
//! authenticate with JWTs resolved against a pluggable key store (`auth`).
//!
//! None of the modules here open a listening socket or parse a sync-rules
//! DSL; both are left to an embedding binary, matching the boundary drawn
//! in the design notes (`DESIGN.md`).

pub mod auth;
pub mod checkpoint;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod op_log;
pub mod orchestrator;
pub mod replication;
pub mod rules;
pub mod storage;
pub mod telemetry;
pub mod wire;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
