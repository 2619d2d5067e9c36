//! Hybrid-Grid - a distributed C/C++ compile fleet.
//!
//! Three processes cooperate: a client (`hgc`) intercepts
//! per-translation-unit compiles and consults a content-addressed
//! local cache, a coordinator schedules cache misses onto workers
//! (Power-of-Two-Choices over scored candidates, with per-worker
//! circuit breakers and latency smoothing), and workers run the
//! compiler natively, in a sandboxed container, or through an MSVC
//! toolchain.

pub mod balance;
pub mod cache;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod exec;
pub mod executor;
pub mod invocation;
pub mod logger;
pub mod proto;
pub mod registry;
pub mod worker;
