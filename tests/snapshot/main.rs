//! Snapshot Integration Test Suite
//!
//! Drives the whole snapshot protocol against an in-process mini cluster of
//! three tablet servers.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test snapshot
//!
//! # Restore tests only
//! cargo test --test snapshot restore::
//! ```

#[path = "../common/mod.rs"]
mod common;

mod bootstrap;
mod create;
mod delete;
mod import;
mod restore;
