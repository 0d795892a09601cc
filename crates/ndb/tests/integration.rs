//! Integration test entry point.
//!
//! The tests drive a full database (engine, sources, objects) against the
//! in-process kernel simulator, so they need the `lab` feature but no
//! privileges:
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration --features lab
//!
//! # Run specific test module
//! cargo test --test integration --features lab interface
//!
//! # Run with engine logs
//! RUST_LOG=ndb=debug cargo test --test integration --features lab -- --nocapture
//! ```
//!
//! # Test Organization
//!
//! - `interface.rs` - Interface creation, modification, removal and rollback
//! - `address.rs` - Addresses and neighbours queued on interfaces
//! - `route.rs` - Routes, rules and kernel side effects
//! - `transaction.rs` - Multi-object transactions
//! - `source.rs` - Source life cycle, reconnects and namespaces
//! - `access.rs` - Authorization, read-only mode, handlers and reports

#[path = "common/mod.rs"]
mod common;

#[path = "integration/interface.rs"]
mod interface;

#[path = "integration/address.rs"]
mod address;

#[path = "integration/route.rs"]
mod route;

#[path = "integration/transaction.rs"]
mod transaction;

#[path = "integration/source.rs"]
mod source;

#[path = "integration/access.rs"]
mod access;
