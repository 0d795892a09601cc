//! Transactional network-state database for Linux RTNL objects.
//!
//! NDB keeps an in-memory, relational mirror of the kernel networking state
//! (interfaces, addresses, routes, neighbours, rules, namespaces) of one or
//! more sources, kept current from broadcast events. Objects loaded from the
//! database are edited locally and committed to the kernel; a failed commit
//! restores the previous state, including dependent objects the kernel
//! removed as a side effect.
//!
//! # Features
//!
//! - `lab` - In-process kernel simulator ([`lab::SimKernel`])
//! - `full` - All features enabled
//!
//! # Example
//!
//! ```ignore
//! use ndb::{Ndb, NdbConfig, Spec};
//!
//! #[tokio::main]
//! async fn main() -> ndb::Result<()> {
//!     let ndb = Ndb::new(NdbConfig::default(), connector).await?;
//!
//!     let dummy = ndb
//!         .interfaces()
//!         .create(Spec::new().with("ifname", "dummy0").with("kind", "dummy"))
//!         .await?;
//!     dummy.set("state", "up")?.add_ip("10.0.0.1/24")?;
//!     dummy.commit().await?;
//!
//!     println!("{}", ndb.interfaces().summary().await?);
//!     ndb.close().await
//! }
//! ```
//!
//! # Transactions
//!
//! ```ignore
//! use ndb::{PingAddress, Transaction};
//!
//! let mut tx = ndb.begin();
//! tx.push(eth0).push(PingAddress::new("10.0.0.254"));
//! // Rolls eth0 back if the gateway does not answer.
//! tx.commit().await?;
//! ```
//!
//! # Event handlers
//!
//! ```ignore
//! use ndb::{EventKind, Outcome};
//!
//! ndb.register_handler(EventKind::Link, Box::new(|_store, target, event| {
//!     tracing::info!(target, index = ?event.get_int("index"), "link event");
//!     Ok(Outcome::Continue)
//! }))
//! .await?;
//! ```

// Core modules
pub mod auth;
pub mod config;
mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod gate;
pub mod handlers;
pub mod object;
mod objects;
pub mod queue;
pub mod report;
pub mod schema;
pub mod source;
pub mod store;
pub mod transaction;
pub mod transport;
pub mod value;
pub mod view;

// Feature-gated modules
#[cfg(feature = "lab")]
pub mod lab;

// Re-export common types at crate root for convenience
pub use auth::{AuthManager, AuthObject, Permission, StaticAuthManager};
pub use config::{ApplyConfig, NdbConfig};
pub use db::{Ndb, NdbBuilder};
pub use engine::{Handler, HandlerId, Outcome};
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use gate::ReadOnlyGuard;
pub use object::{ObjectState, RtnlObject, SavePoint, Snapshot};
pub use report::{Format, Record, RecordSet};
pub use schema::TableId;
pub use source::{Source, SourceKind, SourceSpec, SourceState, Sources};
pub use store::{Filter, Row, Store};
pub use transaction::{CheckProcess, Commit, PingAddress, Transaction};
pub use transport::{Connector, Request, Transport, Verb};
pub use value::{Attrs, Fields, Value};
pub use view::{Selector, Spec, View};
