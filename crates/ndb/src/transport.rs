//! Transport seam between sources and a kernel.
//!
//! A [`Connector`] opens a [`Transport`] for a [`SourceSpec`]; the transport
//! carries requests to the kernel and delivers its broadcast events. The
//! netlink wire codec lives behind this trait; the `lab` feature provides an
//! in-process implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::source::SourceSpec;
use crate::value::Attrs;

/// Request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Create,
    Modify,
    Delete,
    Get,
    Dump,
}

impl Verb {
    /// Check whether the verb changes kernel state.
    pub fn is_mutating(self) -> bool {
        matches!(self, Self::Create | Self::Modify | Self::Delete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Get => "get",
            Self::Dump => "dump",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to the kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: EventKind,
    pub verb: Verb,
    pub fields: Attrs,
}

impl Request {
    pub fn new(kind: EventKind, verb: Verb, fields: Attrs) -> Self {
        Self { kind, verb, fields }
    }

    /// A dump request for one family.
    pub fn dump(kind: EventKind) -> Self {
        Self::new(kind, Verb::Dump, Attrs::new())
    }
}

/// A connection to one kernel (namespace, remote system).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to the broadcast groups.
    async fn bind(&self) -> Result<()>;

    /// Send a request and collect the response messages.
    ///
    /// Kernel rejections come back as [`Error::Protocol`](crate::Error::Protocol).
    async fn request(&self, request: Request) -> Result<Vec<Event>>;

    /// Wait for the next batch of broadcast events.
    ///
    /// An error means the connection is lost.
    async fn recv(&self) -> Result<Vec<Event>>;

    /// Close the connection. Pending and later `recv` calls fail.
    async fn close(&self);
}

/// Opens transports for source specs.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, spec: &SourceSpec) -> Result<Arc<dyn Transport>>;
}
