//! Authorization hooks.
//!
//! An [`AuthManager`] is consulted before every read, listing and mutating
//! operation made through an [`Ndb::auth_proxy`](crate::Ndb::auth_proxy)
//! handle. A `false` answer or an error denies the operation with
//! [`Error::PermissionDenied`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::schema::TableId;

/// Permission tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    /// Look up one object.
    Read,
    /// Enumerate a table.
    List,
    /// Create, change or remove an object.
    Modify,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "obj:read",
            Self::List => "obj:list",
            Self::Modify => "obj:modify",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an operation is about.
#[derive(Debug, Clone, Copy)]
pub struct AuthObject<'a> {
    pub table: TableId,
    pub target: &'a str,
}

/// Authorization manager.
pub trait AuthManager: Send + Sync + fmt::Debug {
    fn check(&self, object: &AuthObject<'_>, permission: Permission) -> Result<bool>;
}

/// Grants a fixed set of permissions.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthManager {
    name: String,
    grants: BTreeSet<Permission>,
}

impl StaticAuthManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            grants: BTreeSet::new(),
        }
    }

    /// Grant a permission.
    pub fn grant(mut self, permission: Permission) -> Self {
        self.grants.insert(permission);
        self
    }

    /// Grant every permission.
    pub fn grant_all(self) -> Self {
        self.grant(Permission::Read)
            .grant(Permission::List)
            .grant(Permission::Modify)
    }
}

impl AuthManager for StaticAuthManager {
    fn check(&self, _object: &AuthObject<'_>, permission: Permission) -> Result<bool> {
        Ok(self.grants.contains(&permission))
    }
}

/// The managers of one proxy handle; all of them must agree.
#[derive(Debug, Clone, Default)]
pub(crate) struct AuthSet {
    id: u64,
    managers: Vec<Arc<dyn AuthManager>>,
}

impl AuthSet {
    /// A new set extending `self` with `manager`.
    pub(crate) fn with(&self, manager: Arc<dyn AuthManager>) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);

        let mut managers = self.managers.clone();
        managers.push(manager);
        Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            managers,
        }
    }

    /// Cache partition of the set; 0 when unrestricted.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn check(&self, table: TableId, target: &str, permission: Permission) -> Result<()> {
        let object = AuthObject { table, target };
        for manager in &self.managers {
            match manager.check(&object, permission) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(Error::PermissionDenied(format!(
                        "{permission} on {table} ({target})"
                    )));
                }
                Err(e) => {
                    return Err(Error::PermissionDenied(format!(
                        "{permission} on {table} ({target}): {e}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Broken;

    impl AuthManager for Broken {
        fn check(&self, _: &AuthObject<'_>, _: Permission) -> Result<bool> {
            Err(Error::Transport("auth backend down".into()))
        }
    }

    #[test]
    fn test_static_grants() {
        let set = AuthSet::default()
            .with(Arc::new(StaticAuthManager::new("ro").grant(Permission::Read)));
        assert!(set.check(TableId::Interfaces, "localhost", Permission::Read).is_ok());
        let err = set
            .check(TableId::Interfaces, "localhost", Permission::Modify)
            .unwrap_err();
        assert!(err.is_permission_denied());
        assert!(err.to_string().contains("obj:modify"));
    }

    #[test]
    fn test_error_denies() {
        let set = AuthSet::default().with(Arc::new(Broken));
        assert!(
            set.check(TableId::Routes, "localhost", Permission::List)
                .unwrap_err()
                .is_permission_denied()
        );
    }

    #[test]
    fn test_every_manager_must_agree() {
        let set = AuthSet::default()
            .with(Arc::new(StaticAuthManager::new("all").grant_all()))
            .with(Arc::new(StaticAuthManager::new("none")));
        assert_ne!(set.id(), 0);
        assert!(set.check(TableId::Addresses, "localhost", Permission::Read).is_err());
        assert!(AuthSet::default().check(TableId::Addresses, "x", Permission::Modify).is_ok());
    }
}
