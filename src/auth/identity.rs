use std::collections::{HashMap, HashSet};
use std::fmt;

/// System wide permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    ReadMeta,
    Write,
}

impl Permission {
    #[must_use]
    pub fn all() -> HashSet<Permission> {
        HashSet::from([Self::Read, Self::ReadMeta, Self::Write])
    }

    /// Test membership of `self` in a granted set. `Read` subsumes
    /// `ReadMeta`: anyone who may fetch object content may also inspect
    /// its metadata.
    #[must_use]
    pub fn granted_by(self, permissions: &HashSet<Permission>) -> bool {
        permissions.contains(&self)
            || (self == Self::ReadMeta && permissions.contains(&Self::Read))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::ReadMeta => "read-meta",
            Self::Write => "write",
        };
        f.write_str(s)
    }
}

/// Four-level grant tree: organization -> repo -> oid -> permissions, where a
/// `None` key at any level is a wildcard.
pub type PermissionTree =
    HashMap<Option<String>, HashMap<Option<String>, HashMap<Option<String>, HashSet<Permission>>>>;

/// An authenticated (or anonymous) caller.
///
/// Identities are constructed by authenticators and are not mutated for the
/// rest of the request; `is_authorized` is therefore safe to call from any
/// number of concurrent readers.
pub trait Identity: Send + Sync + fmt::Debug {
    fn id(&self) -> Option<&str> {
        None
    }

    fn name(&self) -> Option<&str> {
        None
    }

    fn email(&self) -> Option<&str> {
        None
    }

    /// Tell if this identity may perform an operation on a repo or on a
    /// specific object within it.
    fn is_authorized(
        &self,
        organization: &str,
        repo: &str,
        permission: Permission,
        oid: Option<&str>,
    ) -> bool;
}

/// Identity backed by an explicit permission tree, filled in by `allow` calls
/// during authentication.
#[derive(Debug, Default)]
pub struct DefaultIdentity {
    pub name: Option<String>,
    pub id: Option<String>,
    pub email: Option<String>,
    allowed: PermissionTree,
}

impl DefaultIdentity {
    #[must_use]
    pub fn new(name: Option<String>, id: Option<String>, email: Option<String>) -> Self {
        Self {
            name,
            id,
            email,
            allowed: PermissionTree::default(),
        }
    }

    /// Union `permissions` into the grant at `tree[org][repo][oid]`. Missing
    /// arguments are wildcards. Grants are only ever added, never revoked.
    pub fn allow(
        &mut self,
        organization: Option<&str>,
        repo: Option<&str>,
        permissions: HashSet<Permission>,
        oid: Option<&str>,
    ) {
        self.allowed
            .entry(organization.map(str::to_string))
            .or_default()
            .entry(repo.map(str::to_string))
            .or_default()
            .entry(oid.map(str::to_string))
            .or_default()
            .extend(permissions);
    }

    /// Resolve the most specific grant covering `(organization, repo, oid)`:
    /// exact oid in the repo, then the repo-wide wildcard, then the org-wide
    /// wildcard, then the global subtree.
    fn resolve(
        &self,
        organization: &str,
        repo: &str,
        oid: Option<&str>,
    ) -> Option<&HashSet<Permission>> {
        let oid_key = oid.map(str::to_string);

        if let Some(repos) = self.allowed.get(&Some(organization.to_string())) {
            if let Some(oids) = repos.get(&Some(repo.to_string())) {
                if oid_key.is_some() {
                    if let Some(perms) = oids.get(&oid_key) {
                        return Some(perms);
                    }
                }
                if let Some(perms) = oids.get(&None) {
                    return Some(perms);
                }
            }
            if let Some(oids) = repos.get(&None) {
                if let Some(perms) = oids.get(&None) {
                    return Some(perms);
                }
            }
        }

        if let Some(repos) = self.allowed.get(&None) {
            if let Some(oids) = repos.get(&None) {
                if oid_key.is_some() {
                    if let Some(perms) = oids.get(&oid_key) {
                        return Some(perms);
                    }
                }
                if let Some(perms) = oids.get(&None) {
                    return Some(perms);
                }
            }
        }

        None
    }
}

impl Identity for DefaultIdentity {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    fn is_authorized(
        &self,
        organization: &str,
        repo: &str,
        permission: Permission,
        oid: Option<&str>,
    ) -> bool {
        self.resolve(organization, repo, oid)
            .is_some_and(|perms| permission.granted_by(perms))
    }
}
