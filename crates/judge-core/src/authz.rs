//! Authorization seam.
//!
//! Authentication proves who signed a request; an [`Authorizer`] decides
//! whether that signer may ask for a judgment. Real deployments plug an RBAC
//! engine in here.

use std::collections::BTreeSet;

/// Decides whether an authenticated key may call the judge.
pub trait Authorizer: Send + Sync + std::fmt::Debug {
    fn authorize(&self, key_id: &str) -> bool;
}

/// Permits every authenticated caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _key_id: &str) -> bool {
        true
    }
}

/// Permits only the listed key ids.
#[derive(Debug, Clone, Default)]
pub struct StaticAllowList {
    allowed: BTreeSet<String>,
}

impl StaticAllowList {
    pub fn new<I, S>(key_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: key_ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for StaticAllowList {
    fn authorize(&self, key_id: &str) -> bool {
        self.allowed.contains(key_id)
    }
}
