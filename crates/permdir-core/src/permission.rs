//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, Result};

const SEPARATOR: char = '.';
const WILDCARD: &str = "*";

/// How precisely a record name matched a queried permission.
///
/// Ordering is significant: any literal match outranks every wildcard match,
/// and deeper wildcards outrank shallower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Specificity {
    /// Wildcard match; `depth` is the number of non-`*` segments in the record.
    Wildcard {
        /// Non-wildcard prefix length in segments.
        depth: usize,
    },
    /// Exact name equality.
    Literal,
}

/// Validated dot-segmented permission name, optionally ending in a `*` segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionName(String);

impl PermissionName {
    /// Parse and validate a permission name.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(DirectoryError::Validation(
                "permission name must not be empty".into(),
            ));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(DirectoryError::Validation(format!(
                "permission name {raw:?} contains whitespace"
            )));
        }
        let segments: Vec<&str> = raw.split(SEPARATOR).collect();
        let last = segments.len() - 1;
        for (index, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(DirectoryError::Validation(format!(
                    "permission name {raw:?} contains an empty segment"
                )));
            }
            if segment.contains('*') && (*segment != WILDCARD || index != last) {
                return Err(DirectoryError::Validation(format!(
                    "permission name {raw:?} may only use `*` as its final segment"
                )));
            }
        }
        Ok(Self(raw))
    }

    /// Borrow the raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the name ends in a `*` segment.
    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD || self.0.ends_with(".*")
    }

    /// Match this record name against a queried permission.
    pub fn matches(&self, query: &str) -> Option<Specificity> {
        if self.0 == query {
            return Some(Specificity::Literal);
        }
        if !self.is_wildcard() {
            return None;
        }
        if self.0 == WILDCARD {
            return (!query.is_empty()).then_some(Specificity::Wildcard { depth: 0 });
        }

        // strip the trailing "*", keeping the separator: "a.b.*" -> "a.b."
        let prefix = &self.0[..self.0.len() - 1];
        let matched = query.len() > prefix.len() && query.starts_with(prefix);
        matched.then(|| Specificity::Wildcard {
            depth: prefix.matches(SEPARATOR).count(),
        })
    }
}

impl TryFrom<String> for PermissionName {
    type Error = DirectoryError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<PermissionName> for String {
    fn from(value: PermissionName) -> Self {
        value.0
    }
}

impl fmt::Display for PermissionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Single grant (potency >= 0) or deny (potency < 0) record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Permission path, possibly a wildcard.
    pub name: PermissionName,
    /// Signed potency; the sign decides grant vs deny.
    #[serde(default)]
    pub potency: i32,
    /// Expiry; `None` is permanent.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Permission {
    /// Create a permanent record, validating the name.
    pub fn new(name: impl Into<String>, potency: i32) -> Result<Self> {
        Ok(Self {
            name: PermissionName::parse(name)?,
            potency,
            expires_at: None,
        })
    }

    /// Permanent grant with potency 1.
    pub fn grant(name: impl Into<String>) -> Result<Self> {
        Self::new(name, 1)
    }

    /// Permanent deny with potency -1.
    pub fn deny(name: impl Into<String>) -> Result<Self> {
        Self::new(name, -1)
    }

    /// Set the expiry timestamp.
    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Whether the record has passed its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the record grants rather than denies.
    pub fn is_grant(&self) -> bool {
        self.potency >= 0
    }
}
