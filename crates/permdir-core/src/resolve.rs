//! ---
//! permdir_section: "06-security-access-control"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Permission directory model, resolution, and replication."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
//! Effective permission decisions.
//!
//! Candidates are the user's own records, the records of every applicable
//! group, and any scoped records keyed by an applicable group. The winner is
//! picked by specificity first (literal over wildcard, deeper wildcard over
//! shallower), then by the configured tie-breaks.
use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use permdir_common::{AbsentPolicy, ResolutionConfig, TieBreak};
use serde::{Deserialize, Serialize};

use crate::entity::{Permissible, PermissionUser};
use crate::hierarchy::{applicable_groups, GroupMap};
use crate::permission::{Permission, Specificity};

/// Outcome of a permission query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The winning record has non-negative potency.
    Granted,
    /// The winning record has negative potency.
    Denied,
    /// No live record matched.
    Absent,
}

impl Decision {
    /// Collapse into an allow/deny answer, mapping `Absent` through `policy`.
    pub fn allows(self, policy: AbsentPolicy) -> bool {
        match self {
            Decision::Granted => true,
            Decision::Denied => false,
            Decision::Absent => policy.allows(),
        }
    }

    /// Lowercase label used for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Granted => "granted",
            Decision::Denied => "denied",
            Decision::Absent => "absent",
        }
    }
}

/// Where a winning record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordSource {
    /// The user's own records.
    User {
        /// User name.
        name: String,
    },
    /// A group's own records.
    Group {
        /// Group name.
        name: String,
    },
    /// Records of `owner` scoped to the applicable group `group`.
    Scoped {
        /// User or group owning the scoped list.
        owner: String,
        /// Group the list is keyed by.
        group: String,
    },
}

/// The record that decided a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Winner {
    /// The record itself.
    pub permission: Permission,
    /// Its origin.
    pub source: RecordSource,
}

/// Decision plus the record that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Final decision.
    pub decision: Decision,
    /// Winning record, absent when nothing matched.
    pub winner: Option<Winner>,
}

impl Resolution {
    pub(crate) fn absent() -> Self {
        Self {
            decision: Decision::Absent,
            winner: None,
        }
    }
}

#[derive(Clone, Copy)]
struct Owner<'a> {
    entity: &'a Permissible,
    sort_id: Option<i32>,
}

#[derive(Clone, Copy)]
struct Candidate<'a> {
    record: &'a Permission,
    specificity: Specificity,
    owner: Owner<'a>,
    scope: Option<&'a str>,
}

impl Candidate<'_> {
    fn source(&self) -> RecordSource {
        let owner = self.owner.entity.name.clone();
        match (self.scope, self.owner.sort_id) {
            (Some(group), _) => RecordSource::Scoped {
                owner,
                group: group.to_owned(),
            },
            (None, Some(_)) => RecordSource::Group { name: owner },
            (None, None) => RecordSource::User { name: owner },
        }
    }
}

/// Pure resolution engine; holds only the tie-break configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolver {
    tie_breaks: Vec<TieBreak>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::from_config(&ResolutionConfig::default())
    }
}

impl Resolver {
    /// Build a resolver with an explicit tie-break order.
    pub fn new(tie_breaks: Vec<TieBreak>) -> Self {
        Self { tie_breaks }
    }

    /// Build a resolver from configuration.
    pub fn from_config(config: &ResolutionConfig) -> Self {
        Self::new(config.tie_breaks.clone())
    }

    /// Active tie-break order.
    pub fn tie_breaks(&self) -> &[TieBreak] {
        &self.tie_breaks
    }

    /// Resolve `query` for `user` against `groups` at `now`.
    pub fn resolve(
        &self,
        user: &PermissionUser,
        groups: &GroupMap,
        query: &str,
        now: DateTime<Utc>,
    ) -> Resolution {
        let applicable = applicable_groups(groups, user, now);
        let applicable_names: HashSet<&str> = applicable.iter().map(|g| g.name()).collect();

        let mut contest = Contest {
            resolver: self,
            query,
            now,
            best: None,
        };

        let user_owner = Owner {
            entity: &user.base,
            sort_id: None,
        };
        contest.offer(&user.base.permissions, user_owner, None);
        contest.offer_scoped(&user.base, user_owner, &applicable_names);

        for group in &applicable {
            let owner = Owner {
                entity: &group.base,
                sort_id: Some(group.sort_id),
            };
            contest.offer(&group.base.permissions, owner, None);
            contest.offer_scoped(&group.base, owner, &applicable_names);
        }

        match contest.best {
            Some(winner) => Resolution {
                decision: if winner.record.is_grant() {
                    Decision::Granted
                } else {
                    Decision::Denied
                },
                winner: Some(Winner {
                    permission: winner.record.clone(),
                    source: winner.source(),
                }),
            },
            None => Resolution::absent(),
        }
    }

    /// Ordering between two matching candidates; `Greater` means `a` wins.
    fn compare(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        a.specificity.cmp(&b.specificity).then_with(|| {
            for tie_break in &self.tie_breaks {
                let ordering = match tie_break {
                    TieBreak::SourcePotency => a.owner.entity.potency.cmp(&b.owner.entity.potency),
                    TieBreak::SortId => match (a.owner.sort_id, b.owner.sort_id) {
                        (Some(left), Some(right)) => right.cmp(&left),
                        _ => Ordering::Equal,
                    },
                    TieBreak::CreatedAt => a
                        .owner
                        .entity
                        .created_at
                        .cmp(&b.owner.entity.created_at),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }
}

struct Contest<'r, 'a> {
    resolver: &'r Resolver,
    query: &'r str,
    now: DateTime<Utc>,
    best: Option<Candidate<'a>>,
}

impl<'a> Contest<'_, 'a> {
    fn offer(&mut self, records: &'a [Permission], owner: Owner<'a>, scope: Option<&'a str>) {
        for record in records {
            if record.is_expired(self.now) {
                continue;
            }
            let Some(specificity) = record.name.matches(self.query) else {
                continue;
            };
            let candidate = Candidate {
                record,
                specificity,
                owner,
                scope,
            };
            // ties keep the earlier candidate
            let replace = match &self.best {
                None => true,
                Some(best) => self.resolver.compare(&candidate, best) == Ordering::Greater,
            };
            if replace {
                self.best = Some(candidate);
            }
        }
    }

    fn offer_scoped(
        &mut self,
        entity: &'a Permissible,
        owner: Owner<'a>,
        applicable: &HashSet<&str>,
    ) {
        for (group, records) in &entity.scoped_permissions {
            if applicable.contains(group.as_str()) {
                self.offer(records, owner, Some(group.as_str()));
            }
        }
    }
}
