//! Read-visibility enforcer derived from a policy.
//!
//! The enforcer answers one question for the search index: which subjects
//! may read the value at a given JSON pointer. Permissions are path-prefix
//! based; the most specific matching permission wins and revokes win ties.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::PolicyId;

/// Whether a permission grants or revokes read access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Grant,
    Revoke,
}

/// Read permission of one subject on one resource path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPermission {
    /// Subject identifier (e.g. "user:alice")
    pub subject: String,
    /// JSON pointer prefix the permission applies to ("/" for everything)
    pub resource: String,
    pub effect: Effect,
}

/// Resolved read enforcer for one policy revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEnforcer {
    pub policy_id: PolicyId,
    pub revision: i64,
    pub permissions: Vec<ReadPermission>,
}

impl PolicyEnforcer {
    pub fn new(policy_id: impl Into<PolicyId>, revision: i64) -> Self {
        Self {
            policy_id: policy_id.into(),
            revision,
            permissions: Vec::new(),
        }
    }

    pub fn grant(mut self, subject: impl Into<String>, resource: impl Into<String>) -> Self {
        self.permissions.push(ReadPermission {
            subject: subject.into(),
            resource: resource.into(),
            effect: Effect::Grant,
        });
        self
    }

    pub fn revoke(mut self, subject: impl Into<String>, resource: impl Into<String>) -> Self {
        self.permissions.push(ReadPermission {
            subject: subject.into(),
            resource: resource.into(),
            effect: Effect::Revoke,
        });
        self
    }

    /// Subjects allowed to read the value at `path`.
    pub fn readers_of(&self, path: &str) -> BTreeSet<String> {
        let subjects: BTreeSet<&str> = self.permissions.iter().map(|p| p.subject.as_str()).collect();

        subjects
            .into_iter()
            .filter(|subject| self.can_read(subject, path))
            .map(str::to_string)
            .collect()
    }

    /// Whether `subject` may read the value at `path`.
    pub fn can_read(&self, subject: &str, path: &str) -> bool {
        let mut best: Option<(usize, Effect)> = None;
        for permission in self.permissions.iter().filter(|p| p.subject == subject) {
            let Some(depth) = match_depth(&permission.resource, path) else {
                continue;
            };
            best = match best {
                None => Some((depth, permission.effect)),
                Some((best_depth, _)) if depth > best_depth => Some((depth, permission.effect)),
                Some((best_depth, _)) if depth == best_depth && permission.effect == Effect::Revoke => {
                    Some((depth, Effect::Revoke))
                }
                keep => keep,
            };
        }
        matches!(best, Some((_, Effect::Grant)))
    }
}

/// Number of pointer segments of `resource` if it is a prefix of `path`.
fn match_depth(resource: &str, path: &str) -> Option<usize> {
    let resource = resource.trim_end_matches('/');
    if resource.is_empty() {
        return Some(0);
    }
    let path = path.trim_end_matches('/');
    let matches = path == resource
        || (path.starts_with(resource) && path.as_bytes().get(resource.len()) == Some(&b'/'));
    matches.then(|| resource.split('/').filter(|s| !s.is_empty()).count())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enforcer() -> PolicyEnforcer {
        PolicyEnforcer::new("ns:p", 1)
            .grant("user:alice", "/")
            .revoke("user:alice", "/attributes/secret")
            .grant("user:bob", "/attributes")
    }

    #[test]
    fn test_root_grant_applies_everywhere() {
        let e = enforcer();
        assert!(e.can_read("user:alice", "/features/temp/value"));
        assert!(e.can_read("user:alice", "/attributes/name"));
    }

    #[test]
    fn test_more_specific_revoke_wins() {
        let e = enforcer();
        assert!(!e.can_read("user:alice", "/attributes/secret"));
        assert!(!e.can_read("user:alice", "/attributes/secret/pin"));
        assert!(e.can_read("user:bob", "/attributes/secret"));
    }

    #[test]
    fn test_prefix_must_end_at_segment_boundary() {
        let e = enforcer();
        assert!(e.can_read("user:bob", "/attributes/name"));
        assert!(!e.can_read("user:bob", "/attributesX"));
        assert!(!e.can_read("user:bob", "/features/temp"));
    }

    #[test]
    fn test_revoke_wins_ties() {
        let e = PolicyEnforcer::new("p", 1)
            .grant("user:carol", "/attributes")
            .revoke("user:carol", "/attributes");
        assert!(!e.can_read("user:carol", "/attributes/a"));
    }

    #[test]
    fn test_readers_of() {
        let e = enforcer();
        let readers: Vec<_> = e.readers_of("/attributes/secret").into_iter().collect();
        assert_eq!(readers, vec!["user:bob".to_string()]);

        let readers = e.readers_of("/features/f1");
        assert_eq!(readers.len(), 1);
        assert!(readers.contains("user:alice"));
    }
}
