//! Search update mappers.
//!
//! A mapper turns a retrieved thing and its resolved enforcer into a write
//! model. Mappers are registered by name and resolved once at startup from
//! `updater.mapper`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use searchsync_types::{
    ChangeMetadata, DocumentEntry, PolicyEnforcer, SearchDocument, WriteModel,
};

use crate::error::IndexingError;

/// Name of the built-in mapper.
pub const DEFAULT_MAPPER: &str = "default";

/// Builds write models from retrieved things.
pub trait SearchUpdateMapper: Send + Sync {
    fn name(&self) -> &str;

    /// Build the write model of one thing.
    ///
    /// `base_revision` is set when the thing was retrieved incrementally; the
    /// resulting model must then only apply on top of that indexed revision.
    fn to_write_model(
        &self,
        metadata: ChangeMetadata,
        thing: &Value,
        enforcer: &PolicyEnforcer,
        base_revision: Option<i64>,
    ) -> WriteModel;
}

/// Flattens every leaf of the thing into a `(path, value, readers)` entry.
///
/// Top-level fields starting with `_` are bookkeeping and not indexed. Leaves
/// nobody may read are dropped. Arrays are indexed as single values.
#[derive(Debug, Default, Clone)]
pub struct DefaultMapper;

impl DefaultMapper {
    pub fn build_document(
        &self,
        metadata: &ChangeMetadata,
        thing: &Value,
        enforcer: &PolicyEnforcer,
    ) -> SearchDocument {
        let mut entries = Vec::new();
        if let Value::Object(fields) = thing {
            for (key, value) in fields {
                if key.starts_with('_') {
                    continue;
                }
                flatten(&format!("/{}", escape(key)), value, enforcer, &mut entries);
            }
        }

        let global_readers: BTreeSet<String> = entries
            .iter()
            .flat_map(|entry| entry.readers.iter().cloned())
            .collect();

        let thing_revision = thing
            .get("_revision")
            .and_then(Value::as_i64)
            .map_or(metadata.thing_revision, |rev| rev.max(metadata.thing_revision));
        let modified = thing
            .get("_modified")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .or(metadata.modified);

        SearchDocument {
            thing_id: metadata.thing_id.clone(),
            thing_revision,
            policy_id: Some(enforcer.policy_id.clone()),
            policy_revision: Some(enforcer.revision),
            modified,
            global_readers,
            entries,
        }
    }
}

impl SearchUpdateMapper for DefaultMapper {
    fn name(&self) -> &str {
        DEFAULT_MAPPER
    }

    fn to_write_model(
        &self,
        mut metadata: ChangeMetadata,
        thing: &Value,
        enforcer: &PolicyEnforcer,
        base_revision: Option<i64>,
    ) -> WriteModel {
        let document = self.build_document(&metadata, thing, enforcer);
        metadata.policy_id = document.policy_id.clone();
        metadata.policy_revision = document.policy_revision;
        match base_revision {
            Some(expected_revision) => WriteModel::Patch {
                metadata,
                expected_revision,
                document,
            },
            None => WriteModel::Update { metadata, document },
        }
    }
}

fn flatten(path: &str, value: &Value, enforcer: &PolicyEnforcer, out: &mut Vec<DocumentEntry>) {
    match value {
        Value::Object(fields) if !fields.is_empty() => {
            for (key, child) in fields {
                flatten(&format!("{}/{}", path, escape(key)), child, enforcer, out);
            }
        }
        _ => {
            let readers = enforcer.readers_of(path);
            if !readers.is_empty() {
                out.push(DocumentEntry {
                    path: path.to_string(),
                    value: value.clone(),
                    readers,
                });
            }
        }
    }
}

/// JSON pointer escaping of one segment.
fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Mappers by configuration name.
#[derive(Clone)]
pub struct MapperRegistry {
    mappers: HashMap<String, Arc<dyn SearchUpdateMapper>>,
}

impl Default for MapperRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl MapperRegistry {
    /// Registry without any mapper.
    pub fn empty() -> Self {
        Self {
            mappers: HashMap::new(),
        }
    }

    /// Registry containing the built-in mapper under [`DEFAULT_MAPPER`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(DEFAULT_MAPPER, Arc::new(DefaultMapper));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, mapper: Arc<dyn SearchUpdateMapper>) {
        self.mappers.insert(name.into(), mapper);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn SearchUpdateMapper>, IndexingError> {
        self.mappers
            .get(name)
            .cloned()
            .ok_or_else(|| IndexingError::UnknownMapper(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.mappers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enforcer() -> PolicyEnforcer {
        PolicyEnforcer::new("ns:p", 7)
            .grant("user:alice", "/")
            .revoke("user:alice", "/attributes/secret")
            .grant("user:bob", "/features")
    }

    fn thing() -> Value {
        json!({
            "_revision": 4,
            "_modified": "2026-01-02T03:04:05Z",
            "thingId": "ns:t1",
            "attributes": { "name": "pump", "secret": "1234", "tags": ["a", "b"] },
            "features": { "temp": { "properties": { "value": 21.5 } } }
        })
    }

    #[test]
    fn test_flattens_visible_leaves() {
        let metadata = ChangeMetadata::new("ns:t1", 4);
        let doc = DefaultMapper.build_document(&metadata, &thing(), &enforcer());

        let paths: Vec<_> = doc.entries.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"/thingId"));
        assert!(paths.contains(&"/attributes/name"));
        assert!(paths.contains(&"/attributes/tags"));
        assert!(paths.contains(&"/features/temp/properties/value"));
        assert!(!paths.contains(&"/attributes/secret"));
        assert!(!paths.iter().any(|p| p.starts_with("/_")));

        let temp = doc.entry("/features/temp/properties/value").unwrap();
        assert_eq!(temp.readers.len(), 2);
        assert_eq!(doc.global_readers.len(), 2);
    }

    #[test]
    fn test_document_carries_revisions() {
        let metadata = ChangeMetadata::new("ns:t1", 3);
        let doc = DefaultMapper.build_document(&metadata, &thing(), &enforcer());

        assert_eq!(doc.thing_revision, 4);
        assert_eq!(doc.policy_revision, Some(7));
        assert!(doc.modified.is_some());
    }

    #[test]
    fn test_pointer_segments_are_escaped() {
        let metadata = ChangeMetadata::new("t", 1);
        let doc = DefaultMapper.build_document(
            &metadata,
            &json!({ "attributes": { "a/b": 1, "c~d": 2 } }),
            &enforcer(),
        );
        assert!(doc.entry("/attributes/a~1b").is_some());
        assert!(doc.entry("/attributes/c~0d").is_some());
    }

    #[test]
    fn test_base_revision_produces_patch() {
        let model = DefaultMapper.to_write_model(
            ChangeMetadata::new("ns:t1", 4),
            &thing(),
            &enforcer(),
            Some(3),
        );
        match model {
            WriteModel::Patch {
                expected_revision,
                metadata,
                ..
            } => {
                assert_eq!(expected_revision, 3);
                assert_eq!(metadata.policy_revision, Some(7));
            }
            other => panic!("expected patch, got {:?}", other.kind()),
        }

        let model =
            DefaultMapper.to_write_model(ChangeMetadata::new("ns:t1", 4), &thing(), &enforcer(), None);
        assert!(matches!(model, WriteModel::Update { .. }));
    }

    #[test]
    fn test_registry_resolves_by_name() {
        let registry = MapperRegistry::with_defaults();
        assert_eq!(registry.resolve("default").unwrap().name(), "default");
        assert!(matches!(
            registry.resolve("fancy"),
            Err(IndexingError::UnknownMapper(_))
        ));
        assert_eq!(registry.names(), vec!["default"]);
    }
}
