//! Collection and index declarations for the local store

use std::collections::BTreeMap;

use crate::error::{Error, Result};

pub const HABITS: &str = "habits";
pub const HABIT_ENTRIES: &str = "habitEntries";
pub const SYNC_QUEUE: &str = "syncQueue";
pub const CONFLICTS: &str = "conflicts";
pub const METADATA: &str = "metadata";

/// Secondary index over one or more top-level document fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub key_paths: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    /// Single-field index named after its field.
    pub fn field(key_path: &str) -> Self {
        Self {
            name: key_path.to_string(),
            key_paths: vec![key_path.to_string()],
            unique: false,
        }
    }

    /// Compound index over several fields, compared as a tuple.
    pub fn compound(name: &str, key_paths: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            key_paths: key_paths.iter().map(ToString::to_string).collect(),
            unique: false,
        }
    }

    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub const fn is_compound(&self) -> bool {
        self.key_paths.len() > 1
    }

    /// SQL expressions extracting the indexed fields, in key order.
    pub(crate) fn expressions(&self) -> Vec<String> {
        self.key_paths
            .iter()
            .map(|path| format!("json_extract(data, '$.{path}')"))
            .collect()
    }

    pub(crate) fn sql_name(&self, collection: &str) -> String {
        format!("idx_{collection}_{}", self.name)
    }
}

/// A named collection of JSON documents and its declared indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub name: String,
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            indexes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, name: &str) -> Result<&IndexSpec> {
        self.indexes
            .iter()
            .find(|index| index.name == name)
            .ok_or_else(|| {
                Error::Schema(format!(
                    "collection '{}' has no index named '{name}'",
                    self.name
                ))
            })
    }
}

/// Full set of collections the store is opened with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSchema {
    collections: BTreeMap<String, CollectionSchema>,
}

impl StoreSchema {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    pub fn collection(&self, name: &str) -> Result<&CollectionSchema> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::Schema(format!("unknown collection '{name}'")))
    }

    pub fn collections(&self) -> impl Iterator<Item = &CollectionSchema> {
        self.collections.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    /// Reject identifiers that cannot be embedded in SQL verbatim.
    pub(crate) fn validate(&self) -> Result<()> {
        for collection in self.collections.values() {
            check_identifier(&collection.name)?;
            for index in &collection.indexes {
                check_identifier(&index.name)?;
                if index.key_paths.is_empty() {
                    return Err(Error::Schema(format!(
                        "index '{}' on '{}' has no key paths",
                        index.name, collection.name
                    )));
                }
                for path in &index.key_paths {
                    check_identifier(path)?;
                }
            }
        }
        Ok(())
    }
}

fn check_identifier(value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !value.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::Schema(format!("invalid identifier '{value}'")))
    }
}

/// Collections and indexes used by the sync engine.
pub fn default_schema() -> StoreSchema {
    StoreSchema::new()
        .with_collection(
            CollectionSchema::new(HABITS)
                .with_index(IndexSpec::field("serverId"))
                .with_index(IndexSpec::field("tempId"))
                .with_index(IndexSpec::field("synced"))
                .with_index(IndexSpec::field("deleted"))
                .with_index(IndexSpec::field("lastModified")),
        )
        .with_collection(
            CollectionSchema::new(HABIT_ENTRIES)
                .with_index(IndexSpec::field("habitId"))
                .with_index(IndexSpec::field("date"))
                .with_index(IndexSpec::field("serverId"))
                .with_index(IndexSpec::field("synced"))
                .with_index(IndexSpec::compound("habitId_date", &["habitId", "date"]).unique()),
        )
        .with_collection(
            CollectionSchema::new(SYNC_QUEUE)
                .with_index(IndexSpec::field("status"))
                .with_index(IndexSpec::field("entityId"))
                .with_index(IndexSpec::field("parentId"))
                .with_index(IndexSpec::field("timestamp")),
        )
        .with_collection(
            CollectionSchema::new(CONFLICTS)
                .with_index(IndexSpec::field("entityId"))
                .with_index(IndexSpec::field("resolved")),
        )
        .with_collection(CollectionSchema::new(METADATA))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schema_is_valid() {
        let schema = default_schema();
        schema.validate().unwrap();
        assert_eq!(schema.names().len(), 5);
        assert!(schema
            .collection(HABIT_ENTRIES)
            .unwrap()
            .index("habitId_date")
            .unwrap()
            .unique);
    }

    #[test]
    fn unknown_collection_and_index_are_schema_errors() {
        let schema = default_schema();
        assert!(matches!(schema.collection("notes"), Err(Error::Schema(_))));
        assert!(matches!(
            schema.collection(HABITS).unwrap().index("color"),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn identifiers_with_sql_characters_are_rejected() {
        let schema = StoreSchema::new().with_collection(CollectionSchema::new("bad\"name"));
        assert!(schema.validate().is_err());
    }
}
