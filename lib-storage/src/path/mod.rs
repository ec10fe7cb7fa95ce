//! Lexical path interface
//!
//! A naming discipline over the storage engine: dotted chains of
//! segments join with `:` into flat base keys. Writing a map fans out
//! into one record per leaf field plus a container record announcing the
//! fields; reading reassembles the nested shape. No merge semantics of
//! its own.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::engine::{StorageEngine, StoreOptions, UpdateOptions};
use crate::errors::{Result, StorageError};
use crate::types::StorageSpace;

/// Separator between path segments in the flat key space.
const PATH_SEPARATOR: &str = ":";

/// Suffix used by [`PathRef::set`].
const SET_SUFFIX: &str = "_set";

/// A position in the lexical key hierarchy.
#[derive(Clone)]
pub struct PathRef {
    engine: Arc<StorageEngine>,
    segments: Vec<String>,
}

impl StorageEngine {
    /// Entry point of the lexical path interface.
    pub fn root(self: &Arc<Self>) -> PathRef {
        PathRef {
            engine: Arc::clone(self),
            segments: Vec::new(),
        }
    }
}

impl PathRef {
    /// Descend one segment.
    pub fn get(&self, segment: &str) -> PathRef {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        PathRef {
            engine: Arc::clone(&self.engine),
            segments,
        }
    }

    /// The flat base key this path addresses.
    pub fn get_path(&self) -> String {
        self.segments.join(PATH_SEPARATOR)
    }

    fn child_key(&self, field: &str) -> String {
        format!("{}{}{}", self.get_path(), PATH_SEPARATOR, field)
    }

    /// Write a value at this path. Maps fan out into one record per leaf
    /// field plus a container record; scalars write a single record.
    pub async fn put(&self, value: Value) -> Result<()> {
        if self.segments.is_empty() {
            return Err(StorageError::Internal(anyhow::anyhow!(
                "cannot put at the path root"
            )));
        }
        let key = self.get_path();
        match value {
            Value::Object(fields) => {
                let names: Vec<String> = fields.keys().cloned().collect();
                for (field, field_value) in fields {
                    self.write(&self.child_key(&field), field_value).await?;
                }
                let container = json!({ "container": true, "fields": names });
                self.write(&key, container).await
            }
            other => self.write(&key, other).await,
        }
    }

    /// Read the value at this path, reassembling container records into
    /// nested maps.
    pub async fn val(&self) -> Result<Option<Value>> {
        let key = self.get_path();
        let Some(value) = self.engine.retrieve(&key, false).await? else {
            return Ok(None);
        };

        let is_container = value
            .get("container")
            .and_then(|c| c.as_bool())
            .unwrap_or(false);
        if !is_container {
            return Ok(Some(value));
        }

        let fields: Vec<String> = value
            .get("fields")
            .and_then(|f| f.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut assembled = serde_json::Map::new();
        for field in fields {
            if let Some(field_value) = self.engine.retrieve(&self.child_key(&field), false).await? {
                assembled.insert(field, field_value);
            }
        }
        Ok(Some(Value::Object(assembled)))
    }

    /// Write a map under the `_set` suffix of this path.
    pub async fn set(&self, map: Value) -> Result<()> {
        let key = self.child_key(SET_SUFFIX);
        self.write(&key, map).await
    }

    /// Field names announced by this path's container record, or the
    /// locally known child keys when no container exists.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let key = self.get_path();
        if let Some(value) = self.engine.retrieve(&key, false).await? {
            if let Some(fields) = value.get("fields").and_then(|f| f.as_array()) {
                return Ok(fields
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect());
            }
        }
        let prefix = format!("{}{}", key, PATH_SEPARATOR);
        let children = self.engine.list_keys(&prefix).await?;
        Ok(children
            .into_iter()
            .filter_map(|k| {
                k.strip_prefix(&prefix)
                    .filter(|rest| !rest.contains(PATH_SEPARATOR))
                    .map(str::to_string)
            })
            .collect())
    }

    /// Does any record exist at this path?
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.engine.retrieve(&self.get_path(), false).await?.is_some())
    }

    /// Store-or-update so repeated puts on one path don't trip the
    /// ownership check for creates.
    async fn write(&self, key: &str, value: Value) -> Result<()> {
        match self
            .engine
            .store(key, value.clone(), StoreOptions::in_space(StorageSpace::Public))
            .await
        {
            Ok(()) => Ok(()),
            Err(StorageError::AccessDenied(_)) => {
                self.engine.update(key, value, UpdateOptions::default()).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_join_with_colon() {
        // Path assembly is pure; engine construction is exercised by the
        // integration suites.
        let segments = ["users", "alice", "profile"];
        assert_eq!(segments.join(PATH_SEPARATOR), "users:alice:profile");
    }
}
