//! Transaction-scoped access to store collections

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension, Transaction};
use serde_json::Value;

use super::schema::{IndexSpec, StoreSchema};
use crate::error::{Error, Result};

/// Access mode requested for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Shared access; writes are rejected
    ReadOnly,
    /// Exclusive access
    ReadWrite,
}

/// Capability handed to a transaction body.
///
/// Only the collections named when the transaction was opened are reachable,
/// and the handle cannot outlive the transaction.
pub struct StoreTransaction<'a> {
    tx: Transaction<'a>,
    schema: &'a StoreSchema,
    scope: Vec<String>,
    mode: TransactionMode,
}

impl<'a> StoreTransaction<'a> {
    pub(crate) fn new(
        tx: Transaction<'a>,
        schema: &'a StoreSchema,
        scope: Vec<String>,
        mode: TransactionMode,
    ) -> Self {
        Self {
            tx,
            schema,
            scope,
            mode,
        }
    }

    pub(crate) fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub const fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn check_scope(&self, collection: &str) -> Result<()> {
        self.schema.collection(collection)?;
        if self.scope.iter().any(|name| name == collection) {
            Ok(())
        } else {
            Err(Error::Schema(format!(
                "collection '{collection}' is not part of this transaction"
            )))
        }
    }

    fn check_writable(&self, collection: &str) -> Result<()> {
        self.check_scope(collection)?;
        if self.mode == TransactionMode::ReadOnly {
            return Err(Error::Schema(format!(
                "cannot write to '{collection}' in a read-only transaction"
            )));
        }
        Ok(())
    }

    fn index(&self, collection: &str, index: &str) -> Result<IndexSpec> {
        Ok(self.schema.collection(collection)?.index(index)?.clone())
    }

    /// Fetch a document by primary key.
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.check_scope(collection)?;
        let raw: Option<String> = self
            .tx
            .query_row(
                &format!("SELECT data FROM \"{collection}\" WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| parse_document(&raw)).transpose()
    }

    /// Every document in the collection, in primary-key order.
    pub fn get_all(&self, collection: &str) -> Result<Vec<Value>> {
        self.check_scope(collection)?;
        self.query_documents(
            &format!("SELECT data FROM \"{collection}\" ORDER BY id"),
            Vec::new(),
        )
    }

    /// Documents whose index key equals `value`.
    ///
    /// Compound indexes expect `value` to be an array with one element per key.
    pub fn get_by_index(&self, collection: &str, index: &str, value: &Value) -> Result<Vec<Value>> {
        self.check_scope(collection)?;
        let spec = self.index(collection, index)?;
        let keys = index_key_values(&spec, value)?;
        let predicate = spec
            .expressions()
            .iter()
            .enumerate()
            .map(|(position, expr)| format!("{expr} = ?{}", position + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        self.query_documents(
            &format!("SELECT data FROM \"{collection}\" WHERE {predicate} ORDER BY id"),
            keys,
        )
    }

    /// Documents whose index key lies within `[low, high]`.
    pub fn get_by_range(
        &self,
        collection: &str,
        index: &str,
        low: &Value,
        high: &Value,
    ) -> Result<Vec<Value>> {
        self.check_scope(collection)?;
        let spec = self.index(collection, index)?;
        let mut keys = index_key_values(&spec, low)?;
        keys.extend(index_key_values(&spec, high)?);
        let width = spec.key_paths.len();
        let tuple = format!("({})", spec.expressions().join(", "));
        let placeholders = |start: usize| {
            format!(
                "({})",
                (start..start + width)
                    .map(|position| format!("?{position}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        let sql = format!(
            "SELECT data FROM \"{collection}\" WHERE {tuple} >= {} AND {tuple} <= {} ORDER BY {}, id",
            placeholders(1),
            placeholders(width + 1),
            spec.expressions().join(", "),
        );
        self.query_documents(&sql, keys)
    }

    /// Upsert a document; its `id` field is the primary key.
    pub fn put(&mut self, collection: &str, document: &Value) -> Result<String> {
        self.check_writable(collection)?;
        let id = document_id(document)?;
        self.tx.execute(
            &format!(
                "INSERT INTO \"{collection}\" (id, data) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data"
            ),
            params![id, serde_json::to_string(document)?],
        )?;
        Ok(id)
    }

    /// Remove a document. Returns whether it existed.
    pub fn delete(&mut self, collection: &str, id: &str) -> Result<bool> {
        self.check_writable(collection)?;
        let rows = self.tx.execute(
            &format!("DELETE FROM \"{collection}\" WHERE id = ?1"),
            params![id],
        )?;
        Ok(rows > 0)
    }

    /// Remove every document in the collection.
    pub fn clear(&mut self, collection: &str) -> Result<usize> {
        self.check_writable(collection)?;
        Ok(self
            .tx
            .execute(&format!("DELETE FROM \"{collection}\""), [])?)
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        self.check_scope(collection)?;
        let count: i64 = self.tx.query_row(
            &format!("SELECT COUNT(*) FROM \"{collection}\""),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// One page of documents ordered by primary key, or by `index` then key.
    pub(crate) fn page(
        &self,
        collection: &str,
        index: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Value>> {
        self.check_scope(collection)?;
        let order: Vec<String> = match index {
            Some(index) => {
                let mut exprs = self.index(collection, index)?.expressions();
                exprs.push("id".to_string());
                exprs
            }
            None => vec!["id".to_string()],
        };
        let order_list = order.join(", ");
        let mut args: Vec<SqlValue> = Vec::new();
        let mut sql = format!("SELECT data FROM \"{collection}\"");
        if let Some(cursor) = cursor {
            sql.push_str(&format!(
                " WHERE ({order_list}) > (SELECT {order_list} FROM \"{collection}\" WHERE id = ?1)"
            ));
            args.push(SqlValue::Text(cursor.to_string()));
        }
        let limit_position = args.len() + 1;
        sql.push_str(&format!(
            " ORDER BY {order_list} LIMIT ?{limit_position} OFFSET ?{}",
            limit_position + 1
        ));
        args.push(SqlValue::Integer(limit as i64));
        args.push(SqlValue::Integer(if cursor.is_some() { 0 } else { offset as i64 }));
        self.query_documents(&sql, args)
    }

    fn query_documents(&self, sql: &str, args: Vec<SqlValue>) -> Result<Vec<Value>> {
        let mut stmt = self.tx.prepare_cached(sql)?;
        let raw = stmt
            .query_map(params_from_iter(args), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.iter().map(|raw| parse_document(raw)).collect()
    }
}

fn parse_document(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

/// Primary key of a document.
pub(crate) fn document_id(document: &Value) -> Result<String> {
    document
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| Error::ValidationFailed("document is missing a string 'id' field".into()))
}

fn index_key_values(spec: &IndexSpec, value: &Value) -> Result<Vec<SqlValue>> {
    if spec.is_compound() {
        match value {
            Value::Array(parts) if parts.len() == spec.key_paths.len() => {
                Ok(parts.iter().map(to_sql_value).collect())
            }
            _ => Err(Error::Schema(format!(
                "index '{}' expects an array of {} key values",
                spec.name,
                spec.key_paths.len()
            ))),
        }
    } else {
        Ok(vec![to_sql_value(value)])
    }
}

/// Map a JSON scalar to what `json_extract` yields for it.
pub(crate) fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number.as_i64().map_or_else(
            || SqlValue::Real(number.as_f64().unwrap_or_default()),
            SqlValue::Integer,
        ),
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn booleans_match_json_extract_integers() {
        assert_eq!(to_sql_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(to_sql_value(&json!(false)), SqlValue::Integer(0));
        assert_eq!(to_sql_value(&json!(1.5)), SqlValue::Real(1.5));
    }

    #[test]
    fn document_id_requires_string_id() {
        assert_eq!(document_id(&json!({ "id": "a" })).unwrap(), "a");
        assert!(document_id(&json!({ "id": 3 })).is_err());
        assert!(document_id(&json!({})).is_err());
    }
}
