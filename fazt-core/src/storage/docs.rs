//! Document store
//!
//! A Mongo-style subset over JSON rows. Filters support `$eq $ne $gt $gte
//! $lt $lte $in $nin` per field plus `$and`/`$or` combinators; update
//! patches support `$set $inc $push`. Candidate rows are fetched by the
//! (app_id, collection, user_id) index and evaluated in process, which is
//! the right trade at personal-platform row counts.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{Scope, Storage};
use crate::db::writer::WriteOp;
use crate::error::{Error, Result};

/// Options for `find`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Maximum documents returned
    pub limit: Option<usize>,
    /// Documents skipped
    pub offset: Option<usize>,
    /// (field, ascending) sort key
    pub sort: Option<(String, bool)>,
}

impl FindOptions {
    /// Parse from a JS-side options object `{limit, offset, sort: {f: ±1}}`.
    pub fn from_value(value: &Value) -> Self {
        let mut opts = Self::default();
        opts.limit = value.get("limit").and_then(Value::as_u64).map(|v| v as usize);
        opts.offset = value.get("offset").and_then(Value::as_u64).map(|v| v as usize);
        if let Some(sort) = value.get("sort").and_then(Value::as_object) {
            if let Some((field, dir)) = sort.iter().next() {
                opts.sort = Some((field.clone(), dir.as_i64().unwrap_or(1) >= 0));
            }
        }
        opts
    }
}

impl Storage {
    /// Insert a document; returns it with its `_id` stamped.
    pub async fn ds_insert(
        &self,
        app_id: &str,
        scope: &Scope,
        collection: &str,
        mut doc: Value,
    ) -> Result<Value> {
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| Error::BadRequest("document must be an object".to_string()))?;
        let id = match obj.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                obj.insert("_id".to_string(), json!(id));
                id
            }
        };

        let raw = serde_json::to_string(&doc).map_err(|e| Error::Internal(e.to_string()))?;
        self.check_entry_size(raw.len())?;

        self.queue()
            .submit(vec![WriteOp::DocInsert {
                id,
                app_id: app_id.to_string(),
                user_id: scope.user_key().to_string(),
                collection: collection.to_string(),
                data: raw,
            }])
            .await?;
        Ok(doc)
    }

    /// Find documents matching `filter`.
    pub async fn ds_find(
        &self,
        app_id: &str,
        scope: &Scope,
        collection: &str,
        filter: &Value,
        opts: &FindOptions,
    ) -> Result<Vec<Value>> {
        let filter = sanitize_filter(filter);
        let rows = self.fetch_collection(app_id, scope, collection).await?;

        let mut matched: Vec<Value> = rows
            .into_iter()
            .filter(|doc| matches(&filter, doc))
            .collect();

        if let Some((field, ascending)) = &opts.sort {
            matched.sort_by(|a, b| {
                let ord = compare(lookup(a, field), lookup(b, field));
                if *ascending { ord } else { ord.reverse() }
            });
        }

        let offset = opts.offset.unwrap_or(0);
        let mut out: Vec<Value> = matched.into_iter().skip(offset).collect();
        if let Some(limit) = opts.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Find the first matching document.
    pub async fn ds_find_one(
        &self,
        app_id: &str,
        scope: &Scope,
        collection: &str,
        filter: &Value,
    ) -> Result<Option<Value>> {
        let opts = FindOptions { limit: Some(1), ..Default::default() };
        Ok(self.ds_find(app_id, scope, collection, filter, &opts).await?.pop())
    }

    /// Apply `patch` to every matching document; returns the count modified.
    pub async fn ds_update(
        &self,
        app_id: &str,
        scope: &Scope,
        collection: &str,
        filter: &Value,
        patch: &Value,
    ) -> Result<u64> {
        let filter = sanitize_filter(filter);
        let rows = self.fetch_collection(app_id, scope, collection).await?;

        let mut ops = Vec::new();
        for doc in rows {
            if !matches(&filter, &doc) {
                continue;
            }
            let id = doc
                .get("_id")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Internal("document missing _id".to_string()))?
                .to_string();
            let mut updated = doc.clone();
            apply_patch(&mut updated, patch)?;
            let raw = serde_json::to_string(&updated).map_err(|e| Error::Internal(e.to_string()))?;
            self.check_entry_size(raw.len())?;
            ops.push(WriteOp::DocReplace { id, data: raw });
        }

        let count = ops.len() as u64;
        if !ops.is_empty() {
            self.queue().submit(ops).await?;
        }
        Ok(count)
    }

    /// Delete every matching document; returns the count removed.
    pub async fn ds_delete(
        &self,
        app_id: &str,
        scope: &Scope,
        collection: &str,
        filter: &Value,
    ) -> Result<u64> {
        let filter = sanitize_filter(filter);
        let rows = self.fetch_collection(app_id, scope, collection).await?;

        let ids: Vec<String> = rows
            .iter()
            .filter(|doc| matches(&filter, doc))
            .filter_map(|doc| doc.get("_id").and_then(Value::as_str).map(str::to_string))
            .collect();

        let count = ids.len() as u64;
        if !ids.is_empty() {
            self.queue().submit(vec![WriteOp::DocDelete { ids }]).await?;
        }
        Ok(count)
    }

    async fn fetch_collection(
        &self,
        app_id: &str,
        scope: &Scope,
        collection: &str,
    ) -> Result<Vec<Value>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT data FROM storage_docs \
             WHERE app_id = ? AND user_id = ? AND collection = ? \
             ORDER BY created_at, id",
        )
        .bind(app_id)
        .bind(scope.user_key())
        .bind(collection)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|(raw,)| serde_json::from_str(&raw).map_err(Error::from))
            .collect()
    }
}

/// Strip any caller-supplied `user_id` key: scoping is structural, not
/// filter-driven.
fn sanitize_filter(filter: &Value) -> Value {
    match filter {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if k == "user_id" {
                    continue;
                }
                if k == "$and" || k == "$or" {
                    if let Value::Array(parts) = v {
                        out.insert(
                            k.clone(),
                            Value::Array(parts.iter().map(sanitize_filter).collect()),
                        );
                        continue;
                    }
                }
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Evaluate a filter against a document.
pub fn matches(filter: &Value, doc: &Value) -> bool {
    let Value::Object(map) = filter else {
        return true;
    };
    map.iter().all(|(key, expected)| match key.as_str() {
        "$and" => expected
            .as_array()
            .map(|parts| parts.iter().all(|p| matches(p, doc)))
            .unwrap_or(false),
        "$or" => expected
            .as_array()
            .map(|parts| parts.iter().any(|p| matches(p, doc)))
            .unwrap_or(false),
        field => field_matches(lookup(doc, field), expected),
    })
}

fn field_matches(actual: Option<&Value>, expected: &Value) -> bool {
    if let Value::Object(ops) = expected {
        if ops.keys().any(|k| k.starts_with('$')) {
            return ops.iter().all(|(op, operand)| op_matches(op, actual, operand));
        }
    }
    actual == Some(expected)
}

fn op_matches(op: &str, actual: Option<&Value>, operand: &Value) -> bool {
    use std::cmp::Ordering;
    match op {
        "$eq" => actual == Some(operand),
        "$ne" => actual != Some(operand),
        "$gt" => compare(actual, Some(operand)) == Ordering::Greater && actual.is_some(),
        "$gte" => actual.is_some() && compare(actual, Some(operand)) != Ordering::Less,
        "$lt" => compare(actual, Some(operand)) == Ordering::Less && actual.is_some(),
        "$lte" => actual.is_some() && compare(actual, Some(operand)) != Ordering::Greater,
        "$in" => operand
            .as_array()
            .map(|arr| actual.map(|a| arr.contains(a)).unwrap_or(false))
            .unwrap_or(false),
        "$nin" => operand
            .as_array()
            .map(|arr| actual.map(|a| !arr.contains(a)).unwrap_or(true))
            .unwrap_or(false),
        _ => false,
    }
}

/// Dotted-path lookup.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

/// Total order over JSON scalars: null < numbers < strings < everything else.
fn compare(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Null), Some(Value::Null)) => Ordering::Equal,
        (Some(Value::Null), Some(_)) => Ordering::Less,
        (Some(_), Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(_)), Some(_)) => Ordering::Less,
        (Some(_), Some(Value::Number(_))) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Apply a `$set` / `$inc` / `$push` patch in place.
pub fn apply_patch(doc: &mut Value, patch: &Value) -> Result<()> {
    let Value::Object(ops) = patch else {
        return Err(Error::BadRequest("patch must be an object".to_string()));
    };
    for (op, fields) in ops {
        let Value::Object(fields) = fields else {
            return Err(Error::BadRequest(format!("{op} operand must be an object")));
        };
        for (path, operand) in fields {
            match op.as_str() {
                "$set" => set_path(doc, path, operand.clone()),
                "$inc" => {
                    let current = lookup(doc, path).and_then(Value::as_f64).unwrap_or(0.0);
                    let delta = operand.as_f64().ok_or_else(|| {
                        Error::BadRequest("$inc operand must be numeric".to_string())
                    })?;
                    let next = current + delta;
                    // Keep integers integral where possible.
                    let value = if next.fract() == 0.0 && next.abs() < i64::MAX as f64 {
                        json!(next as i64)
                    } else {
                        json!(next)
                    };
                    set_path(doc, path, value);
                }
                "$push" => {
                    match lookup_mut(doc, path) {
                        Some(Value::Array(arr)) => arr.push(operand.clone()),
                        Some(_) => {
                            return Err(Error::BadRequest(format!("$push target {path} not an array")))
                        }
                        None => set_path(doc, path, json!([operand])),
                    }
                }
                other => {
                    return Err(Error::BadRequest(format!("unsupported update operator {other}")))
                }
            }
        }
    }
    Ok(())
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut cur = doc;
    let segs: Vec<&str> = path.split('.').collect();
    for (i, seg) in segs.iter().enumerate() {
        if !cur.is_object() {
            *cur = json!({});
        }
        let map = cur.as_object_mut().expect("object ensured above");
        if i == segs.len() - 1 {
            map.insert((*seg).to_string(), value);
            return;
        }
        cur = map.entry((*seg).to_string()).or_insert_with(|| json!({}));
    }
}

fn lookup_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut cur = doc;
    for seg in path.split('.') {
        cur = cur.get_mut(seg)?;
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::storage;
    use super::*;

    #[test]
    fn test_matches_equality() {
        let doc = json!({"title": "x", "n": 3});
        assert!(matches(&json!({"title": "x"}), &doc));
        assert!(!matches(&json!({"title": "y"}), &doc));
        assert!(matches(&json!({}), &doc));
    }

    #[test]
    fn test_matches_comparisons() {
        let doc = json!({"n": 5});
        assert!(matches(&json!({"n": {"$gt": 3}}), &doc));
        assert!(matches(&json!({"n": {"$gte": 5}}), &doc));
        assert!(matches(&json!({"n": {"$lt": 10, "$ne": 6}}), &doc));
        assert!(!matches(&json!({"n": {"$lte": 4}}), &doc));
        // Missing fields never satisfy range operators.
        assert!(!matches(&json!({"missing": {"$gt": 0}}), &doc));
    }

    #[test]
    fn test_matches_in_nin() {
        let doc = json!({"tag": "a"});
        assert!(matches(&json!({"tag": {"$in": ["a", "b"]}}), &doc));
        assert!(!matches(&json!({"tag": {"$nin": ["a"]}}), &doc));
        assert!(matches(&json!({"other": {"$nin": ["a"]}}), &doc));
    }

    #[test]
    fn test_matches_combinators() {
        let doc = json!({"a": 1, "b": 2});
        assert!(matches(&json!({"$and": [{"a": 1}, {"b": 2}]}), &doc));
        assert!(matches(&json!({"$or": [{"a": 9}, {"b": 2}]}), &doc));
        assert!(!matches(&json!({"$or": [{"a": 9}, {"b": 9}]}), &doc));
    }

    #[test]
    fn test_matches_dotted_path() {
        let doc = json!({"meta": {"depth": 2}});
        assert!(matches(&json!({"meta.depth": 2}), &doc));
    }

    #[test]
    fn test_sanitize_drops_user_id() {
        let filter = sanitize_filter(&json!({"user_id": "other", "a": 1}));
        assert_eq!(filter, json!({"a": 1}));
        let nested = sanitize_filter(&json!({"$or": [{"user_id": "x"}, {"a": 1}]}));
        assert_eq!(nested, json!({"$or": [{}, {"a": 1}]}));
    }

    #[test]
    fn test_patch_set_inc_push() {
        let mut doc = json!({"n": 1, "tags": ["a"]});
        apply_patch(
            &mut doc,
            &json!({"$set": {"title": "t"}, "$inc": {"n": 2}, "$push": {"tags": "b"}}),
        )
        .unwrap();
        assert_eq!(doc, json!({"n": 3, "tags": ["a", "b"], "title": "t"}));
    }

    #[test]
    fn test_patch_rejects_unknown_op() {
        let mut doc = json!({});
        assert!(apply_patch(&mut doc, &json!({"$unset": {"a": 1}})).is_err());
    }

    #[tokio::test]
    async fn test_insert_find_one_preserves_types() {
        let (_db, st) = storage().await;
        let doc = st
            .ds_insert(
                "app1",
                &Scope::Shared,
                "notes",
                json!({"title": "x", "count": 2, "done": false}),
            )
            .await
            .unwrap();
        let id = doc["_id"].as_str().unwrap().to_string();

        let found = st
            .ds_find_one("app1", &Scope::Shared, "notes", &json!({"_id": id}))
            .await
            .unwrap()
            .expect("found");
        assert_eq!(found, doc);
        assert!(found["count"].is_number());
        assert!(found["done"].is_boolean());
    }

    #[tokio::test]
    async fn test_user_isolation() {
        let (_db, st) = storage().await;
        let alice = Scope::User("fazt_usr_alice0000000".into());
        let bob = Scope::User("fazt_usr_bob000000000".into());

        st.ds_insert("app1", &alice, "notes", json!({"title": "x"})).await.unwrap();

        // B sees nothing, even naming A's user_id in the filter.
        let rows = st
            .ds_find(
                "app1",
                &bob,
                "notes",
                &json!({"user_id": "fazt_usr_alice0000000"}),
                &FindOptions::default(),
            )
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_update_returns_count() {
        let (_db, st) = storage().await;
        for n in 0..3 {
            st.ds_insert("app1", &Scope::Shared, "c", json!({"n": n})).await.unwrap();
        }
        let count = st
            .ds_update(
                "app1",
                &Scope::Shared,
                "c",
                &json!({"n": {"$gte": 1}}),
                &json!({"$set": {"seen": true}}),
            )
            .await
            .unwrap();
        assert_eq!(count, 2);

        let seen = st
            .ds_find("app1", &Scope::Shared, "c", &json!({"seen": true}), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_by_filter() {
        let (_db, st) = storage().await;
        for n in 0..3 {
            st.ds_insert("app1", &Scope::Shared, "c", json!({"n": n})).await.unwrap();
        }
        let removed = st
            .ds_delete("app1", &Scope::Shared, "c", &json!({"n": {"$lt": 2}}))
            .await
            .unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn test_find_sort_limit_offset() {
        let (_db, st) = storage().await;
        for n in [3, 1, 2] {
            st.ds_insert("app1", &Scope::Shared, "c", json!({"n": n})).await.unwrap();
        }
        let opts = FindOptions {
            sort: Some(("n".to_string(), false)),
            limit: Some(2),
            offset: Some(1),
            ..Default::default()
        };
        let rows = st.ds_find("app1", &Scope::Shared, "c", &json!({}), &opts).await.unwrap();
        let ns: Vec<i64> = rows.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 1]);
    }
}
