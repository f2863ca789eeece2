//! An in-memory [`KvClient`] with the same conditional semantics as the real store,
//! for fast, deterministic scenario and property tests that need no network
//! or credentials.

use super::{Condition, DocumentKey, KvClient, UpdateOp, UpdateRequest};
use crate::error::KvError;
use crate::model::StreamState;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeKvClient {
    documents: Mutex<HashMap<DocumentKey, Value>>,
}

impl FakeKvClient {
    pub fn new() -> FakeKvClient {
        FakeKvClient::default()
    }

    /// Test helper: seed a document directly, bypassing `put`'s conditions.
    pub fn seed(&self, key: DocumentKey, state: &StreamState) {
        let value = serde_json::to_value(state).expect("StreamState always serializes");
        self.documents.lock().unwrap().insert(key, value);
    }
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path_segments(path) {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

fn set_path(root: &mut Value, path: &str, value: Value) {
    let segs = path_segments(path);
    let mut cur = root;
    for seg in &segs[..segs.len() - 1] {
        if !cur.as_object().map_or(false, |o| o.contains_key(*seg)) {
            cur.as_object_mut()
                .expect("intermediate path segments are always objects")
                .insert(seg.to_string(), Value::Object(Default::default()));
        }
        cur = cur
            .as_object_mut()
            .expect("intermediate path segments are always objects")
            .get_mut(*seg)
            .unwrap();
    }
    cur.as_object_mut()
        .expect("parent of a set path must be an object")
        .insert(segs[segs.len() - 1].to_string(), value);
}

fn remove_path(root: &mut Value, path: &str) {
    let segs = path_segments(path);
    let mut cur = root;
    for seg in &segs[..segs.len() - 1] {
        match cur.as_object_mut().and_then(|o| o.get_mut(*seg)) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.remove(segs[segs.len() - 1]);
    }
}

fn eval_condition(doc: Option<&Value>, condition: &Condition) -> bool {
    match condition {
        Condition::AttributeNotExists(path) => {
            doc.and_then(|d| get_path(d, path)).is_none()
        }
        Condition::AttributeExists(path) => doc.and_then(|d| get_path(d, path)).is_some(),
        Condition::FieldEquals(path, expected) => {
            let actual = doc.and_then(|d| get_path(d, path));
            match actual {
                Some(value) => value == expected,
                None => expected.is_null(),
            }
        }
        Condition::And(parts) => parts.iter().all(|c| eval_condition(doc, c)),
    }
}

#[async_trait]
impl KvClient for FakeKvClient {
    async fn get(&self, key: &DocumentKey) -> Result<Option<StreamState>, KvError> {
        let documents = self.documents.lock().unwrap();
        match documents.get(key) {
            Some(value) => {
                let state = serde_json::from_value(value.clone())
                    .map_err(|e| KvError::terminal(e))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &DocumentKey,
        item: &StreamState,
        condition: Option<Condition>,
    ) -> Result<(), KvError> {
        let mut documents = self.documents.lock().unwrap();
        let existing = documents.get(key);
        if let Some(condition) = &condition {
            if !eval_condition(existing, condition) {
                return Err(KvError::ConditionalCheckFailed);
            }
        }
        let value = serde_json::to_value(item).map_err(|e| KvError::terminal(e))?;
        documents.insert(key.clone(), value);
        Ok(())
    }

    async fn update(&self, key: &DocumentKey, request: UpdateRequest) -> Result<(), KvError> {
        let mut documents = self.documents.lock().unwrap();
        let existing = documents.get(key).cloned();
        if let Some(condition) = &request.condition {
            if !eval_condition(existing.as_ref(), condition) {
                return Err(KvError::ConditionalCheckFailed);
            }
        }
        let mut doc = existing.unwrap_or_else(|| Value::Object(Default::default()));
        for op in &request.ops {
            match op {
                UpdateOp::Set(path, value) => set_path(&mut doc, path, value.clone()),
                UpdateOp::SetIfNotExists(path, value) => {
                    if get_path(&doc, path).is_none() {
                        set_path(&mut doc, path, value.clone());
                    }
                }
                UpdateOp::Remove(path) => remove_path(&mut doc, path),
            }
        }
        documents.insert(key.clone(), doc);
        Ok(())
    }

    async fn delete(&self, key: &DocumentKey) -> Result<(), KvError> {
        self.documents.lock().unwrap().remove(key);
        Ok(())
    }
}
