use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{DeleteOptions, ResourceStore, StoreObject, WorkloadEvent};
use crate::error::{Error, Result};

type ObjectKey = (String, String, String);

type Interleaved = Box<dyn FnOnce(&mut Value) + Send + Sync>;

/// Store operations that can have failures injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Replace,
    ReplaceStatus,
    Delete,
}

/// A successful write, in the order the store applied it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub verb: Verb,
    pub kind: String,
    pub name: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    version: u64,
    failures: HashMap<(Verb, String, String), u32>,
    interleaved: HashMap<ObjectKey, Vec<Interleaved>>,
    operations: Vec<Operation>,
    events: Vec<(ObjectReference, WorkloadEvent)>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn take_failure(&mut self, verb: Verb, key: &ObjectKey) -> Result<()> {
        let lookup = (verb, key.0.clone(), key.2.clone());
        if let Some(remaining) = self.failures.get_mut(&lookup) {
            *remaining -= 1;
            if *remaining == 0 {
                self.failures.remove(&lookup);
            }
            return Err(Error::Store(format!(
                "injected {:?} failure for {} {}",
                verb, key.0, key.2
            )));
        }
        Ok(())
    }

    /// Runs writes queued by another party ahead of ours, moving the version on.
    fn run_interleaved(&mut self, key: &ObjectKey) {
        let Some(queued) = self.interleaved.remove(key) else {
            return;
        };
        let version = self.next_version();
        if let Some(stored) = self.objects.get_mut(key) {
            for write in queued {
                write(&mut *stored);
            }
            set_meta(stored, "resourceVersion", Value::String(version));
        }
    }

    fn record(&mut self, verb: Verb, key: &ObjectKey) {
        self.operations.push(Operation {
            verb,
            kind: key.0.clone(),
            name: key.2.clone(),
        });
    }
}

/// In-memory store with the write semantics of the API server that the
/// controllers rely on: version-guarded updates, finalizer-blocked deletion and
/// optional graceful termination.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    graceful: bool,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn meta_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get("metadata").and_then(|m| m.get(field)).and_then(Value::as_str)
}

fn set_meta(value: &mut Value, field: &str, field_value: Value) {
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert(field.to_string(), field_value);
    }
}

fn has_finalizers(value: &Value) -> bool {
    value
        .get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .map(|f| !f.is_empty())
        .unwrap_or(false)
}

fn key_of<K: StoreObject>(namespace: Option<&str>, name: &str) -> ObjectKey {
    (
        K::kind_name(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn object_key<K: StoreObject>(obj: &K) -> Result<ObjectKey> {
    let meta = obj.meta();
    let name = meta
        .name
        .as_deref()
        .ok_or(Error::MissingField("metadata.name"))?;
    Ok(key_of::<K>(meta.namespace.as_deref(), name))
}

impl MemoryStore {
    /// Deletions without finalizers take effect immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletions with a non-zero grace period only mark the object as
    /// terminating until [`MemoryStore::complete_terminations`] runs.
    pub fn graceful() -> Self {
        Self {
            state: Arc::default(),
            graceful: true,
        }
    }

    /// Stores `obj` as-is apart from server-assigned metadata, replacing any
    /// existing object of the same name.
    pub async fn insert<K: StoreObject>(&self, obj: K) -> Result<K> {
        let key = object_key(&obj)?;
        let mut value = serde_json::to_value(&obj)?;
        let mut state = self.state.write().await;
        let version = state.next_version();
        set_meta(&mut value, "resourceVersion", Value::String(version.clone()));
        if meta_str(&value, "creationTimestamp").is_none() {
            set_meta(&mut value, "creationTimestamp", Value::String(now()));
        }
        if meta_str(&value, "uid").is_none() {
            set_meta(&mut value, "uid", Value::String(format!("uid-{}", version)));
        }
        state.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Applies `f` to the stored object without any version guard, the way a
    /// kubelet or another controller would.
    pub async fn mutate<K, F>(&self, namespace: Option<&str>, name: &str, f: F) -> Result<K>
    where
        K: StoreObject,
        F: FnOnce(&mut K),
    {
        let key = key_of::<K>(namespace, name);
        let mut state = self.state.write().await;
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(K::kind_name(), name))?;
        let mut obj: K = serde_json::from_value(stored)?;
        f(&mut obj);
        let mut value = serde_json::to_value(&obj)?;
        let version = state.next_version();
        set_meta(&mut value, "resourceVersion", Value::String(version));
        state.objects.insert(key, value);
        Ok(obj)
    }

    /// Queues `f` to run against the stored object right before the next
    /// write to it, as if another writer got there first.
    pub async fn interleave<K, F>(&self, namespace: Option<&str>, name: &str, f: F)
    where
        K: StoreObject,
        F: FnOnce(&mut K) + Send + Sync + 'static,
    {
        let key = key_of::<K>(namespace, name);
        let write: Interleaved = Box::new(move |value: &mut Value| {
            if let Ok(mut obj) = serde_json::from_value::<K>(value.clone()) {
                f(&mut obj);
                if let Ok(updated) = serde_json::to_value(&obj) {
                    *value = updated;
                }
            }
        });
        self.state
            .write()
            .await
            .interleaved
            .entry(key)
            .or_default()
            .push(write);
    }

    /// Makes the next `times` calls of `verb` against the named object fail.
    pub async fn fail_next(&self, verb: Verb, kind: &str, name: &str, times: u32) {
        if times == 0 {
            return;
        }
        self.state
            .write()
            .await
            .failures
            .insert((verb, kind.to_string(), name.to_string()), times);
    }

    /// Finishes graceful termination of every terminating `K` without finalizers.
    pub async fn complete_terminations<K: StoreObject>(&self) -> usize {
        let kind = K::kind_name();
        let mut state = self.state.write().await;
        let before = state.objects.len();
        state.objects.retain(|key, value| {
            key.0 != kind || meta_str(value, "deletionTimestamp").is_none() || has_finalizers(value)
        });
        before - state.objects.len()
    }

    pub async fn list<K: StoreObject>(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let kind = K::kind_name();
        let namespace = namespace.unwrap_or_default();
        let state = self.state.read().await;
        state
            .objects
            .iter()
            .filter(|(key, _)| key.0 == kind && key.1 == namespace)
            .map(|(_, value)| Ok(serde_json::from_value(value.clone())?))
            .collect()
    }

    pub async fn operations(&self) -> Vec<Operation> {
        self.state.read().await.operations.clone()
    }

    pub async fn events(&self) -> Vec<WorkloadEvent> {
        self.state
            .read()
            .await
            .events
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    async fn write_guarded<K: StoreObject>(
        &self,
        obj: &K,
        verb: Verb,
        merge: fn(&mut Value, Value),
    ) -> Result<K> {
        let key = object_key(obj)?;
        let incoming = serde_json::to_value(obj)?;
        let mut state = self.state.write().await;
        state.take_failure(verb, &key)?;
        state.run_interleaved(&key);

        let mut stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(K::kind_name(), &key.2))?;
        if let Some(expected) = meta_str(&incoming, "resourceVersion") {
            if meta_str(&stored, "resourceVersion") != Some(expected) {
                return Err(Error::conflict(K::kind_name(), &key.2));
            }
        }

        merge(&mut stored, incoming);
        let version = state.next_version();
        set_meta(&mut stored, "resourceVersion", Value::String(version));

        if meta_str(&stored, "deletionTimestamp").is_some() && !has_finalizers(&stored) {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key.clone(), stored.clone());
        }
        state.record(verb, &key);
        Ok(serde_json::from_value(stored)?)
    }
}

/// Spec and metadata replace; status, creation data and deletion state stay.
fn merge_object(stored: &mut Value, mut incoming: Value) {
    let status = stored.get("status").cloned();
    for field in ["creationTimestamp", "uid", "deletionTimestamp"] {
        match meta_str(stored, field).map(str::to_string) {
            Some(kept) => set_meta(&mut incoming, field, Value::String(kept)),
            None => {
                if let Some(meta) = incoming.get_mut("metadata").and_then(Value::as_object_mut) {
                    meta.remove(field);
                }
            }
        }
    }
    if let Some(obj) = incoming.as_object_mut() {
        match status {
            Some(status) => obj.insert("status".to_string(), status),
            None => obj.remove("status"),
        };
    }
    *stored = incoming;
}

fn merge_status(stored: &mut Value, incoming: Value) {
    if let (Some(obj), Some(status)) = (stored.as_object_mut(), incoming.get("status")) {
        obj.insert("status".to_string(), status.clone());
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let key = key_of::<K>(namespace, name);
        let stored = {
            let mut state = self.state.write().await;
            state.take_failure(Verb::Get, &key)?;
            state.objects.get(&key).cloned()
        };
        match stored {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let key = object_key(obj)?;
        let mut value = serde_json::to_value(obj)?;
        let mut state = self.state.write().await;
        state.take_failure(Verb::Create, &key)?;
        if state.objects.contains_key(&key) {
            return Err(Error::already_exists(K::kind_name(), &key.2));
        }

        let version = state.next_version();
        set_meta(&mut value, "resourceVersion", Value::String(version.clone()));
        set_meta(&mut value, "creationTimestamp", Value::String(now()));
        set_meta(&mut value, "uid", Value::String(format!("uid-{}", version)));
        state.objects.insert(key.clone(), value.clone());
        state.record(Verb::Create, &key);
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K> {
        self.write_guarded(obj, Verb::Replace, merge_object).await
    }

    async fn replace_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        self.write_guarded(obj, Verb::ReplaceStatus, merge_status)
            .await
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<()> {
        let key = key_of::<K>(namespace, name);
        let mut state = self.state.write().await;
        state.take_failure(Verb::Delete, &key)?;
        let Some(stored) = state.objects.get_mut(&key) else {
            return Err(Error::not_found(K::kind_name(), name));
        };

        let blocked = has_finalizers(stored) || (self.graceful && !options.is_force());
        if blocked {
            if meta_str(stored, "deletionTimestamp").is_none() {
                set_meta(stored, "deletionTimestamp", Value::String(now()));
            }
        } else {
            state.objects.remove(&key);
        }
        state.record(Verb::Delete, &key);
        Ok(())
    }

    async fn publish_event(
        &self,
        regarding: &ObjectReference,
        event: WorkloadEvent,
    ) -> Result<()> {
        self.state
            .write()
            .await
            .events
            .push((regarding.clone(), event));
        Ok(())
    }
}
