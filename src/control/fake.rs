//! In-memory object control for tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::{Resource, ResourceExt};

use super::ObjectControl;
use crate::controller::error::{Error, Result};
use crate::crd::TikvCluster;
use crate::resources::labels::selector_matches;

type ErrorFactory = Box<dyn Fn() -> Error + Send + Sync>;

#[derive(Default)]
struct TrackerState {
    requests: usize,
    after: usize,
    error: Option<ErrorFactory>,
}

/// Fails a request once `after` requests have gone through, then resets.
#[derive(Default)]
pub struct RequestTracker {
    state: Mutex<TrackerState>,
}

impl RequestTracker {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_error(&self, error: impl Fn() -> Error + Send + Sync + 'static) -> &Self {
        self.lock().error = Some(Box::new(error));
        self
    }

    pub fn set_after(&self, after: usize) -> &Self {
        self.lock().after = after;
        self
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.requests = 0;
        state.after = 0;
        state.error = None;
    }

    /// Count one request and return the injected error if it is due.
    pub fn check(&self) -> Result<()> {
        let mut state = self.lock();
        if state.requests >= state.after {
            if let Some(factory) = state.error.take() {
                let err = factory();
                state.requests = 0;
                state.after = 0;
                return Err(err);
            }
        }
        state.requests += 1;
        Ok(())
    }
}

/// A write performed against a fake control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    Create(String),
    Update(String),
    Delete(String),
}

struct Store<K> {
    objects: BTreeMap<(String, String), K>,
    writes: Vec<Write>,
    next_uid: u64,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            writes: Vec::new(),
            next_uid: 1,
        }
    }
}

/// In-memory store of one object kind.
pub struct FakeControl<K> {
    store: Mutex<Store<K>>,
    pub get_tracker: RequestTracker,
    pub list_tracker: RequestTracker,
    pub create_tracker: RequestTracker,
    pub update_tracker: RequestTracker,
    pub delete_tracker: RequestTracker,
}

impl<K> Default for FakeControl<K> {
    fn default() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            get_tracker: RequestTracker::default(),
            list_tracker: RequestTracker::default(),
            create_tracker: RequestTracker::default(),
            update_tracker: RequestTracker::default(),
            delete_tracker: RequestTracker::default(),
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn bump_resource_version<K: Resource>(obj: &mut K, previous: Option<&K>) {
    let next = previous
        .and_then(|p| p.meta().resource_version.as_deref())
        .and_then(|rv| rv.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    obj.meta_mut().resource_version = Some(next.to_string());
}

impl<K> FakeControl<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store<K>> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Seed an object without counting a write.
    pub fn insert(&self, mut obj: K) {
        let mut store = self.lock();
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(format!("uid-{}", store.next_uid));
            store.next_uid += 1;
        }
        let key = key_of(&obj);
        let previous = store.objects.get(&key).cloned();
        bump_resource_version(&mut obj, previous.as_ref());
        store.objects.insert(key, obj);
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn objects(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    /// Mutate a stored object in place, as another actor would.
    pub fn modify(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) -> bool {
        let mut store = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let Some(current) = store.objects.get(&key).cloned() else {
            return false;
        };
        let mut updated = current.clone();
        f(&mut updated);
        bump_resource_version(&mut updated, Some(&current));
        store.objects.insert(key, updated);
        true
    }

    /// Remove an object without counting a write.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .remove(&(namespace.to_string(), name.to_string()))
    }

    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn deleted(&self) -> Vec<String> {
        self.writes()
            .into_iter()
            .filter_map(|w| match w {
                Write::Delete(name) => Some(name),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl<K> ObjectControl<K> for FakeControl<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.get_tracker.check()?;
        Ok(self.object(namespace, name))
    }

    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<K>> {
        self.list_tracker.check()?;
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((ns, _), obj)| ns == namespace && selector_matches(selector, obj.labels()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, _tc: &TikvCluster, mut obj: K) -> Result<K> {
        self.create_tracker.check()?;
        let mut store = self.lock();
        let key = key_of(&obj);
        if store.objects.contains_key(&key) {
            return Err(Error::Conflict(format!("{}/{} already exists", key.0, key.1)));
        }
        obj.meta_mut().uid = Some(format!("uid-{}", store.next_uid));
        store.next_uid += 1;
        bump_resource_version(&mut obj, None);
        store.writes.push(Write::Create(key.1.clone()));
        store.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn update(&self, _tc: &TikvCluster, mut obj: K) -> Result<K> {
        self.update_tracker.check()?;
        let mut store = self.lock();
        let key = key_of(&obj);
        let Some(previous) = store.objects.get(&key).cloned() else {
            return Err(Error::Transient(format!("{}/{} not found", key.0, key.1)));
        };
        bump_resource_version(&mut obj, Some(&previous));
        store.writes.push(Write::Update(key.1.clone()));
        store.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn delete(&self, _tc: &TikvCluster, namespace: &str, name: &str) -> Result<()> {
        self.delete_tracker.check()?;
        let mut store = self.lock();
        store
            .objects
            .remove(&(namespace.to_string(), name.to_string()));
        store.writes.push(Write::Delete(name.to_string()));
        Ok(())
    }
}
