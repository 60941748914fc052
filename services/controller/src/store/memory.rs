//! In-memory resource store.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use mlplane_id::ResourceName;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ObjectMeta, ObservedStatus, Resource, ResourceStore, StoreError, StoreResult};

/// In-memory store with optimistic concurrency.
///
/// Besides the status-side operations of [`ResourceStore`], it exposes the
/// owner-side operations a lifecycle controller performs: creating a
/// resource, changing its spec, requesting deletion and adding finalizers.
#[derive(Debug)]
pub struct InMemoryStore<St> {
    objects: RwLock<BTreeMap<ResourceName, Resource<St>>>,
}

impl<St: ObservedStatus> Default for InMemoryStore<St> {
    fn default() -> Self {
        Self::new()
    }
}

impl<St: ObservedStatus> InMemoryStore<St> {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a resource at generation 1 with a default status.
    pub async fn create(&self, name: ResourceName) -> StoreResult<Resource<St>> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }

        let resource = Resource {
            meta: ObjectMeta {
                name: name.clone(),
                generation: 1,
                resource_version: 1,
                deletion_requested: false,
                finalizers: BTreeSet::new(),
            },
            status: St::default(),
        };
        objects.insert(name, resource.clone());
        Ok(resource)
    }

    /// Record a spec change: bumps the generation.
    pub async fn update_spec(&self, name: &ResourceName) -> StoreResult<Resource<St>> {
        self.modify(name, |resource| resource.meta.generation += 1)
            .await?
            .ok_or_else(|| StoreError::NotFound(name.clone()))
    }

    /// Metadata-only write (labels, annotations): bumps the resource version only.
    pub async fn touch(&self, name: &ResourceName) -> StoreResult<Resource<St>> {
        self.modify(name, |_| {})
            .await?
            .ok_or_else(|| StoreError::NotFound(name.clone()))
    }

    pub async fn add_finalizer(&self, name: &ResourceName, finalizer: &str) -> StoreResult<Resource<St>> {
        self.modify(name, |resource| {
            resource.meta.finalizers.insert(finalizer.to_string());
        })
        .await?
        .ok_or_else(|| StoreError::NotFound(name.clone()))
    }

    /// Mark for deletion. Returns `None` if the resource had no finalizers
    /// and was removed immediately.
    pub async fn request_deletion(&self, name: &ResourceName) -> StoreResult<Option<Resource<St>>> {
        self.modify(name, |resource| resource.meta.deletion_requested = true)
            .await
    }

    /// Names of all stored resources.
    pub async fn names(&self) -> Vec<ResourceName> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Apply an unconditional write, then collect the resource if it is
    /// being deleted and holds no finalizers.
    async fn modify<F>(&self, name: &ResourceName, f: F) -> StoreResult<Option<Resource<St>>>
    where
        F: FnOnce(&mut Resource<St>),
    {
        let mut objects = self.objects.write().await;
        let resource = objects
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        f(resource);
        resource.meta.resource_version += 1;
        Ok(Self::collect_if_released(&mut objects, name))
    }

    fn collect_if_released(
        objects: &mut BTreeMap<ResourceName, Resource<St>>,
        name: &ResourceName,
    ) -> Option<Resource<St>> {
        let resource = objects.get(name)?;
        if resource.meta.deletion_requested && resource.meta.finalizers.is_empty() {
            objects.remove(name);
            debug!(resource = %name, "garbage-collected resource");
            return None;
        }
        Some(resource.clone())
    }

    fn check_version(resource: &Resource<St>, expected: u64) -> StoreResult<()> {
        if resource.meta.resource_version != expected {
            return Err(StoreError::Conflict {
                name: resource.meta.name.clone(),
                expected,
                actual: resource.meta.resource_version,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<St: ObservedStatus> ResourceStore<St> for InMemoryStore<St> {
    async fn get(&self, name: &ResourceName) -> StoreResult<Option<Resource<St>>> {
        Ok(self.objects.read().await.get(name).cloned())
    }

    async fn update_status(
        &self,
        name: &ResourceName,
        expected_version: u64,
        status: St,
    ) -> StoreResult<Resource<St>> {
        let mut objects = self.objects.write().await;
        let resource = objects
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        Self::check_version(resource, expected_version)?;

        resource.status = status;
        resource.meta.resource_version += 1;
        Ok(resource.clone())
    }

    async fn remove_finalizer(
        &self,
        name: &ResourceName,
        expected_version: u64,
        finalizer: &str,
    ) -> StoreResult<Option<Resource<St>>> {
        let mut objects = self.objects.write().await;
        let resource = objects
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        Self::check_version(resource, expected_version)?;

        resource.meta.finalizers.remove(finalizer);
        resource.meta.resource_version += 1;
        Ok(Self::collect_if_released(&mut objects, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ServerStatus;

    fn name(s: &str) -> ResourceName {
        ResourceName::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryStore::<ServerStatus>::new();
        let created = store.create(name("mlserver")).await.unwrap();
        assert_eq!(created.meta.generation, 1);
        assert_eq!(created.meta.resource_version, 1);

        let fetched = store.get(&name("mlserver")).await.unwrap().unwrap();
        assert_eq!(fetched, created);

        assert_eq!(
            store.create(name("mlserver")).await.unwrap_err(),
            StoreError::AlreadyExists(name("mlserver"))
        );
    }

    #[tokio::test]
    async fn test_update_status_conflict() {
        let store = InMemoryStore::<ServerStatus>::new();
        store.create(name("s")).await.unwrap();
        store.touch(&name("s")).await.unwrap();

        let err = store
            .update_status(&name("s"), 1, ServerStatus::default())
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let updated = store
            .update_status(
                &name("s"),
                2,
                ServerStatus {
                    available_replicas: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.meta.resource_version, 3);
        assert_eq!(updated.status.available_replicas, 1);
    }

    #[tokio::test]
    async fn test_update_spec_bumps_generation() {
        let store = InMemoryStore::<ServerStatus>::new();
        store.create(name("s")).await.unwrap();
        let updated = store.update_spec(&name("s")).await.unwrap();
        assert_eq!(updated.meta.generation, 2);
        assert_eq!(updated.meta.resource_version, 2);
    }

    #[tokio::test]
    async fn test_deletion_waits_for_finalizers() {
        let store = InMemoryStore::<ServerStatus>::new();
        store.create(name("s")).await.unwrap();
        store.add_finalizer(&name("s"), "f").await.unwrap();

        let marked = store.request_deletion(&name("s")).await.unwrap().unwrap();
        assert!(marked.meta.deletion_requested);

        let gone = store
            .remove_finalizer(&name("s"), marked.meta.resource_version, "f")
            .await
            .unwrap();
        assert!(gone.is_none());
        assert!(store.get(&name("s")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletion_without_finalizers_is_immediate() {
        let store = InMemoryStore::<ServerStatus>::new();
        store.create(name("s")).await.unwrap();
        assert!(store.request_deletion(&name("s")).await.unwrap().is_none());
        assert!(store.names().await.is_empty());
    }
}
