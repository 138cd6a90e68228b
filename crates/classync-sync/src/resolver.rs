//! Natural key → surrogate id resolution with on-demand row creation.

use std::collections::{BTreeSet, HashMap};

use classync_core::{EntityId, EntitySpec, NaturalKey};
use classync_storage::{EntityStore, NewEntity};
use tracing::{debug, info};

use crate::hooks::NewEntityHook;
use crate::SyncError;

/// Resolves one entity kind for one run, then gets dropped.
///
/// Keys are collected with [`add`](Self::add) and looked up together by
/// [`resolve_pending`](Self::resolve_pending), so the number of queries
/// follows the number of distinct keys rather than the number of records.
/// Keys missing from storage are inserted through the entity's hook and
/// fetched again.
pub struct EntityResolver<'a> {
    spec: EntitySpec,
    store: &'a dyn EntityStore,
    hook: &'a dyn NewEntityHook,
    resolved: HashMap<NaturalKey, EntityId>,
    pending: BTreeSet<NaturalKey>,
    created: usize,
}

impl<'a> EntityResolver<'a> {
    pub fn new(spec: EntitySpec, store: &'a dyn EntityStore, hook: &'a dyn NewEntityHook) -> Self {
        Self {
            spec,
            store,
            hook,
            resolved: HashMap::new(),
            pending: BTreeSet::new(),
            created: 0,
        }
    }

    pub fn spec(&self) -> &EntitySpec {
        &self.spec
    }

    /// Queue a key. Already resolved or queued keys are ignored.
    pub fn add(&mut self, key: NaturalKey) -> Result<(), SyncError> {
        if !key.conforms_to(&self.spec) {
            return Err(SyncError::KeyShape {
                entity: self.spec.name,
                key: key.to_string(),
            });
        }
        if !self.resolved.contains_key(&key) {
            self.pending.insert(key);
        }
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Rows inserted by this resolver so far.
    pub fn created(&self) -> usize {
        self.created
    }

    pub fn resolved(&self) -> &HashMap<NaturalKey, EntityId> {
        &self.resolved
    }

    pub async fn resolve_pending(&mut self) -> Result<(), SyncError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let keys: Vec<NaturalKey> = self.pending.iter().cloned().collect();
        let found = self.store.find_ids(&self.spec, &keys).await?;
        let found_count = found.len();
        self.resolved.extend(found);

        let missing: Vec<NaturalKey> = keys
            .into_iter()
            .filter(|key| !self.resolved.contains_key(key))
            .collect();

        if !missing.is_empty() {
            let rows: Vec<NewEntity> = missing.iter().map(|key| self.hook.prepare(key)).collect();
            let inserted = self.store.insert_entities(&self.spec, &rows).await?;
            self.created += inserted as usize;
            debug!(entity = self.spec.name, inserted, "created missing rows");

            let refetched = self.store.find_ids(&self.spec, &missing).await?;
            self.resolved.extend(refetched);
            let still_missing: Vec<&NaturalKey> = missing
                .iter()
                .filter(|key| !self.resolved.contains_key(*key))
                .collect();
            if let Some(first) = still_missing.first() {
                return Err(SyncError::Unresolved {
                    entity: self.spec.name,
                    count: still_missing.len(),
                    first: first.to_string(),
                });
            }
        }

        info!(
            entity = self.spec.name,
            pending = self.pending.len(),
            found = found_count,
            created = missing.len(),
            "resolved natural keys"
        );
        self.pending.clear();
        Ok(())
    }

    /// Id for `key`, resolving first if the key is still queued; `default`
    /// when the key was never added.
    pub async fn get_or_map_id(
        &mut self,
        key: &NaturalKey,
        default: Option<EntityId>,
    ) -> Result<Option<EntityId>, SyncError> {
        if let Some(id) = self.resolved.get(key) {
            return Ok(Some(*id));
        }
        if self.pending.contains(key) {
            self.resolve_pending().await?;
            return Ok(self.resolved.get(key).copied());
        }
        Ok(default)
    }

    /// Like [`get_or_map_id`](Self::get_or_map_id) but an unknown key is an error.
    pub async fn id_for(&mut self, key: &NaturalKey) -> Result<EntityId, SyncError> {
        self.get_or_map_id(key, None)
            .await?
            .ok_or_else(|| SyncError::UnknownKey {
                entity: self.spec.name,
                key: key.to_string(),
            })
    }
}
