//! Generic CRUD over tagged models, layered on the immutable manifest store.
//!
//! Updates never modify a manifest in place: the new version is written as a
//! fresh manifest carrying the same stable-id label and the previous one is
//! deleted in the same write session. If the session fails, neither change
//! becomes visible and the previous manifest stays the current one.

use super::{BaseModel, Model, ModelType, StableId, STABLE_ID_KEY};
use crate::store::{
    atomic_write_session, ContentStore, EntryMetadata, Labels, ManifestId, StoredManifest,
    WriteSession, TYPE_LABEL_KEY,
};
use crate::utils::errors::{CoreError, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RESERVED_KEYS: [&str; 2] = [STABLE_ID_KEY, TYPE_LABEL_KEY];

#[derive(Clone)]
pub struct ModelStore {
    store: Arc<dyn ContentStore>,
}

impl ModelStore {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    pub fn content_store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Store a new model. Assigns both ids and writes them back into `m`. A
    /// stable id already set on `m` is kept if no other model holds it.
    pub async fn put<M: Model>(
        &self,
        cancel: &CancellationToken,
        model_type: ModelType,
        m: &mut M,
    ) -> Result<()> {
        validate_model_type(model_type)?;
        check_reserved_tags(&m.base().tags)?;

        // Operations pre-declare the id their events carry; anything else gets
        // a fresh one.
        let stable_id = if m.base().stable_id.is_empty() {
            StableId::generate()
        } else {
            let declared = m.base().stable_id.clone();
            if self.metadata_for_stable_id(cancel, &declared).await?.is_some() {
                return Err(CoreError::Validation(format!(
                    "stable id {declared} is already in use"
                )));
            }
            declared
        };
        let previous = std::mem::replace(&mut m.base_mut().stable_id, stable_id);

        let staged = {
            let model: &M = m;
            atomic_write_session(self.store.as_ref(), cancel, "ModelStorePut", |w| {
                stage_put(w, model_type, model)
            })
            .await
        };

        match staged {
            Ok(id) => {
                m.base_mut().model_store_id = id;
                debug!(model_type = %model_type, stable_id = %m.base().stable_id, "Stored model");
                Ok(())
            }
            Err(e) => {
                m.base_mut().stable_id = previous;
                Err(e)
            }
        }
    }

    /// Replace the stored version of `m`. Both ids must already be set and
    /// `model_type` must match the type the model was first stored with.
    pub async fn update<M: Model>(
        &self,
        cancel: &CancellationToken,
        model_type: ModelType,
        m: &mut M,
    ) -> Result<()> {
        validate_model_type(model_type)?;

        let base = m.base();
        check_reserved_tags(&base.tags)?;

        if base.stable_id.is_empty() {
            return Err(CoreError::Validation("update requires a stable id".into()));
        }
        if base.model_store_id.is_empty() {
            return Err(CoreError::Validation("update requires a model store id".into()));
        }

        let old_id = base.model_store_id.clone();
        let prev = self
            .store
            .get_manifest(cancel, &old_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("model {old_id}")))?;

        check_type(&prev.metadata, model_type)?;

        let prev_stable = prev.metadata.labels.get(STABLE_ID_KEY).map(String::as_str);
        if prev_stable != Some(base.stable_id.as_str()) {
            return Err(CoreError::IdentityMismatch(format!(
                "model {old_id} does not hold stable id {}",
                base.stable_id
            )));
        }

        // Concurrent updates of one stable id are not serialized here; the
        // store's session atomicity is the only guarantee.
        let new_id = {
            let model: &M = m;
            atomic_write_session(self.store.as_ref(), cancel, "ModelStoreUpdate", |w| {
                let new_id = stage_put(w, model_type, model)?;
                w.delete_manifest(old_id.clone());
                Ok(new_id)
            })
            .await?
        };

        debug!(model_type = %model_type, old = %old_id, new = %new_id, "Updated model");
        m.base_mut().model_store_id = new_id;

        Ok(())
    }

    pub async fn get<M: Model>(
        &self,
        cancel: &CancellationToken,
        model_type: ModelType,
        id: &StableId,
    ) -> Result<M> {
        validate_model_type(model_type)?;

        if id.is_empty() {
            return Err(CoreError::Validation("missing stable id".into()));
        }

        let meta = self.metadata_for_stable_id(cancel, id).await?;
        let Some(meta) = meta else {
            return Err(CoreError::NotFound(format!("{model_type} {id}")));
        };

        self.get_with_model_store_id(cancel, model_type, &meta.id).await
    }

    pub async fn get_with_model_store_id<M: Model>(
        &self,
        cancel: &CancellationToken,
        model_type: ModelType,
        id: &ManifestId,
    ) -> Result<M> {
        validate_model_type(model_type)?;

        if id.is_empty() {
            return Err(CoreError::Validation("missing model store id".into()));
        }

        let manifest = self
            .store
            .get_manifest(cancel, id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("{model_type} with model store id {id}")))?;

        check_type(&manifest.metadata, model_type)?;

        decode(manifest)
    }

    /// Identities and tags of every model of `model_type` whose tags contain
    /// `tags`.
    pub async fn get_ids_for_type(
        &self,
        cancel: &CancellationToken,
        model_type: ModelType,
        tags: &Labels,
    ) -> Result<Vec<BaseModel>> {
        validate_model_type(model_type)?;
        check_reserved_tags(tags)?;

        let mut filter = tags.clone();
        filter.insert(TYPE_LABEL_KEY.to_string(), model_type.as_str().to_string());

        let metas = self.store.find_manifests(cancel, &filter).await?;

        Ok(metas.into_iter().map(base_from_metadata).collect())
    }

    /// Delete by stable id. Unknown ids are a no-op.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        model_type: ModelType,
        id: &StableId,
    ) -> Result<()> {
        validate_model_type(model_type)?;

        if id.is_empty() {
            return Err(CoreError::Validation("missing stable id".into()));
        }

        let Some(meta) = self.metadata_for_stable_id(cancel, id).await? else {
            return Ok(());
        };

        check_type(&meta, model_type)?;

        self.delete_with_model_store_id(cancel, &meta.id).await
    }

    /// Delete by physical id. Unknown ids are a no-op.
    pub async fn delete_with_model_store_id(
        &self,
        cancel: &CancellationToken,
        id: &ManifestId,
    ) -> Result<()> {
        if id.is_empty() {
            return Err(CoreError::Validation("missing model store id".into()));
        }

        if self.store.get_manifest(cancel, id).await?.is_none() {
            return Ok(());
        }

        atomic_write_session(self.store.as_ref(), cancel, "ModelStoreDelete", |w| {
            w.delete_manifest(id.clone());
            Ok(())
        })
        .await
    }

    async fn metadata_for_stable_id(
        &self,
        cancel: &CancellationToken,
        id: &StableId,
    ) -> Result<Option<EntryMetadata>> {
        let mut filter = Labels::new();
        filter.insert(STABLE_ID_KEY.to_string(), id.as_str().to_string());

        let mut metas = self.store.find_manifests(cancel, &filter).await?;

        match metas.len() {
            0 => Ok(None),
            1 => Ok(metas.pop()),
            n => Err(CoreError::Store(format!(
                "{n} models share stable id {id}"
            ))),
        }
    }
}

fn validate_model_type(model_type: ModelType) -> Result<()> {
    if !model_type.is_known() {
        return Err(CoreError::UnknownModelType(model_type.to_string()));
    }
    Ok(())
}

fn check_reserved_tags(tags: &Labels) -> Result<()> {
    for key in RESERVED_KEYS {
        if tags.contains_key(key) {
            return Err(CoreError::ReservedTag(key.to_string()));
        }
    }
    Ok(())
}

fn check_type(meta: &EntryMetadata, model_type: ModelType) -> Result<()> {
    let found = meta.labels.get(TYPE_LABEL_KEY).map(String::as_str).unwrap_or("");
    if found != model_type.as_str() {
        return Err(CoreError::TypeMismatch {
            expected: model_type.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

/// Stage `m` as a new manifest. The model itself is not modified.
fn stage_put<M: Model>(w: &mut WriteSession, model_type: ModelType, m: &M) -> Result<ManifestId> {
    let base = m.base();

    let mut labels = base.tags.clone();
    labels.insert(TYPE_LABEL_KEY.to_string(), model_type.as_str().to_string());
    labels.insert(STABLE_ID_KEY.to_string(), base.stable_id.as_str().to_string());

    let content = serde_json::to_value(m)?;

    Ok(w.put_manifest(labels, content))
}

fn base_from_metadata(meta: EntryMetadata) -> BaseModel {
    let mut tags = meta.labels;
    let stable_id = tags.remove(STABLE_ID_KEY).unwrap_or_default();
    tags.remove(TYPE_LABEL_KEY);

    BaseModel {
        stable_id: StableId::new(stable_id),
        model_store_id: meta.id,
        tags,
        model_version: 0,
    }
}

fn decode<M: Model>(manifest: StoredManifest) -> Result<M> {
    let mut m: M = serde_json::from_value(manifest.content)?;
    let identity = base_from_metadata(manifest.metadata);

    let base = m.base_mut();
    base.stable_id = identity.stable_id;
    base.model_store_id = identity.model_store_id;
    base.tags = identity.tags;

    Ok(m)
}
