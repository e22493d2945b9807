//! Create-scoped cluster objects with guaranteed release.
//!
//! A `ScopedObject` wraps an object this coordinator created and owes a
//! decision about: either `persist()` it (the object is committed and kept)
//! or `release()` it (deleted explicitly). If the handle is dropped before
//! either call (early return, error, cancelled future), deletion is
//! spawned from `Drop` so no path can leak a half-made object. The restore
//! orchestrator stages restored claims this way to get all-or-nothing
//! semantics.

use std::fmt::Debug;

use kube::Resource;
use kube::api::{Api, DeleteParams};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::error::Result;

/// Handle to an object created by this coordinator that must not outlive
/// its scope unless explicitly persisted.
pub struct ScopedObject<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    api: Api<K>,
    name: String,
    armed: bool,
}

impl<K> ScopedObject<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Adopt an already-created object into the scope.
    pub fn adopt(api: Api<K>, name: &str) -> Self {
        Self {
            api,
            name: name.to_string(),
            armed: true,
        }
    }

    /// Name of the guarded object.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commit: the object is kept and the guard disarmed.
    pub fn persist(mut self) -> String {
        self.armed = false;
        std::mem::take(&mut self.name)
    }

    /// Delete the object now and disarm the guard. Absence is fine: the
    /// goal is that the object is gone.
    pub async fn release(mut self) -> Result<()> {
        self.armed = false;
        match self.api.delete(&self.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<K> Drop for ScopedObject<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let api = self.api.clone();
        let name = std::mem::take(&mut self.name);
        debug!(name = %name, "Scoped object dropped while armed, deleting");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = api.delete(&name, &DeleteParams::default()).await
                    && !matches!(&e, kube::Error::Api(ae) if ae.code == 404)
                {
                    warn!(name = %name, error = %e, "Failed to delete scoped object on drop");
                }
            });
        } else {
            warn!(name = %name, "No runtime available to delete scoped object");
        }
    }
}
