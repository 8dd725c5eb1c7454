//! Process-wide selection models, one complete map per command queue.
//!
//! The first lookup for a queue fills a map with a single baseline variant
//! for every `(operation, dtype)` pair, then imports the model description
//! configured for the queue's device, if any. Later lookups for the same
//! queue reuse that map. Maps are never torn down.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use crate::backend::{CommandQueue, QueueId};
use crate::cache::BuildOnceCache;
use crate::dtype::NumericType;
use crate::env;
use crate::error::{TuneError, TuneResult};
use crate::import::import;
use crate::model::SelectionModel;
use crate::operation::OperationType;
use crate::profiling;
use crate::templates::Variant;

static GLOBAL: OnceLock<ModelRegistry> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    pub operation: OperationType,
    pub dtype: NumericType,
}

impl ModelKey {
    pub const fn new(operation: OperationType, dtype: NumericType) -> Self {
        ModelKey { operation, dtype }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.operation, self.dtype)
    }
}

pub type ModelMap = BTreeMap<ModelKey, Arc<SelectionModel>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ModelFileSource {
    Environment,
    Path(PathBuf),
    Disabled,
}

/// Where a registry looks for the model description of a queue's device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    model_file: ModelFileSource,
}

impl RegistryConfig {
    /// Reads `AUTOKERN_MODEL_DEVICE_<ordinal>` when a map is built. Unset or
    /// blank variables keep the defaults.
    pub fn from_env() -> Self {
        RegistryConfig {
            model_file: ModelFileSource::Environment,
        }
    }

    /// Imports `path` for every queue, whatever its device.
    pub fn with_model_file(path: impl Into<PathBuf>) -> Self {
        RegistryConfig {
            model_file: ModelFileSource::Path(path.into()),
        }
    }

    /// Built-in defaults only.
    pub fn defaults_only() -> Self {
        RegistryConfig {
            model_file: ModelFileSource::Disabled,
        }
    }

    /// Model description to import for the device at `ordinal`.
    pub fn model_file(&self, ordinal: usize) -> Option<PathBuf> {
        match &self.model_file {
            ModelFileSource::Environment => env::model_file_for_device(ordinal),
            ModelFileSource::Path(path) => Some(path.clone()),
            ModelFileSource::Disabled => None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

pub struct ModelRegistry {
    config: RegistryConfig,
    maps: BuildOnceCache<QueueId, ModelMap>,
}

impl ModelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        ModelRegistry {
            config,
            maps: BuildOnceCache::new(),
        }
    }

    /// Registry shared by the whole process, configured from the environment.
    pub fn global() -> &'static ModelRegistry {
        GLOBAL.get_or_init(|| ModelRegistry::new(RegistryConfig::from_env()))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Map for `queue`, built on first use. Concurrent first lookups for the
    /// same queue build it once. A failed build is reported to its caller and
    /// retried by the next lookup.
    pub fn model_map(&self, queue: &Arc<dyn CommandQueue>) -> TuneResult<Arc<ModelMap>> {
        let (map, hit) = self
            .maps
            .get_or_try_build(queue.id(), || self.build(queue))?;
        profiling::cache_event(if hit {
            "autokern.registry.hit"
        } else {
            "autokern.registry.miss"
        });
        Ok(map)
    }

    pub fn model(
        &self,
        queue: &Arc<dyn CommandQueue>,
        operation: OperationType,
        dtype: NumericType,
    ) -> TuneResult<Arc<SelectionModel>> {
        self.model_map(queue)?
            .get(&ModelKey::new(operation, dtype))
            .cloned()
            .ok_or(TuneError::ModelNotFound { operation, dtype })
    }

    /// Whether the map for `queue` has been built.
    pub fn is_built(&self, queue: QueueId) -> bool {
        self.maps.get(&queue).is_some()
    }

    /// Number of queues with a built map.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn build(&self, queue: &Arc<dyn CommandQueue>) -> TuneResult<ModelMap> {
        let mut map = default_models(queue);
        let device = queue.device();
        let model_file = self.config.model_file(device.ordinal());
        if let Some(path) = &model_file {
            let imported = import(path, queue, &mut map)?;
            tracing::debug!(path = %path.display(), imported, "imported model description");
        }
        tracing::info!(
            queue = %queue.id(),
            device = device.name(),
            models = map.len(),
            model_file = ?model_file,
            "built selection model map"
        );
        Ok(map)
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("config", &self.config)
            .field("queues", &self.len())
            .finish()
    }
}

/// One single-variant baseline model per `(operation, dtype)` pair.
pub fn default_models(queue: &Arc<dyn CommandQueue>) -> ModelMap {
    let mut map = ModelMap::new();
    for operation in OperationType::ALL {
        for dtype in NumericType::ALL {
            let model = SelectionModel::single(Variant::default_for(operation), Arc::clone(queue));
            map.insert(ModelKey::new(operation, dtype), Arc::new(model));
        }
    }
    map
}

/// [`ModelRegistry::model_map`] on the process-wide registry.
pub fn get_model_map(queue: &Arc<dyn CommandQueue>) -> TuneResult<Arc<ModelMap>> {
    ModelRegistry::global().model_map(queue)
}

/// [`ModelRegistry::model`] on the process-wide registry.
pub fn get_model(
    queue: &Arc<dyn CommandQueue>,
    operation: OperationType,
    dtype: NumericType,
) -> TuneResult<Arc<SelectionModel>> {
    ModelRegistry::global().model(queue, operation, dtype)
}
