//! Model descriptions.
//!
//! A description is a JSON document keyed by operation name (`vaxpy`, `dot`,
//! `maxpy`, `gemvN`, `gemvT`, `gemmNN`, `gemmNT`, `gemmTN`, `gemmTT`), then by
//! data type (`float32`, `float64`). Each leaf lists the variant profiles of
//! that pair and, when it lists more than one, the predictor that chooses
//! between them:
//!
//! ```json
//! {
//!   "gemmNN": {
//!     "float32": {
//!       "profiles": [[1, 8, 8, 8, 4, 1, 4, 0, 0, 8, 8], [4, 16, 16, 8, 4, 1, 4, 1, 1, 16, 8]],
//!       "predictor": { "trees": [ ... ] }
//!     }
//!   }
//! }
//! ```
//!
//! Imports are all-or-nothing: every entry is built before the target map
//! changes.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::backend::CommandQueue;
use crate::dtype::NumericType;
use crate::error::{TuneError, TuneResult};
use crate::model::SelectionModel;
use crate::operation::OperationType;
use crate::predictor::RandomForest;
use crate::registry::{ModelKey, ModelMap};
use crate::templates::Variant;

#[derive(Debug, Deserialize)]
struct EntryDescription {
    profiles: Vec<Vec<i64>>,
    #[serde(default)]
    predictor: Option<serde_json::Value>,
}

/// Reads the description at `path` and inserts its models into `target`,
/// replacing the pairs it covers. Returns the number of models imported.
pub fn import(
    path: &Path,
    queue: &Arc<dyn CommandQueue>,
    target: &mut ModelMap,
) -> TuneResult<usize> {
    let text = fs::read_to_string(path).map_err(|source| TuneError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    import_str(&text, queue, target)
}

/// [`import`] on a description already in memory.
pub fn import_str(
    text: &str,
    queue: &Arc<dyn CommandQueue>,
    target: &mut ModelMap,
) -> TuneResult<usize> {
    let document: serde_json::Value = serde_json::from_str(text)?;
    let operations = document.as_object().ok_or_else(|| {
        TuneError::invalid_argument("model description must be an object keyed by operation name")
    })?;

    let mut staged = ModelMap::new();
    for (operation_name, by_dtype) in operations {
        let operation = OperationType::from_description_name(operation_name).ok_or_else(|| {
            TuneError::invalid_argument(format!("unknown operation \"{operation_name}\""))
        })?;
        let by_dtype = by_dtype.as_object().ok_or_else(|| {
            TuneError::invalid_argument(format!(
                "{operation_name}: expected an object keyed by data type"
            ))
        })?;
        for (dtype_name, entry) in by_dtype {
            let dtype = NumericType::from_description_name(dtype_name).ok_or_else(|| {
                TuneError::invalid_argument(format!(
                    "{operation_name}: unknown data type \"{dtype_name}\""
                ))
            })?;
            let entry: EntryDescription = serde_json::from_value(entry.clone()).map_err(|err| {
                TuneError::invalid_argument(format!("{operation_name}/{dtype_name}: {err}"))
            })?;
            let model = build_model(operation, entry, queue).map_err(|err| match err {
                TuneError::InvalidArgument(message) => TuneError::invalid_argument(format!(
                    "{operation_name}/{dtype_name}: {message}"
                )),
                other => other,
            })?;
            tracing::debug!(
                operation = operation_name.as_str(),
                dtype = dtype_name.as_str(),
                variants = model.variants().len(),
                predictor = model.has_predictor(),
                "imported selection model"
            );
            staged.insert(ModelKey::new(operation, dtype), Arc::new(model));
        }
    }

    let imported = staged.len();
    target.extend(staged);
    Ok(imported)
}

fn build_model(
    operation: OperationType,
    entry: EntryDescription,
    queue: &Arc<dyn CommandQueue>,
) -> TuneResult<SelectionModel> {
    let mut variants = entry
        .profiles
        .iter()
        .map(|profile| Variant::from_profile(operation, profile))
        .collect::<TuneResult<Vec<_>>>()?;
    match variants.len() {
        0 => Err(TuneError::invalid_argument("no profiles listed")),
        1 => Ok(SelectionModel::single(variants.remove(0), Arc::clone(queue))),
        count => {
            let description = entry.predictor.ok_or_else(|| {
                TuneError::invalid_argument(format!(
                    "{count} profiles listed without a predictor"
                ))
            })?;
            let forest = RandomForest::from_description(&description)?;
            SelectionModel::new(variants, Some(Box::new(forest)), Arc::clone(queue))
        }
    }
}
