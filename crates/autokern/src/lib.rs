//! Runtime kernel-variant selection and autotuning.
//!
//! A [`model::SelectionModel`] owns the candidate kernel variants for one
//! `(operation, dtype)` pair and decides which one runs for a given
//! [`expr::ExpressionBatch`]: a tuned override for the exact input shape wins,
//! then the learned cost predictor, then variant `0`. Device programs are
//! built lazily and cached per `(context, structural fingerprint)`.
//!
//! The [`registry`] keeps one fully populated model map per command queue and
//! can be reconfigured from a JSON model description named by
//! `AUTOKERN_MODEL_DEVICE_<ordinal>`.

pub mod backend;
mod cache;
pub mod dtype;
mod env;
pub mod error;
pub mod expr;
pub mod fingerprint;
pub mod import;
pub mod model;
pub mod operation;
pub mod predictor;
pub mod profiling;
pub mod program;
pub mod registry;
pub mod shape;
pub mod templates;

pub use backend::{CommandQueue, ContextId, Device, QueueId};
pub use dtype::NumericType;
pub use error::{TuneError, TuneResult};
pub use expr::{BufferHandle, ExpressionBatch, SymbolicExpression};
pub use model::{Selection, SelectionModel, SelectionReason, TuneReport};
pub use operation::OperationType;
pub use registry::{get_model, get_model_map, ModelKey, ModelMap, ModelRegistry, RegistryConfig};
pub use shape::InputShape;
pub use templates::{FetchPolicy, Variant};
