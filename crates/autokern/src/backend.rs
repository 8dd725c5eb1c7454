//! Compute-backend collaborator surface.
//!
//! The selection engine never talks to a device directly. It needs a queue
//! that knows its context and device, a compiler that turns accumulated
//! kernel source into a program, fire-and-forget submission, and a blocking
//! drain for tuning. Backends implement these traits; see
//! `autokern-backend-ref` for an in-process implementation.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::expr::BufferId;

/// Identity of a compute context. Programs are partitioned by context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub const fn new(raw: u64) -> Self {
        ContextId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context#{}", self.0)
    }
}

/// Identity of a command queue. The model registry keeps one model map per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

impl QueueId {
    pub const fn new(raw: u64) -> Self {
        QueueId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue#{}", self.0)
    }
}

pub trait Device: Send + Sync {
    /// Human-readable device name, used in log messages.
    fn name(&self) -> &str;

    /// Position of the device on its platform. Selects the model description
    /// variable `AUTOKERN_MODEL_DEVICE_<ordinal>`.
    fn ordinal(&self) -> usize {
        0
    }

    /// Space separated extension list as reported by the device.
    fn extensions(&self) -> &str;

    fn has_extension(&self, extension: &str) -> bool {
        self.extensions()
            .split_whitespace()
            .any(|candidate| candidate == extension)
    }
}

/// A program produced by a [`ProgramCompiler`].
pub trait CompiledProgram: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Whether the program exports a kernel entry point with this name.
    fn has_kernel(&self, entry: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub context: ContextId,
    pub name: String,
    pub source: String,
    /// When set, the compiler must not serve an artifact it cached earlier
    /// for the same source.
    pub force_recompilation: bool,
}

pub trait ProgramCompiler: Send + Sync {
    fn compile(&self, request: &CompileRequest) -> BackendResult<Arc<dyn CompiledProgram>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Buffer(BufferId),
    Scalar(f64),
    Size(u64),
    /// Backend-provided scratch memory, shared by launches that use the same slot.
    Workspace { slot: u32, bytes: u64 },
}

pub type WorkSize = SmallVec<[usize; 3]>;

/// One kernel submission.
#[derive(Debug, Clone)]
pub struct KernelLaunch {
    pub program: Arc<dyn CompiledProgram>,
    pub kernel: String,
    pub global: WorkSize,
    pub local: WorkSize,
    pub args: Vec<KernelArg>,
    /// Index of the variant that produced this launch within its model.
    pub variant: usize,
}

pub trait CommandQueue: Send + Sync {
    fn id(&self) -> QueueId;

    fn context(&self) -> ContextId;

    fn device(&self) -> Arc<dyn Device>;

    fn compiler(&self) -> Arc<dyn ProgramCompiler>;

    /// Submits a launch without waiting for it. Submissions on one queue
    /// execute in order.
    fn submit(&self, launch: KernelLaunch) -> BackendResult<()>;

    /// Blocks until every submitted launch has completed.
    fn finish(&self) -> BackendResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Compilation { program: String, log: String },
    Unsupported { op: &'static str, reason: String },
    Execution { message: String },
}

impl BackendError {
    pub fn compilation(program: impl Into<String>, log: impl Into<String>) -> Self {
        BackendError::Compilation {
            program: program.into(),
            log: log.into(),
        }
    }

    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unsupported {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Compilation { program, log } => {
                write!(f, "failed to compile program {program}: {log}")
            }
            BackendError::Unsupported { op, reason } => {
                write!(f, "{op} is not supported: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;
