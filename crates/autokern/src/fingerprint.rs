//! Structural fingerprints of expression batches.
//!
//! A fingerprint names the device program an expression batch compiles to:
//! the batch-kind prefix (`i` or `s`) followed by one token per traversed
//! node and leaf. Sizes are deliberately absent; kernels receive them as
//! arguments, so batches that differ only in sizes share a program.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{TuneError, TuneResult};
use crate::expr::{BufferId, ExpressionBatch, Operand, Visit};

/// Hard cap on fingerprint length. Longer fingerprints are rejected rather
/// than truncated: a truncated name would alias two programs.
pub const MAX_FINGERPRINT_LEN: usize = 255;

static NEXT_UNIQUE_BINDING: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingPolicy {
    /// Leaves that reference the same buffer handle share a token.
    BindToHandle,
    /// Every buffer occurrence gets a token never handed out before.
    BindAllUnique,
}

trait SymbolicBinder {
    fn bind(&mut self, buffer: BufferId) -> u64;
}

#[derive(Default)]
struct BindToHandle {
    bound: HashMap<BufferId, u64>,
}

impl SymbolicBinder for BindToHandle {
    fn bind(&mut self, buffer: BufferId) -> u64 {
        let next = self.bound.len() as u64;
        *self.bound.entry(buffer).or_insert(next)
    }
}

struct BindAllUnique;

impl SymbolicBinder for BindAllUnique {
    fn bind(&mut self, _buffer: BufferId) -> u64 {
        NEXT_UNIQUE_BINDING.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramFingerprint(String);

impl ProgramFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the fallback program built next to the primary one.
    pub fn fallback_name(&self) -> String {
        format!("{}_fb", self.0)
    }
}

impl fmt::Display for ProgramFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Append-only buffer that refuses to grow past [`MAX_FINGERPRINT_LEN`].
struct FingerprintWriter {
    buf: String,
    overflowed: bool,
}

impl FingerprintWriter {
    fn new() -> Self {
        FingerprintWriter {
            buf: String::with_capacity(64),
            overflowed: false,
        }
    }

    /// Appends `token`; breaks once the cap is exceeded so traversal stops.
    fn push(&mut self, token: fmt::Arguments<'_>) -> ControlFlow<()> {
        if self.overflowed {
            return ControlFlow::Break(());
        }
        let mark = self.buf.len();
        let _ = self.buf.write_fmt(token);
        if self.buf.len() > MAX_FINGERPRINT_LEN {
            self.buf.truncate(mark);
            self.overflowed = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn finish(self) -> TuneResult<ProgramFingerprint> {
        if self.overflowed {
            return Err(TuneError::FingerprintOverflow {
                limit: MAX_FINGERPRINT_LEN,
            });
        }
        Ok(ProgramFingerprint(self.buf))
    }
}

/// Computes the fingerprint of `batch` under `policy`.
///
/// Every visited node emits at least one character and the walk stops on
/// overflow, so shared subexpressions cannot blow up the traversal.
pub fn fingerprint(batch: &ExpressionBatch, policy: BindingPolicy) -> TuneResult<ProgramFingerprint> {
    let mut binder: Box<dyn SymbolicBinder> = match policy {
        BindingPolicy::BindToHandle => Box::new(BindToHandle::default()),
        BindingPolicy::BindAllUnique => Box::new(BindAllUnique),
    };
    let mut writer = FingerprintWriter::new();
    let mut walk = writer.push(format_args!("{}", batch.order().prefix()));
    for expression in batch.expressions() {
        if walk.is_break() {
            break;
        }
        walk = expression.try_visit(|visit| match visit {
            Visit::Node(node) => writer.push(format_args!("{}", node.op.token())),
            Visit::Leaf(Operand::Buffer(handle)) => {
                let binding = binder.bind(handle.id());
                writer.push(format_args!(
                    "{}{}{}",
                    handle.kind_code(),
                    handle.dtype().code(),
                    binding
                ))
            }
            Visit::Leaf(Operand::HostScalar { dtype, .. }) => {
                writer.push(format_args!("h{}", dtype.code()))
            }
            Visit::Leaf(_) => ControlFlow::Continue(()),
        });
    }
    writer.finish()
}
