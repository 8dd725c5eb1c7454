//! Kernel-generation strategies.
//!
//! Every selection model owns an ordered list of [`Variant`]s. A variant is a
//! fully parameterized strategy for one operation kind: it derives the input
//! sizes used as selection features, emits OpenCL C for the program slots it
//! needs, and submits its kernels against a compiled program set. Kernel
//! entry names embed the variant index so all variants of a model share one
//! program.

mod elementwise;
mod maxpy;
mod mproduct;
mod mreduction;
mod reduction;
mod source;
mod vaxpy;

use std::fmt;

use crate::backend::{CommandQueue, Device};
use crate::error::{TuneError, TuneResult};
use crate::expr::{BufferHandle, ExpressionBatch, SymbolicExpression};
use crate::operation::OperationType;
use crate::program::CompiledProgramSet;
use crate::shape::InputShape;

pub use maxpy::{MatrixAxpyParams, MatrixAxpyTemplate};
pub use mproduct::{MatrixProductParams, MatrixProductTemplate};
pub use mreduction::{MatrixReductionParams, MatrixReductionTemplate, ReductionAxis};
pub use reduction::{ReductionParams, ReductionTemplate};
pub use vaxpy::{VectorAxpyParams, VectorAxpyTemplate};

/// How a kernel stages its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchPolicy {
    /// Tiles are copied to local memory before use.
    Local,
    /// Work items stride over the global range.
    GlobalStrided,
    /// Each work item owns a contiguous chunk of the global range.
    GlobalContiguous,
}

impl FetchPolicy {
    pub const ALL: [FetchPolicy; 3] = [
        FetchPolicy::Local,
        FetchPolicy::GlobalStrided,
        FetchPolicy::GlobalContiguous,
    ];

    /// Resolves the integer encoding used in description profiles.
    pub fn from_index(index: i64) -> TuneResult<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .ok_or_else(|| {
                TuneError::invalid_argument(format!(
                    "fetch policy index {index} is out of range 0..{}",
                    Self::ALL.len()
                ))
            })
    }

    pub fn index(self) -> i64 {
        match self {
            FetchPolicy::Local => 0,
            FetchPolicy::GlobalStrided => 1,
            FetchPolicy::GlobalContiguous => 2,
        }
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchPolicy::Local => "local",
            FetchPolicy::GlobalStrided => "global-strided",
            FetchPolicy::GlobalContiguous => "global-contiguous",
        };
        f.write_str(name)
    }
}

/// Capabilities every kernel-generation strategy provides.
pub trait KernelTemplate {
    /// Size parameters of `batch`, used as the selection feature vector and
    /// the override key.
    fn input_sizes(&self, batch: &ExpressionBatch) -> TuneResult<InputShape>;

    /// Source fragment per program slot, in slot order. Entry points are
    /// suffixed with `index`.
    fn generate_sources(
        &self,
        index: usize,
        batch: &ExpressionBatch,
        device: &dyn Device,
    ) -> TuneResult<Vec<String>>;

    /// Submits the kernels of variant `index` without waiting for them.
    fn enqueue(
        &self,
        queue: &dyn CommandQueue,
        programs: &CompiledProgramSet,
        index: usize,
        batch: &ExpressionBatch,
    ) -> TuneResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    VectorAxpy(VectorAxpyTemplate),
    Reduction(ReductionTemplate),
    MatrixAxpy(MatrixAxpyTemplate),
    MatrixReduction(MatrixReductionTemplate),
    MatrixProduct(MatrixProductTemplate),
}

impl Variant {
    /// Builds the variant described by one profile of a model description.
    pub fn from_profile(operation: OperationType, profile: &[i64]) -> TuneResult<Self> {
        let arity = operation.profile_arity();
        if profile.len() != arity {
            return Err(TuneError::invalid_argument(format!(
                "{operation} profiles take {arity} integers, got {}",
                profile.len()
            )));
        }
        let variant = match operation {
            OperationType::ScalarAxpy | OperationType::VectorAxpy => {
                Variant::VectorAxpy(VectorAxpyTemplate::new(VectorAxpyParams {
                    simd_width: positive(profile[0], "simd width")?,
                    local_size_0: positive(profile[1], "local size 0")?,
                    num_groups_0: positive(profile[2], "group count 0")?,
                    fetch: FetchPolicy::from_index(profile[3])?,
                })?)
            }
            OperationType::Reduction => Variant::Reduction(ReductionTemplate::new(ReductionParams {
                simd_width: positive(profile[0], "simd width")?,
                local_size_0: positive(profile[1], "local size 0")?,
                num_groups_0: positive(profile[2], "group count 0")?,
                fetch: FetchPolicy::from_index(profile[3])?,
            })?),
            OperationType::MatrixAxpy => Variant::MatrixAxpy(MatrixAxpyTemplate::new(MatrixAxpyParams {
                simd_width: positive(profile[0], "simd width")?,
                local_size_0: positive(profile[1], "local size 0")?,
                local_size_1: positive(profile[2], "local size 1")?,
                num_groups_0: positive(profile[3], "group count 0")?,
                num_groups_1: positive(profile[4], "group count 1")?,
                fetch: FetchPolicy::from_index(profile[5])?,
            })?),
            OperationType::RowWiseReduction | OperationType::ColWiseReduction => {
                let axis = if operation == OperationType::RowWiseReduction {
                    ReductionAxis::Rows
                } else {
                    ReductionAxis::Cols
                };
                let params = MatrixReductionParams {
                    simd_width: positive(profile[0], "simd width")?,
                    local_size_0: positive(profile[1], "local size 0")?,
                    local_size_1: positive(profile[2], "local size 1")?,
                    num_groups_0: positive(profile[3], "group count 0")?,
                    fetch: FetchPolicy::from_index(profile[4])?,
                };
                Variant::MatrixReduction(MatrixReductionTemplate::new(axis, params)?)
            }
            OperationType::MatrixProductNN
            | OperationType::MatrixProductNT
            | OperationType::MatrixProductTN
            | OperationType::MatrixProductTT => {
                let (trans_a, trans_b) = operation.transposition().unwrap_or((false, false));
                let params = MatrixProductParams {
                    simd_width: positive(profile[0], "simd width")?,
                    local_size_0: positive(profile[1], "local size 0")?,
                    kl: positive(profile[2], "k tile")?,
                    local_size_1: positive(profile[3], "local size 1")?,
                    ms: positive(profile[4], "m per item")?,
                    ks: positive(profile[5], "k per item")?,
                    ns: positive(profile[6], "n per item")?,
                    fetch_a: FetchPolicy::from_index(profile[7])?,
                    fetch_b: FetchPolicy::from_index(profile[8])?,
                    local_fetch_0: positive(profile[9], "local fetch 0")?,
                    local_fetch_1: positive(profile[10], "local fetch 1")?,
                };
                Variant::MatrixProduct(MatrixProductTemplate::new(trans_a, trans_b, params)?)
            }
        };
        Ok(variant)
    }

    /// Baseline variant used to fill the registry before any description is
    /// imported.
    pub fn default_for(operation: OperationType) -> Self {
        let strided = FetchPolicy::GlobalStrided.index();
        let local = FetchPolicy::Local.index();
        let profile: Vec<i64> = match operation {
            OperationType::ScalarAxpy | OperationType::VectorAxpy | OperationType::Reduction => {
                vec![1, 64, 128, strided]
            }
            OperationType::MatrixAxpy => vec![1, 8, 8, 8, 8, strided],
            OperationType::RowWiseReduction | OperationType::ColWiseReduction => {
                vec![1, 8, 8, 16, strided]
            }
            OperationType::MatrixProductNN
            | OperationType::MatrixProductNT
            | OperationType::MatrixProductTN
            | OperationType::MatrixProductTT => vec![1, 8, 8, 8, 4, 1, 4, local, local, 8, 8],
        };
        match Self::from_profile(operation, &profile) {
            Ok(variant) => variant,
            Err(err) => unreachable!("built-in profile for {operation} is invalid: {err}"),
        }
    }

    /// Short kind tag, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Variant::VectorAxpy(_) => "vaxpy",
            Variant::Reduction(_) => "reduction",
            Variant::MatrixAxpy(_) => "maxpy",
            Variant::MatrixReduction(template) => match template.axis() {
                ReductionAxis::Rows => "row-reduction",
                ReductionAxis::Cols => "col-reduction",
            },
            Variant::MatrixProduct(_) => "mproduct",
        }
    }

    fn template(&self) -> &dyn KernelTemplate {
        match self {
            Variant::VectorAxpy(template) => template,
            Variant::Reduction(template) => template,
            Variant::MatrixAxpy(template) => template,
            Variant::MatrixReduction(template) => template,
            Variant::MatrixProduct(template) => template,
        }
    }
}

impl KernelTemplate for Variant {
    fn input_sizes(&self, batch: &ExpressionBatch) -> TuneResult<InputShape> {
        self.template().input_sizes(batch)
    }

    fn generate_sources(
        &self,
        index: usize,
        batch: &ExpressionBatch,
        device: &dyn Device,
    ) -> TuneResult<Vec<String>> {
        self.template().generate_sources(index, batch, device)
    }

    fn enqueue(
        &self,
        queue: &dyn CommandQueue,
        programs: &CompiledProgramSet,
        index: usize,
        batch: &ExpressionBatch,
    ) -> TuneResult<()> {
        self.template().enqueue(queue, programs, index, batch)
    }
}

/// Largest size, index or work-item count a kernel handles; sizes are
/// passed as `unsigned int`.
const MAX_KERNEL_SIZE: usize = u32::MAX as usize;

fn positive(value: i64, what: &str) -> TuneResult<usize> {
    match usize::try_from(value) {
        Ok(size) if size > 0 && size <= MAX_KERNEL_SIZE => Ok(size),
        _ => Err(TuneError::invalid_argument(format!(
            "{what} must be in 1..={MAX_KERNEL_SIZE}, got {value}"
        ))),
    }
}

/// Product of `factors`, rejected when it does not fit a kernel size.
fn checked_product(factors: &[usize], what: &str) -> TuneResult<usize> {
    factors
        .iter()
        .try_fold(1usize, |product, &factor| product.checked_mul(factor))
        .filter(|&product| product <= MAX_KERNEL_SIZE)
        .ok_or_else(|| {
            TuneError::invalid_argument(format!(
                "{what} {factors:?} exceeds {MAX_KERNEL_SIZE}"
            ))
        })
}

/// Rejects buffers with elements beyond the reach of an `unsigned int` index.
fn check_extent(handle: &BufferHandle) -> TuneResult<()> {
    checked_product(handle.dims(), "buffer dims").map(|_| ())
}

const SIMD_WIDTHS: [usize; 5] = [1, 2, 4, 8, 16];

fn check_simd_width(simd_width: usize) -> TuneResult<()> {
    if SIMD_WIDTHS.contains(&simd_width) {
        Ok(())
    } else {
        Err(TuneError::invalid_argument(format!(
            "simd width must be one of {SIMD_WIDTHS:?}, got {simd_width}"
        )))
    }
}

/// The only expression of a batch, for kernels that cannot fuse.
fn single_expression<'a>(
    batch: &'a ExpressionBatch,
    kind: &str,
) -> TuneResult<&'a SymbolicExpression> {
    match batch.expressions() {
        [expression] => Ok(expression),
        expressions => Err(TuneError::invalid_argument(format!(
            "{kind} kernels take a single expression, got {}",
            expressions.len()
        ))),
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}
