use smallvec::smallvec;

use super::source::KernelSource;
use super::{
    check_extent, check_simd_width, checked_product, single_expression, FetchPolicy, KernelTemplate,
};
use crate::backend::{CommandQueue, Device, KernelArg, KernelLaunch};
use crate::error::{TuneError, TuneResult};
use crate::expr::{BufferHandle, ExpressionBatch, OpKind, Operand};
use crate::program::{CompiledProgramSet, PRIMARY_SLOT};
use crate::shape::InputShape;

/// Which dimension of the matrix is folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionAxis {
    /// One output per row: `y = A x`.
    Rows,
    /// One output per column: `y = A^T x`.
    Cols,
}

impl ReductionAxis {
    fn op(self) -> OpKind {
        match self {
            ReductionAxis::Rows => OpKind::MatVecRows,
            ReductionAxis::Cols => OpKind::MatVecCols,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixReductionParams {
    pub simd_width: usize,
    pub local_size_0: usize,
    pub local_size_1: usize,
    pub num_groups_0: usize,
    pub fetch: FetchPolicy,
}

/// Matrix-vector product as a batch of row or column reductions. Each work
/// group owns `local_size_0` outputs and folds them across `local_size_1`
/// work items.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixReductionTemplate {
    axis: ReductionAxis,
    params: MatrixReductionParams,
}

struct GemvOperands<'a> {
    out: &'a BufferHandle,
    matrix: &'a BufferHandle,
    x: &'a BufferHandle,
}

impl MatrixReductionTemplate {
    pub fn new(axis: ReductionAxis, params: MatrixReductionParams) -> TuneResult<Self> {
        check_simd_width(params.simd_width)?;
        checked_product(&[params.local_size_0, params.local_size_1], "work group")?;
        checked_product(&[params.local_size_0, params.num_groups_0], "global size")?;
        Ok(MatrixReductionTemplate { axis, params })
    }

    pub fn axis(&self) -> ReductionAxis {
        self.axis
    }

    pub fn params(&self) -> &MatrixReductionParams {
        &self.params
    }

    fn operands<'a>(&self, batch: &'a ExpressionBatch) -> TuneResult<GemvOperands<'a>> {
        let expression = single_expression(batch, "matrix reduction")?;
        let root = expression.root();
        let (out, product) = match (&root.op, &root.lhs, &root.rhs) {
            (OpKind::Assign, Operand::Buffer(out), Operand::Node(index)) => {
                (out, expression.node(*index))
            }
            _ => {
                return Err(TuneError::invalid_argument(
                    "matrix reductions must assign a matrix-vector product to a device vector",
                ))
            }
        };
        let product = product.filter(|node| node.op == self.axis.op()).ok_or_else(|| {
            TuneError::invalid_argument(format!(
                "expression is not a {:?} matrix-vector product",
                self.axis
            ))
        })?;
        let (matrix, x) = match (&product.lhs, &product.rhs) {
            (Operand::Buffer(matrix), Operand::Buffer(x)) if matrix.rank() == 2 => (matrix, x),
            _ => {
                return Err(TuneError::invalid_argument(
                    "matrix-vector product operands must be a device matrix and a device vector",
                ))
            }
        };
        check_extent(matrix)?;
        check_extent(x)?;
        check_extent(out)?;
        let (outer, inner) = self.extents(matrix.rows(), matrix.cols());
        if x.len() != inner || out.len() != outer {
            return Err(TuneError::invalid_argument(format!(
                "matrix-vector product of {}x{} expects {inner} inputs and {outer} outputs, got {} and {}",
                matrix.rows(),
                matrix.cols(),
                x.len(),
                out.len()
            )));
        }
        Ok(GemvOperands { out, matrix, x })
    }

    /// `(outputs, reduced length)` for an `M x N` matrix.
    fn extents(&self, rows: usize, cols: usize) -> (usize, usize) {
        match self.axis {
            ReductionAxis::Rows => (rows, cols),
            ReductionAxis::Cols => (cols, rows),
        }
    }
}

impl KernelTemplate for MatrixReductionTemplate {
    fn input_sizes(&self, batch: &ExpressionBatch) -> TuneResult<InputShape> {
        let matrix = self.operands(batch)?.matrix;
        Ok(InputShape::from([matrix.rows() as i64, matrix.cols() as i64]))
    }

    fn generate_sources(
        &self,
        index: usize,
        batch: &ExpressionBatch,
        _device: &dyn Device,
    ) -> TuneResult<Vec<String>> {
        self.operands(batch)?;
        let MatrixReductionParams {
            simd_width,
            local_size_0: ls0,
            local_size_1: ls1,
            fetch,
            ..
        } = self.params;
        let ty = batch.dtype().kernel_type_name();
        let (outer, inner, element) = match self.axis {
            ReductionAxis::Rows => ("M", "N", "A[r * N + c]"),
            ReductionAxis::Cols => ("N", "M", "A[c * N + r]"),
        };

        let mut source = KernelSource::new();
        source.open(&format!(
            "__kernel void gemv{index}(unsigned int M, unsigned int N, __global {ty}* A, __global {ty}* x, __global {ty}* y)"
        ));
        source.block(&format!(
            r#"
                __local {ty} buf[{ls0}][{ls1} + 1];
                unsigned int lid0 = get_local_id(0);
                unsigned int lid1 = get_local_id(1);
            "#
        ));
        if fetch == FetchPolicy::Local {
            source.line(&format!("__local {ty} xs[{ls1}];"));
        }
        source.open(&format!(
            "for (unsigned int r0 = get_group_id(0) * {ls0}; r0 < {outer}; r0 += get_num_groups(0) * {ls0})"
        ));
        source.line("unsigned int r = r0 + lid0;");
        source.line(&format!("{ty} acc = 0;"));
        if simd_width > 1 {
            source.line(&format!("#pragma unroll {simd_width}"));
        }
        match fetch {
            FetchPolicy::Local => source.block(&format!(
                r#"
                    for (unsigned int c0 = 0; c0 < {inner}; c0 += {ls1})
                    {{
                      unsigned int c = c0 + lid1;
                      barrier(CLK_LOCAL_MEM_FENCE);
                      if (lid0 == 0 && c < {inner})
                        xs[lid1] = x[c];
                      barrier(CLK_LOCAL_MEM_FENCE);
                      if (r < {outer} && c < {inner})
                        acc += {element} * xs[lid1];
                    }}
                "#
            )),
            FetchPolicy::GlobalStrided => source.block(&format!(
                r#"
                    for (unsigned int c = lid1; r < {outer} && c < {inner}; c += {ls1})
                      acc += {element} * x[c];
                "#
            )),
            FetchPolicy::GlobalContiguous => source.block(&format!(
                r#"
                    unsigned int chunk = ({inner} + {ls1} - 1) / {ls1};
                    unsigned int end = min((lid1 + 1) * chunk, (unsigned int)({inner}));
                    for (unsigned int c = lid1 * chunk; r < {outer} && c < end; ++c)
                      acc += {element} * x[c];
                "#
            )),
        }
        source.block(&format!(
            r#"
                buf[lid0][lid1] = acc;
                barrier(CLK_LOCAL_MEM_FENCE);
                for (unsigned int stride = {half}; stride > 0; stride >>= 1)
                {{
                  if (lid1 < stride && lid1 + stride < {ls1})
                    buf[lid0][lid1] += buf[lid0][lid1 + stride];
                  barrier(CLK_LOCAL_MEM_FENCE);
                }}
                if (lid1 == 0 && r < {outer})
                  y[r] = buf[lid0][0];
            "#,
            half = ls1.next_power_of_two() / 2,
        ));
        source.close();
        source.close();
        Ok(vec![source.finish()])
    }

    fn enqueue(
        &self,
        queue: &dyn CommandQueue,
        programs: &CompiledProgramSet,
        index: usize,
        batch: &ExpressionBatch,
    ) -> TuneResult<()> {
        let operands = self.operands(batch)?;
        let MatrixReductionParams {
            local_size_0,
            local_size_1,
            num_groups_0,
            ..
        } = self.params;
        queue.submit(KernelLaunch {
            program: programs.program(PRIMARY_SLOT, queue)?,
            kernel: format!("gemv{index}"),
            global: smallvec![local_size_0 * num_groups_0, local_size_1],
            local: smallvec![local_size_0, local_size_1],
            args: vec![
                KernelArg::Size(operands.matrix.rows() as u64),
                KernelArg::Size(operands.matrix.cols() as u64),
                KernelArg::Buffer(operands.matrix.id()),
                KernelArg::Buffer(operands.x.id()),
                KernelArg::Buffer(operands.out.id()),
            ],
            variant: index,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ContextId;
    use crate::dtype::NumericType;
    use crate::expr::SymbolicExpression;

    struct Plain;

    impl Device for Plain {
        fn name(&self) -> &str {
            "plain"
        }

        fn extensions(&self) -> &str {
            ""
        }
    }

    fn params(fetch: FetchPolicy) -> MatrixReductionParams {
        MatrixReductionParams {
            simd_width: 1,
            local_size_0: 8,
            local_size_1: 8,
            num_groups_0: 16,
            fetch,
        }
    }

    #[test]
    fn column_reduction_reads_the_matrix_transposed() {
        let ctx = ContextId::new(5);
        let a = BufferHandle::matrix(ctx, NumericType::F64, 6, 4);
        let x = BufferHandle::vector(ctx, NumericType::F64, 6);
        let y = BufferHandle::vector(ctx, NumericType::F64, 4);
        let batch = ExpressionBatch::single(SymbolicExpression::gemv(&y, &a, &x, true).unwrap());
        let template = MatrixReductionTemplate::new(ReductionAxis::Cols, params(FetchPolicy::Local)).unwrap();

        assert_eq!(template.input_sizes(&batch).unwrap(), InputShape::from([6, 4]));
        let source = template.generate_sources(2, &batch, &Plain).unwrap().remove(0);
        assert!(source.contains("__kernel void gemv2("));
        assert!(source.contains("acc += A[c * N + r] * xs[lid1];"));
        assert!(source.contains("r0 < N;"));
    }

    #[test]
    fn axis_must_match_the_expression() {
        let ctx = ContextId::new(5);
        let a = BufferHandle::matrix(ctx, NumericType::F32, 6, 4);
        let x = BufferHandle::vector(ctx, NumericType::F32, 4);
        let y = BufferHandle::vector(ctx, NumericType::F32, 6);
        let batch = ExpressionBatch::single(SymbolicExpression::gemv(&y, &a, &x, false).unwrap());

        let rows = MatrixReductionTemplate::new(ReductionAxis::Rows, params(FetchPolicy::GlobalStrided)).unwrap();
        assert_eq!(rows.input_sizes(&batch).unwrap(), InputShape::from([6, 4]));

        let cols = MatrixReductionTemplate::new(ReductionAxis::Cols, params(FetchPolicy::GlobalStrided)).unwrap();
        assert!(cols.input_sizes(&batch).unwrap_err().is_invalid_argument());
    }
}
