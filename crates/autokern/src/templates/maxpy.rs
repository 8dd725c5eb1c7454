use smallvec::smallvec;

use super::elementwise::{close_range_loop, open_range_loop, scalar_access, Bindings};
use super::source::KernelSource;
use super::{check_extent, check_simd_width, checked_product, FetchPolicy, KernelTemplate};
use crate::backend::{CommandQueue, Device, KernelArg, KernelLaunch};
use crate::error::{TuneError, TuneResult};
use crate::expr::ExpressionBatch;
use crate::program::{CompiledProgramSet, PRIMARY_SLOT};
use crate::shape::InputShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixAxpyParams {
    pub simd_width: usize,
    pub local_size_0: usize,
    pub local_size_1: usize,
    pub num_groups_0: usize,
    pub num_groups_1: usize,
    pub fetch: FetchPolicy,
}

/// Element-wise update of row-major matrices over a 2D range.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixAxpyTemplate {
    params: MatrixAxpyParams,
}

impl MatrixAxpyTemplate {
    pub fn new(params: MatrixAxpyParams) -> TuneResult<Self> {
        check_simd_width(params.simd_width)?;
        checked_product(&[params.local_size_0, params.local_size_1], "work group")?;
        checked_product(&[params.local_size_0, params.num_groups_0], "global size 0")?;
        checked_product(&[params.local_size_1, params.num_groups_1], "global size 1")?;
        Ok(MatrixAxpyTemplate { params })
    }

    pub fn params(&self) -> &MatrixAxpyParams {
        &self.params
    }

    fn dims(&self, batch: &ExpressionBatch) -> TuneResult<(usize, usize)> {
        let mut dims = None;
        for expression in batch.expressions() {
            let target = expression
                .assigned()
                .filter(|target| target.rank() == 2)
                .ok_or_else(|| {
                    TuneError::invalid_argument("maxpy expressions must assign to a device matrix")
                })?;
            check_extent(target)?;
            let found = (target.rows(), target.cols());
            match dims {
                None => dims = Some(found),
                Some(expected) if expected != found => {
                    return Err(TuneError::invalid_argument(format!(
                        "fused maxpy expressions disagree on shape: {expected:?} vs {found:?}"
                    )))
                }
                Some(_) => {}
            }
        }
        dims.ok_or_else(|| TuneError::invalid_argument("empty expression batch"))
    }
}

impl KernelTemplate for MatrixAxpyTemplate {
    fn input_sizes(&self, batch: &ExpressionBatch) -> TuneResult<InputShape> {
        let (rows, cols) = self.dims(batch)?;
        Ok(InputShape::from([rows as i64, cols as i64]))
    }

    fn generate_sources(
        &self,
        index: usize,
        batch: &ExpressionBatch,
        _device: &dyn Device,
    ) -> TuneResult<Vec<String>> {
        let MatrixAxpyParams {
            simd_width, fetch, ..
        } = self.params;
        let bindings = Bindings::collect(batch);
        let statements =
            bindings.statements(batch, |handle, name| scalar_access(handle, name, "i * N + j"))?;

        let mut source = KernelSource::new();
        source.open(&format!(
            "__kernel void maxpy{index}(unsigned int M, unsigned int N, {})",
            bindings.declarations()
        ));
        open_range_loop(&mut source, fetch, "i", "M", 0);
        if simd_width > 1 {
            source.line(&format!("#pragma unroll {simd_width}"));
        }
        open_range_loop(&mut source, fetch, "j", "N", 1);
        for statement in &statements {
            source.line(statement);
        }
        close_range_loop(&mut source, fetch);
        close_range_loop(&mut source, fetch);
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
        let (rows, cols) = self.dims(batch)?;
        let bindings = Bindings::collect(batch);
        let mut args = vec![KernelArg::Size(rows as u64), KernelArg::Size(cols as u64)];
        args.extend(bindings.launch_args());

        let MatrixAxpyParams {
            local_size_0,
            local_size_1,
            num_groups_0,
            num_groups_1,
            ..
        } = self.params;
        queue.submit(KernelLaunch {
            program: programs.program(PRIMARY_SLOT, queue)?,
            kernel: format!("maxpy{index}"),
            global: smallvec![local_size_0 * num_groups_0, local_size_1 * num_groups_1],
            local: smallvec![local_size_0, local_size_1],
            args,
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
    use crate::expr::{BufferHandle, SymbolicExpression};

    struct Plain;

    impl Device for Plain {
        fn name(&self) -> &str {
            "plain"
        }

        fn extensions(&self) -> &str {
            ""
        }
    }

    #[test]
    fn sizes_and_source_follow_the_assigned_matrix() {
        let ctx = ContextId::new(4);
        let a = BufferHandle::matrix(ctx, NumericType::F32, 12, 7);
        let b = BufferHandle::matrix(ctx, NumericType::F32, 12, 7);
        let batch = ExpressionBatch::single(SymbolicExpression::axpy(&b, 3.0, &a, &b).unwrap());
        let template = MatrixAxpyTemplate::new(MatrixAxpyParams {
            simd_width: 2,
            local_size_0: 8,
            local_size_1: 8,
            num_groups_0: 8,
            num_groups_1: 8,
            fetch: FetchPolicy::GlobalStrided,
        })
        .unwrap();

        assert_eq!(template.input_sizes(&batch).unwrap(), InputShape::from([12, 7]));
        let source = template.generate_sources(1, &batch, &Plain).unwrap().remove(0);
        assert!(source.contains("__kernel void maxpy1(unsigned int M, unsigned int N,"));
        assert!(source.contains("arg0[i * N + j] = ((arg1[i * N + j] * arg2) + arg0[i * N + j]);"));
        assert!(source.contains("#pragma unroll 2"));
    }

    #[test]
    fn vector_targets_are_rejected() {
        let ctx = ContextId::new(4);
        let v = BufferHandle::vector(ctx, NumericType::F32, 12);
        let batch = ExpressionBatch::single(SymbolicExpression::axpy(&v, 3.0, &v, &v).unwrap());
        let template = MatrixAxpyTemplate::new(MatrixAxpyParams {
            simd_width: 1,
            local_size_0: 8,
            local_size_1: 8,
            num_groups_0: 8,
            num_groups_1: 8,
            fetch: FetchPolicy::Local,
        })
        .unwrap();
        assert!(template.input_sizes(&batch).unwrap_err().is_invalid_argument());
    }
}
