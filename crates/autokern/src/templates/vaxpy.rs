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
pub struct VectorAxpyParams {
    pub simd_width: usize,
    pub local_size_0: usize,
    pub num_groups_0: usize,
    pub fetch: FetchPolicy,
}

/// Element-wise update of vectors or device scalars. Independent batches
/// fuse into one kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorAxpyTemplate {
    params: VectorAxpyParams,
}

impl VectorAxpyTemplate {
    pub fn new(params: VectorAxpyParams) -> TuneResult<Self> {
        check_simd_width(params.simd_width)?;
        checked_product(&[params.local_size_0, params.num_groups_0], "global size")?;
        Ok(VectorAxpyTemplate { params })
    }

    pub fn params(&self) -> &VectorAxpyParams {
        &self.params
    }

    fn length(&self, batch: &ExpressionBatch) -> TuneResult<usize> {
        let mut length = None;
        for expression in batch.expressions() {
            let target = expression.assigned().ok_or_else(|| {
                TuneError::invalid_argument("vaxpy expressions must assign to a device buffer")
            })?;
            check_extent(target)?;
            match length {
                None => length = Some(target.len()),
                Some(expected) if expected != target.len() => {
                    return Err(TuneError::invalid_argument(format!(
                        "fused vaxpy expressions disagree on length: {expected} vs {}",
                        target.len()
                    )))
                }
                Some(_) => {}
            }
        }
        length.ok_or_else(|| TuneError::invalid_argument("empty expression batch"))
    }
}

impl KernelTemplate for VectorAxpyTemplate {
    fn input_sizes(&self, batch: &ExpressionBatch) -> TuneResult<InputShape> {
        Ok(InputShape::from([self.length(batch)? as i64]))
    }

    fn generate_sources(
        &self,
        index: usize,
        batch: &ExpressionBatch,
        _device: &dyn Device,
    ) -> TuneResult<Vec<String>> {
        let VectorAxpyParams {
            simd_width, fetch, ..
        } = self.params;
        let bindings = Bindings::collect(batch);
        let scalar = bindings.statements(batch, |handle, name| scalar_access(handle, name, "i"))?;

        let mut source = KernelSource::new();
        source.open(&format!(
            "__kernel void axpy{index}(unsigned int N, {})",
            bindings.declarations()
        ));
        if simd_width > 1 {
            let vector = bindings.statements(batch, |handle, name| {
                if handle.rank() == 0 {
                    format!("{name}[0]")
                } else {
                    format!("vload{simd_width}(i, {name})")
                }
            })?;
            open_range_loop(&mut source, fetch, "i", &format!("N / {simd_width}"), 0);
            for statement in &vector {
                source.line(statement);
            }
            close_range_loop(&mut source, fetch);
            source.open(&format!(
                "for (unsigned int i = N / {simd_width} * {simd_width} + get_global_id(0); i < N; i += get_global_size(0))"
            ));
        } else {
            open_range_loop(&mut source, fetch, "i", "N", 0);
        }
        for statement in &scalar {
            source.line(statement);
        }
        if simd_width > 1 {
            source.close();
        } else {
            close_range_loop(&mut source, fetch);
        }
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
        let length = self.length(batch)?;
        let bindings = Bindings::collect(batch);
        let mut args = vec![KernelArg::Size(length as u64)];
        args.extend(bindings.launch_args());

        let local = self.params.local_size_0;
        queue.submit(KernelLaunch {
            program: programs.program(PRIMARY_SLOT, queue)?,
            kernel: format!("axpy{index}"),
            global: smallvec![local * self.params.num_groups_0],
            local: smallvec![local],
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

    struct NoExtensions;

    impl Device for NoExtensions {
        fn name(&self) -> &str {
            "test"
        }

        fn extensions(&self) -> &str {
            ""
        }
    }

    fn template(simd_width: usize, fetch: FetchPolicy) -> VectorAxpyTemplate {
        VectorAxpyTemplate::new(VectorAxpyParams {
            simd_width,
            local_size_0: 64,
            num_groups_0: 128,
            fetch,
        })
        .unwrap()
    }

    #[test]
    fn independent_batches_fuse_into_one_kernel() {
        let ctx = ContextId::new(1);
        let x = BufferHandle::vector(ctx, NumericType::F32, 32);
        let y = BufferHandle::vector(ctx, NumericType::F32, 32);
        let z = BufferHandle::vector(ctx, NumericType::F32, 32);
        let batch = ExpressionBatch::independent(vec![
            SymbolicExpression::axpy(&y, 1.0, &x, &y).unwrap(),
            SymbolicExpression::axpy(&z, 2.0, &x, &z).unwrap(),
        ])
        .unwrap();

        let template = template(1, FetchPolicy::GlobalStrided);
        assert_eq!(template.input_sizes(&batch).unwrap(), InputShape::from([32]));
        let sources = template.generate_sources(3, &batch, &NoExtensions).unwrap();
        assert_eq!(sources.len(), 1);
        assert!(sources[0].contains("__kernel void axpy3(unsigned int N,"));
        assert_eq!(sources[0].matches("get_global_id(0)").count(), 1);
        assert!(sources[0].contains("arg3[i] = ((arg1[i] * arg4) + arg3[i]);"));
    }

    #[test]
    fn vectorized_kernels_keep_a_scalar_tail() {
        let ctx = ContextId::new(1);
        let x = BufferHandle::vector(ctx, NumericType::F64, 10);
        let y = BufferHandle::vector(ctx, NumericType::F64, 10);
        let batch = ExpressionBatch::single(SymbolicExpression::axpy(&y, 1.0, &x, &y).unwrap());
        let source = template(4, FetchPolicy::GlobalContiguous)
            .generate_sources(0, &batch, &NoExtensions)
            .unwrap()
            .remove(0);
        assert!(source.contains("vstore4("));
        assert!(source.contains("chunk_i"));
        assert!(source.contains("N / 4 * 4 + get_global_id(0)"));
        assert!(source.contains("__global double* arg0"));
    }

    #[test]
    fn mismatched_fused_lengths_are_rejected() {
        let ctx = ContextId::new(1);
        let a = BufferHandle::vector(ctx, NumericType::F32, 8);
        let b = BufferHandle::vector(ctx, NumericType::F32, 9);
        let batch = ExpressionBatch::independent(vec![
            SymbolicExpression::axpy(&a, 1.0, &a, &a).unwrap(),
            SymbolicExpression::axpy(&b, 1.0, &b, &b).unwrap(),
        ])
        .unwrap();
        let err = template(1, FetchPolicy::GlobalStrided)
            .input_sizes(&batch)
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }
}
