use smallvec::smallvec;

use super::elementwise::{close_range_loop, open_range_loop};
use super::source::KernelSource;
use super::{
    check_extent, check_simd_width, checked_product, single_expression, FetchPolicy, KernelTemplate,
};
use crate::backend::{CommandQueue, Device, KernelArg, KernelLaunch};
use crate::error::{TuneError, TuneResult};
use crate::expr::{BufferHandle, ExpressionBatch, OpKind, Operand};
use crate::program::{CompiledProgramSet, PRIMARY_SLOT};
use crate::shape::InputShape;

const PARTIALS_SLOT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionParams {
    pub simd_width: usize,
    pub local_size_0: usize,
    pub num_groups_0: usize,
    pub fetch: FetchPolicy,
}

/// Inner product in two passes: one partial sum per work group, then a
/// single group folding the partials.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionTemplate {
    params: ReductionParams,
}

struct DotOperands<'a> {
    out: &'a BufferHandle,
    x: &'a BufferHandle,
    y: &'a BufferHandle,
}

impl ReductionTemplate {
    pub fn new(params: ReductionParams) -> TuneResult<Self> {
        check_simd_width(params.simd_width)?;
        checked_product(&[params.local_size_0, params.num_groups_0], "global size")?;
        Ok(ReductionTemplate { params })
    }

    pub fn params(&self) -> &ReductionParams {
        &self.params
    }

    fn operands<'a>(&self, batch: &'a ExpressionBatch) -> TuneResult<DotOperands<'a>> {
        let expression = single_expression(batch, "reduction")?;
        let root = expression.root();
        let (out, product) = match (&root.op, &root.lhs, &root.rhs) {
            (OpKind::Assign, Operand::Buffer(out), Operand::Node(index)) => {
                (out, expression.node(*index))
            }
            _ => {
                return Err(TuneError::invalid_argument(
                    "reduction expressions must assign an inner product to a device scalar",
                ))
            }
        };
        let product = product
            .filter(|node| node.op == OpKind::InnerProduct)
            .ok_or_else(|| TuneError::invalid_argument("reduction expression has no inner product"))?;
        match (&product.lhs, &product.rhs) {
            (Operand::Buffer(x), Operand::Buffer(y)) if x.dims() == y.dims() => {
                check_extent(x)?;
                Ok(DotOperands { out, x, y })
            }
            _ => Err(TuneError::invalid_argument(
                "inner product operands must be device vectors of equal length",
            )),
        }
    }

    fn partials_bytes(&self, batch: &ExpressionBatch) -> u64 {
        (self.params.num_groups_0 * batch.dtype().size_in_bytes()) as u64
    }
}

/// Folds `buf[0..size]` into `buf[0]`.
fn emit_local_fold(source: &mut KernelSource, size: usize) {
    let padded = size.next_power_of_two();
    source.block(&format!(
        r#"
            barrier(CLK_LOCAL_MEM_FENCE);
            for (unsigned int stride = {half}; stride > 0; stride >>= 1)
            {{
              if (lid < stride && lid + stride < {size})
                buf[lid] += buf[lid + stride];
              barrier(CLK_LOCAL_MEM_FENCE);
            }}
        "#,
        half = padded / 2,
    ));
}

fn vector_sum(simd_width: usize) -> String {
    (0..simd_width)
        .map(|lane| format!("vacc.s{lane:x}"))
        .collect::<Vec<_>>()
        .join(" + ")
}

impl KernelTemplate for ReductionTemplate {
    fn input_sizes(&self, batch: &ExpressionBatch) -> TuneResult<InputShape> {
        let operands = self.operands(batch)?;
        Ok(InputShape::from([operands.x.len() as i64]))
    }

    fn generate_sources(
        &self,
        index: usize,
        batch: &ExpressionBatch,
        _device: &dyn Device,
    ) -> TuneResult<Vec<String>> {
        self.operands(batch)?;
        let ReductionParams {
            simd_width,
            local_size_0,
            fetch,
            ..
        } = self.params;
        let ty = batch.dtype().kernel_type_name();

        let mut source = KernelSource::new();
        source.open(&format!(
            "__kernel void dot{index}_0(unsigned int N, __global {ty}* x, __global {ty}* y, __global {ty}* partials)"
        ));
        source.line(&format!("__local {ty} buf[{local_size_0}];"));
        source.line("unsigned int lid = get_local_id(0);");
        source.line(&format!("{ty} acc = 0;"));
        if simd_width > 1 {
            source.line(&format!("{ty}{simd_width} vacc = 0;"));
            open_range_loop(&mut source, fetch, "i", &format!("N / {simd_width}"), 0);
            source.line(&format!(
                "vacc += vload{simd_width}(i, x) * vload{simd_width}(i, y);"
            ));
            close_range_loop(&mut source, fetch);
            source.line(&format!("acc += {};", vector_sum(simd_width)));
            source.open(&format!(
                "for (unsigned int i = N / {simd_width} * {simd_width} + get_global_id(0); i < N; i += get_global_size(0))"
            ));
            source.line("acc += x[i] * y[i];");
            source.close();
        } else {
            open_range_loop(&mut source, fetch, "i", "N", 0);
            source.line("acc += x[i] * y[i];");
            close_range_loop(&mut source, fetch);
        }
        source.line("buf[lid] = acc;");
        emit_local_fold(&mut source, local_size_0);
        source.line("if (lid == 0)");
        source.line("  partials[get_group_id(0)] = buf[0];");
        source.close();
        source.line("");

        source.open(&format!(
            "__kernel void dot{index}_1(unsigned int G, __global {ty}* partials, __global {ty}* out)"
        ));
        source.line(&format!("__local {ty} buf[{local_size_0}];"));
        source.line("unsigned int lid = get_local_id(0);");
        source.line(&format!("{ty} acc = 0;"));
        source.open(&format!(
            "for (unsigned int i = lid; i < G; i += {local_size_0})"
        ));
        source.line("acc += partials[i];");
        source.close();
        source.line("buf[lid] = acc;");
        emit_local_fold(&mut source, local_size_0);
        source.line("if (lid == 0)");
        source.line("  out[0] = buf[0];");
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
        let program = programs.program(PRIMARY_SLOT, queue)?;
        let ReductionParams {
            local_size_0,
            num_groups_0,
            ..
        } = self.params;
        let partials = KernelArg::Workspace {
            slot: PARTIALS_SLOT,
            bytes: self.partials_bytes(batch),
        };

        queue.submit(KernelLaunch {
            program: program.clone(),
            kernel: format!("dot{index}_0"),
            global: smallvec![local_size_0 * num_groups_0],
            local: smallvec![local_size_0],
            args: vec![
                KernelArg::Size(operands.x.len() as u64),
                KernelArg::Buffer(operands.x.id()),
                KernelArg::Buffer(operands.y.id()),
                partials.clone(),
            ],
            variant: index,
        })?;
        queue.submit(KernelLaunch {
            program,
            kernel: format!("dot{index}_1"),
            global: smallvec![local_size_0],
            local: smallvec![local_size_0],
            args: vec![
                KernelArg::Size(num_groups_0 as u64),
                partials,
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

    #[test]
    fn emits_both_passes_with_indexed_names() {
        let ctx = ContextId::new(2);
        let out = BufferHandle::scalar(ctx, NumericType::F32);
        let x = BufferHandle::vector(ctx, NumericType::F32, 100);
        let y = BufferHandle::vector(ctx, NumericType::F32, 100);
        let batch = ExpressionBatch::single(SymbolicExpression::dot(&out, &x, &y).unwrap());
        let template = ReductionTemplate::new(ReductionParams {
            simd_width: 4,
            local_size_0: 48,
            num_groups_0: 16,
            fetch: FetchPolicy::GlobalStrided,
        })
        .unwrap();

        assert_eq!(template.input_sizes(&batch).unwrap(), InputShape::from([100]));
        let source = template.generate_sources(5, &batch, &Plain).unwrap().remove(0);
        assert!(source.contains("__kernel void dot5_0("));
        assert!(source.contains("__kernel void dot5_1("));
        assert!(source.contains("acc += vacc.s0 + vacc.s1 + vacc.s2 + vacc.s3;"));
        assert!(source.contains("stride = 32;"));
        assert!(source.contains("lid + stride < 48"));
    }

    #[test]
    fn non_dot_expressions_are_rejected() {
        let ctx = ContextId::new(2);
        let x = BufferHandle::vector(ctx, NumericType::F32, 4);
        let batch = ExpressionBatch::single(SymbolicExpression::axpy(&x, 1.0, &x, &x).unwrap());
        let template = ReductionTemplate::new(ReductionParams {
            simd_width: 1,
            local_size_0: 64,
            num_groups_0: 128,
            fetch: FetchPolicy::GlobalStrided,
        })
        .unwrap();
        assert!(template.input_sizes(&batch).unwrap_err().is_invalid_argument());
    }
}
