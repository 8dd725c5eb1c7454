use smallvec::smallvec;

use super::source::KernelSource;
use super::{
    check_extent, check_simd_width, checked_product, round_up, single_expression, FetchPolicy,
    KernelTemplate,
};
use crate::backend::{CommandQueue, Device, KernelArg, KernelLaunch};
use crate::error::{TuneError, TuneResult};
use crate::expr::{BufferHandle, ExpressionBatch, OpKind, Operand};
use crate::program::{CompiledProgramSet, FALLBACK_SLOT, PRIMARY_SLOT};
use crate::shape::InputShape;

/// Tiling of a matrix product. A work group computes an
/// `(local_size_0 * ms) x (local_size_1 * ns)` block of the output, walking
/// `K` in steps of `kl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixProductParams {
    pub simd_width: usize,
    pub local_size_0: usize,
    pub kl: usize,
    pub local_size_1: usize,
    pub ms: usize,
    pub ks: usize,
    pub ns: usize,
    pub fetch_a: FetchPolicy,
    pub fetch_b: FetchPolicy,
    /// Layout of the work group while it copies tiles to local memory.
    pub local_fetch_0: usize,
    pub local_fetch_1: usize,
}

impl MatrixProductParams {
    fn m_tile(&self) -> usize {
        self.local_size_0 * self.ms
    }

    fn n_tile(&self) -> usize {
        self.local_size_1 * self.ns
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixProductTemplate {
    trans_a: bool,
    trans_b: bool,
    params: MatrixProductParams,
}

struct GemmOperands<'a> {
    c: &'a BufferHandle,
    a: &'a BufferHandle,
    b: &'a BufferHandle,
    m: usize,
    n: usize,
    k: usize,
}

impl MatrixProductTemplate {
    pub fn new(trans_a: bool, trans_b: bool, params: MatrixProductParams) -> TuneResult<Self> {
        check_simd_width(params.simd_width)?;
        if params.kl % params.ks != 0 {
            return Err(TuneError::invalid_argument(format!(
                "k tile {} is not a multiple of the per-item k step {}",
                params.kl, params.ks
            )));
        }
        checked_product(&[params.local_size_0, params.ms], "m tile")?;
        checked_product(&[params.local_size_1, params.ns], "n tile")?;
        let uses_local = params.fetch_a == FetchPolicy::Local || params.fetch_b == FetchPolicy::Local;
        let group = checked_product(&[params.local_size_0, params.local_size_1], "work group")?;
        let fetch_layout =
            checked_product(&[params.local_fetch_0, params.local_fetch_1], "local fetch layout")?;
        if uses_local && fetch_layout != group {
            return Err(TuneError::invalid_argument(format!(
                "local fetch layout {}x{} does not cover the {}x{} work group",
                params.local_fetch_0, params.local_fetch_1, params.local_size_0, params.local_size_1
            )));
        }
        Ok(MatrixProductTemplate {
            trans_a,
            trans_b,
            params,
        })
    }

    pub fn params(&self) -> &MatrixProductParams {
        &self.params
    }

    /// `(lhs transposed, rhs transposed)`.
    pub fn transposition(&self) -> (bool, bool) {
        (self.trans_a, self.trans_b)
    }

    fn operands<'a>(&self, batch: &'a ExpressionBatch) -> TuneResult<GemmOperands<'a>> {
        let expression = single_expression(batch, "matrix product")?;
        let root = expression.root();
        let (c, product) = match (&root.op, &root.lhs, &root.rhs) {
            (OpKind::Assign, Operand::Buffer(c), Operand::Node(index)) => (c, expression.node(*index)),
            _ => {
                return Err(TuneError::invalid_argument(
                    "matrix products must assign to a device matrix",
                ))
            }
        };
        let product = product
            .filter(|node| node.op == OpKind::MatMat)
            .ok_or_else(|| TuneError::invalid_argument("expression has no matrix product"))?;
        let (a, trans_a) = expression
            .buffer_operand(&product.lhs)
            .ok_or_else(|| TuneError::invalid_argument("matrix product lhs is not a device matrix"))?;
        let (b, trans_b) = expression
            .buffer_operand(&product.rhs)
            .ok_or_else(|| TuneError::invalid_argument("matrix product rhs is not a device matrix"))?;
        if (trans_a, trans_b) != (self.trans_a, self.trans_b) {
            return Err(TuneError::invalid_argument(format!(
                "expression transposition {:?} does not match the kernel's {:?}",
                (trans_a, trans_b),
                (self.trans_a, self.trans_b)
            )));
        }
        if [c, a, b].iter().any(|handle| handle.rank() != 2) {
            return Err(TuneError::invalid_argument("matrix product operands must be matrices"));
        }
        for handle in [c, a, b] {
            check_extent(handle)?;
        }

        let (m, n) = (c.rows(), c.cols());
        let (a_m, k) = if trans_a { (a.cols(), a.rows()) } else { (a.rows(), a.cols()) };
        let (b_k, b_n) = if trans_b { (b.cols(), b.rows()) } else { (b.rows(), b.cols()) };
        if a_m != m || b_n != n || b_k != k {
            return Err(TuneError::invalid_argument(format!(
                "cannot multiply {}x{} by {}x{} into {m}x{n}",
                a_m, k, b_k, b_n
            )));
        }
        Ok(GemmOperands { c, a, b, m, n, k })
    }

    /// Whether `M x N x K` leaves partial tiles, which only the guarded
    /// fallback kernel handles.
    fn needs_fallback(&self, m: usize, n: usize, k: usize) -> bool {
        m % self.params.m_tile() != 0 || n % self.params.n_tile() != 0 || k % self.params.kl != 0
    }

    fn a_at(&self, row: &str, k: &str) -> String {
        if self.trans_a {
            format!("A[({k}) * M + ({row})]")
        } else {
            format!("A[({row}) * K + ({k})]")
        }
    }

    fn b_at(&self, k: &str, col: &str) -> String {
        if self.trans_b {
            format!("B[({col}) * K + ({k})]")
        } else {
            format!("B[({k}) * N + ({col})]")
        }
    }

    fn emit(&self, source: &mut KernelSource, name: &str, ty: &str, guarded: bool) {
        let MatrixProductParams {
            simd_width,
            local_size_0: ls0,
            kl,
            local_size_1: ls1,
            ms,
            ks,
            ns,
            fetch_a,
            fetch_b,
            local_fetch_0: lf0,
            local_fetch_1: lf1,
        } = self.params;
        let ml = self.params.m_tile();
        let nl = self.params.n_tile();
        let guard = |cond: String, value: String| {
            if guarded {
                format!("(({cond}) ? {value} : 0)")
            } else {
                value
            }
        };

        source.open(&format!(
            "__kernel void {name}(unsigned int M, unsigned int N, unsigned int K, __global {ty}* C, __global const {ty}* A, __global const {ty}* B)"
        ));
        source.block(&format!(
            r#"
                unsigned int lid0 = get_local_id(0);
                unsigned int lid1 = get_local_id(1);
                unsigned int row0 = get_group_id(0) * {ml};
                unsigned int col0 = get_group_id(1) * {nl};
                {ty} acc[{ms}][{ns}];
                for (unsigned int mm = 0; mm < {ms}; ++mm)
                  for (unsigned int nn = 0; nn < {ns}; ++nn)
                    acc[mm][nn] = 0;
            "#
        ));
        let staged = fetch_a == FetchPolicy::Local || fetch_b == FetchPolicy::Local;
        if fetch_a == FetchPolicy::Local {
            source.line(&format!("__local {ty} As[{kl}][{ml} + 1];"));
        }
        if fetch_b == FetchPolicy::Local {
            source.line(&format!("__local {ty} Bs[{kl}][{nl} + 1];"));
        }
        if staged {
            source.line(&format!("unsigned int fi = (lid0 * {ls1} + lid1) % {lf0};"));
            source.line(&format!("unsigned int fj = (lid0 * {ls1} + lid1) / {lf0};"));
        }

        source.open(&format!("for (unsigned int k0 = 0; k0 < K; k0 += {kl})"));
        if staged {
            source.line("barrier(CLK_LOCAL_MEM_FENCE);");
        }
        if fetch_a == FetchPolicy::Local {
            let value = guard(
                "row0 + sm < M && k0 + sk < K".to_string(),
                self.a_at("row0 + sm", "k0 + sk"),
            );
            source.block(&format!(
                r#"
                    for (unsigned int sk = fj; sk < {kl}; sk += {lf1})
                      for (unsigned int sm = fi; sm < {ml}; sm += {lf0})
                        As[sk][sm] = {value};
                "#
            ));
        }
        if fetch_b == FetchPolicy::Local {
            let value = guard(
                "col0 + sn < N && k0 + sk < K".to_string(),
                self.b_at("k0 + sk", "col0 + sn"),
            );
            source.block(&format!(
                r#"
                    for (unsigned int sk = fj; sk < {kl}; sk += {lf1})
                      for (unsigned int sn = fi; sn < {nl}; sn += {lf0})
                        Bs[sk][sn] = {value};
                "#
            ));
        }
        if staged {
            source.line("barrier(CLK_LOCAL_MEM_FENCE);");
        }

        let a_value = match fetch_a {
            FetchPolicy::Local => "As[kk][lr]".to_string(),
            _ => guard(
                "row0 + lr < M && k0 + kk < K".to_string(),
                self.a_at("row0 + lr", "k0 + kk"),
            ),
        };
        let b_value = match fetch_b {
            FetchPolicy::Local => "Bs[kk][lc]".to_string(),
            _ => guard(
                "col0 + lc < N && k0 + kk < K".to_string(),
                self.b_at("k0 + kk", "col0 + lc"),
            ),
        };
        source.block(&format!(
            r#"
                #pragma unroll {ks}
                for (unsigned int kk = 0; kk < {kl}; ++kk)
                {{
                  for (unsigned int mm = 0; mm < {ms}; ++mm)
                  {{
                    unsigned int lr = lid0 + mm * {ls0};
                    {ty} a = {a_value};
                    #pragma unroll {simd_width}
                    for (unsigned int nn = 0; nn < {ns}; ++nn)
                    {{
                      unsigned int lc = lid1 + nn * {ls1};
                      acc[mm][nn] += a * {b_value};
                    }}
                  }}
                }}
            "#
        ));
        source.close();

        let store = if guarded {
            "if (r < M && c < N) C[r * N + c] = acc[mm][nn];"
        } else {
            "C[r * N + c] = acc[mm][nn];"
        };
        source.block(&format!(
            r#"
                for (unsigned int mm = 0; mm < {ms}; ++mm)
                  for (unsigned int nn = 0; nn < {ns}; ++nn)
                  {{
                    unsigned int r = row0 + lid0 + mm * {ls0};
                    unsigned int c = col0 + lid1 + nn * {ls1};
                    {store}
                  }}
            "#
        ));
        source.close();
    }
}

impl KernelTemplate for MatrixProductTemplate {
    fn input_sizes(&self, batch: &ExpressionBatch) -> TuneResult<InputShape> {
        let operands = self.operands(batch)?;
        Ok(InputShape::from([
            operands.m as i64,
            operands.n as i64,
            operands.k as i64,
        ]))
    }

    fn generate_sources(
        &self,
        index: usize,
        batch: &ExpressionBatch,
        _device: &dyn Device,
    ) -> TuneResult<Vec<String>> {
        self.operands(batch)?;
        let ty = batch.dtype().kernel_type_name();

        let mut primary = KernelSource::new();
        self.emit(&mut primary, &format!("gemm{index}"), ty, false);
        let mut fallback = KernelSource::new();
        self.emit(&mut fallback, &format!("gemm{index}_fb"), ty, true);
        Ok(vec![primary.finish(), fallback.finish()])
    }

    fn enqueue(
        &self,
        queue: &dyn CommandQueue,
        programs: &CompiledProgramSet,
        index: usize,
        batch: &ExpressionBatch,
    ) -> TuneResult<()> {
        let GemmOperands { c, a, b, m, n, k } = self.operands(batch)?;
        let params = &self.params;
        let (slot, kernel, rows, cols) = if self.needs_fallback(m, n, k) {
            (
                FALLBACK_SLOT,
                format!("gemm{index}_fb"),
                round_up(m, params.m_tile()),
                round_up(n, params.n_tile()),
            )
        } else {
            (PRIMARY_SLOT, format!("gemm{index}"), m, n)
        };
        queue.submit(KernelLaunch {
            program: programs.program(slot, queue)?,
            kernel,
            global: smallvec![rows / params.ms, cols / params.ns],
            local: smallvec![params.local_size_0, params.local_size_1],
            args: vec![
                KernelArg::Size(m as u64),
                KernelArg::Size(n as u64),
                KernelArg::Size(k as u64),
                KernelArg::Buffer(c.id()),
                KernelArg::Buffer(a.id()),
                KernelArg::Buffer(b.id()),
            ],
            variant: index,
        })?;
        Ok(())
    }
}
