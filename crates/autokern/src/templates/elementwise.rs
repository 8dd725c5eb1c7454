//! Shared emission for streaming kernels: parameter binding, expression
//! rendering and range loops.

use std::collections::HashMap;

use super::source::KernelSource;
use super::FetchPolicy;
use crate::backend::KernelArg;
use crate::dtype::NumericType;
use crate::error::{TuneError, TuneResult};
use crate::expr::{
    BufferHandle, BufferId, ExpressionBatch, OpKind, Operand, SymbolicExpression, Visit,
};

#[derive(Debug, Clone)]
enum Param {
    Buffer(BufferHandle),
    Host { dtype: NumericType, value: f64 },
}

/// Kernel parameters of an element-wise batch in first-use order. Buffers
/// appearing several times share one parameter; every host scalar gets its
/// own. Batches with equal bind-to-handle fingerprints produce the same
/// parameter list.
#[derive(Debug)]
pub(super) struct Bindings {
    params: Vec<Param>,
    buffers: HashMap<BufferId, usize>,
    hosts: Vec<usize>,
}

impl Bindings {
    pub(super) fn collect(batch: &ExpressionBatch) -> Self {
        let mut bindings = Bindings {
            params: Vec::new(),
            buffers: HashMap::new(),
            hosts: Vec::new(),
        };
        for expression in batch.expressions() {
            expression.visit(|visit| {
                if let Visit::Leaf(leaf) = visit {
                    bindings.bind(leaf);
                }
            });
        }
        bindings
    }

    fn bind(&mut self, leaf: &Operand) {
        match leaf {
            Operand::Buffer(handle) => {
                if !self.buffers.contains_key(&handle.id()) {
                    self.buffers.insert(handle.id(), self.params.len());
                    self.params.push(Param::Buffer(handle.clone()));
                }
            }
            Operand::HostScalar { dtype, value } => {
                self.hosts.push(self.params.len());
                self.params.push(Param::Host {
                    dtype: *dtype,
                    value: *value,
                });
            }
            Operand::Empty | Operand::Node(_) => {}
        }
    }

    /// Comma separated kernel parameter declarations.
    pub(super) fn declarations(&self) -> String {
        self.params
            .iter()
            .enumerate()
            .map(|(index, param)| match param {
                Param::Buffer(handle) => {
                    format!("__global {}* arg{index}", handle.dtype().kernel_type_name())
                }
                Param::Host { dtype, .. } => format!("{} arg{index}", dtype.kernel_type_name()),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub(super) fn launch_args(&self) -> Vec<KernelArg> {
        self.params
            .iter()
            .map(|param| match param {
                Param::Buffer(handle) => KernelArg::Buffer(handle.id()),
                Param::Host { value, .. } => KernelArg::Scalar(*value),
            })
            .collect()
    }

    /// One assignment statement per expression of the batch. `access` turns
    /// a buffer parameter name into an element read or write.
    pub(super) fn statements<F>(&self, batch: &ExpressionBatch, access: F) -> TuneResult<Vec<String>>
    where
        F: Fn(&BufferHandle, &str) -> String,
    {
        let mut cursor = 0;
        let mut statements = Vec::with_capacity(batch.expressions().len());
        for expression in batch.expressions() {
            let root = expression.root();
            let target = match (&root.op, &root.lhs) {
                (OpKind::Assign, Operand::Buffer(handle)) => handle,
                _ => {
                    return Err(TuneError::invalid_argument(
                        "element-wise expressions must assign to a device buffer",
                    ))
                }
            };
            let lhs = self.render(expression, &root.lhs, &access, &mut cursor)?;
            let rhs = self.render(expression, &root.rhs, &access, &mut cursor)?;
            statements.push(store(target, &lhs, &rhs));
        }
        Ok(statements)
    }

    fn render<F>(
        &self,
        expression: &SymbolicExpression,
        operand: &Operand,
        access: &F,
        cursor: &mut usize,
    ) -> TuneResult<String>
    where
        F: Fn(&BufferHandle, &str) -> String,
    {
        match operand {
            Operand::Buffer(handle) => {
                let index = self.buffers.get(&handle.id()).copied().ok_or_else(|| {
                    TuneError::invalid_argument(format!("buffer {:?} is not bound", handle.id()))
                })?;
                Ok(access(handle, &format!("arg{index}")))
            }
            Operand::HostScalar { .. } => {
                let index = self.hosts.get(*cursor).copied().ok_or_else(|| {
                    TuneError::invalid_argument("host scalar is not bound")
                })?;
                *cursor += 1;
                Ok(format!("arg{index}"))
            }
            Operand::Node(index) => {
                let node = expression.node(*index).ok_or_else(|| {
                    TuneError::invalid_argument(format!("node {index} does not exist"))
                })?;
                let infix = node.op.infix().filter(|_| node.op.is_elementwise()).ok_or_else(|| {
                    TuneError::invalid_argument(format!(
                        "element-wise kernels cannot evaluate {:?}",
                        node.op
                    ))
                })?;
                let lhs = self.render(expression, &node.lhs, access, cursor)?;
                let rhs = self.render(expression, &node.rhs, access, cursor)?;
                Ok(format!("({lhs} {infix} {rhs})"))
            }
            Operand::Empty => Err(TuneError::invalid_argument(
                "element-wise node is missing an operand",
            )),
        }
    }
}

/// Vector loads are written through `vstore`; everything else is a plain
/// assignment.
fn store(target: &BufferHandle, lhs: &str, rhs: &str) -> String {
    match lhs.strip_prefix("vload") {
        Some(rest) if target.rank() > 0 => {
            let (width, args) = rest.split_once('(').unwrap_or(("", rest));
            let args = args.trim_end_matches(')');
            format!("vstore{width}({rhs}, {args});")
        }
        _ => format!("{lhs} = {rhs};"),
    }
}

/// Opens a loop of `var` over `0..count` along work dimension `dim`,
/// distributing iterations as `fetch` asks. Streaming kernels have nothing
/// to stage, so local fetching distributes like strided.
pub(super) fn open_range_loop(
    source: &mut KernelSource,
    fetch: FetchPolicy,
    var: &str,
    count: &str,
    dim: usize,
) {
    match fetch {
        FetchPolicy::GlobalContiguous => {
            source.open("");
            source.block(&format!(
                r#"
                    unsigned int chunk_{var} = ({count} + get_global_size({dim}) - 1) / get_global_size({dim});
                    unsigned int start_{var} = get_global_id({dim}) * chunk_{var};
                    unsigned int end_{var} = min(start_{var} + chunk_{var}, (unsigned int)({count}));
                "#
            ));
            source.open(&format!(
                "for (unsigned int {var} = start_{var}; {var} < end_{var}; ++{var})"
            ));
        }
        FetchPolicy::Local | FetchPolicy::GlobalStrided => {
            source.open(&format!(
                "for (unsigned int {var} = get_global_id({dim}); {var} < {count}; {var} += get_global_size({dim}))"
            ));
        }
    }
}

/// Closes a loop opened by [`open_range_loop`].
pub(super) fn close_range_loop(source: &mut KernelSource, fetch: FetchPolicy) {
    source.close();
    if fetch == FetchPolicy::GlobalContiguous {
        source.close();
    }
}

/// Element access used by the scalar loops of element-wise kernels.
pub(super) fn scalar_access(handle: &BufferHandle, name: &str, index: &str) -> String {
    if handle.rank() == 0 {
        format!("{name}[0]")
    } else {
        format!("{name}[{index}]")
    }
}
