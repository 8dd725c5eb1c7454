use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use autokern::backend::{
    BackendError, BackendResult, CompileRequest, CompiledProgram, ContextId, ProgramCompiler,
};

const KERNEL_PREFIX: &str = "__kernel void ";

/// Program "binary": the kernel entry points found in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefProgram {
    name: String,
    source_hash: u64,
    kernels: Vec<String>,
}

impl RefProgram {
    pub fn kernels(&self) -> &[String] {
        &self.kernels
    }

    pub fn source_hash(&self) -> u64 {
        self.source_hash
    }
}

impl CompiledProgram for RefProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_kernel(&self, entry: &str) -> bool {
        self.kernels.iter().any(|kernel| kernel == entry)
    }
}

type ArtifactKey = (ContextId, u64);

/// Compiler with an in-memory artifact cache keyed by context and source.
#[derive(Default)]
pub struct RefCompiler {
    compiled: Mutex<HashMap<ArtifactKey, Arc<RefProgram>>>,
    compile_gates: Mutex<HashMap<ArtifactKey, Arc<Mutex<()>>>>,
    rejected: Mutex<Vec<String>>,
    requests: AtomicUsize,
    compilations: AtomicUsize,
}

impl RefCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `compile` calls.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Number of programs actually compiled, cache hits excluded.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    /// Makes every later compilation of a source containing `marker` fail.
    pub fn reject_sources_containing(&self, marker: impl Into<String>) {
        self.rejected
            .lock()
            .expect("reference compiler rejection list poisoned")
            .push(marker.into());
    }

    fn build(&self, request: &CompileRequest, source_hash: u64) -> BackendResult<RefProgram> {
        if let Some(marker) = self
            .rejected
            .lock()
            .expect("reference compiler rejection list poisoned")
            .iter()
            .find(|marker| request.source.contains(marker.as_str()))
        {
            return Err(BackendError::compilation(
                &request.name,
                format!("source contains rejected marker \"{marker}\""),
            ));
        }
        check_balanced(&request.name, &request.source)?;
        self.compilations.fetch_add(1, Ordering::SeqCst);
        let kernels = kernel_entries(&request.source);
        tracing::debug!(
            program = request.name.as_str(),
            context = %request.context,
            kernels = kernels.len(),
            "compiled reference program"
        );
        Ok(RefProgram {
            name: request.name.clone(),
            source_hash,
            kernels,
        })
    }

    fn lookup(&self, key: &ArtifactKey) -> Option<Arc<RefProgram>> {
        self.compiled
            .lock()
            .expect("reference program cache poisoned")
            .get(key)
            .cloned()
    }
}

impl ProgramCompiler for RefCompiler {
    fn compile(&self, request: &CompileRequest) -> BackendResult<Arc<dyn CompiledProgram>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let key = (request.context, source_hash(&request.source));

        if !request.force_recompilation {
            if let Some(found) = self.lookup(&key) {
                return Ok(found as Arc<dyn CompiledProgram>);
            }
        }

        let gate = {
            let mut gates = self
                .compile_gates
                .lock()
                .expect("reference compile gate cache poisoned");
            gates
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _gate_lock = gate.lock().expect("reference compile gate poisoned");

        if !request.force_recompilation {
            if let Some(found) = self.lookup(&key) {
                return Ok(found as Arc<dyn CompiledProgram>);
            }
        }

        let program = Arc::new(self.build(request, key.1)?);
        self.compiled
            .lock()
            .expect("reference program cache poisoned")
            .insert(key, Arc::clone(&program));
        Ok(program as Arc<dyn CompiledProgram>)
    }
}

fn source_hash(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

fn kernel_entries(source: &str) -> Vec<String> {
    source
        .match_indices(KERNEL_PREFIX)
        .filter_map(|(start, _)| {
            let rest = &source[start + KERNEL_PREFIX.len()..];
            let end = rest.find('(')?;
            let name = rest[..end].trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

fn check_balanced(program: &str, source: &str) -> BackendResult<()> {
    let mut depth: i64 = 0;
    for (line, text) in source.lines().enumerate() {
        for c in text.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                return Err(BackendError::compilation(
                    program,
                    format!("line {}: unmatched '}}'", line + 1),
                ));
            }
        }
    }
    if depth != 0 {
        return Err(BackendError::compilation(
            program,
            format!("{depth} unclosed block(s)"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: &str, force_recompilation: bool) -> CompileRequest {
        CompileRequest {
            context: ContextId::new(1),
            name: "sasvf0".to_string(),
            source: source.to_string(),
            force_recompilation,
        }
    }

    const SOURCE: &str = "__kernel void axpy0(unsigned int N)\n{\n}\n__kernel void axpy1(unsigned int N)\n{\n}\n";

    #[test]
    fn indexes_kernel_entry_points() {
        let compiler = RefCompiler::new();
        let program = compiler.compile(&request(SOURCE, false)).unwrap();
        assert_eq!(program.name(), "sasvf0");
        assert!(program.has_kernel("axpy0"));
        assert!(program.has_kernel("axpy1"));
        assert!(!program.has_kernel("axpy"));
    }

    #[test]
    fn caches_by_source_unless_forced() {
        let compiler = RefCompiler::new();
        compiler.compile(&request(SOURCE, false)).unwrap();
        compiler.compile(&request(SOURCE, false)).unwrap();
        assert_eq!(compiler.requests(), 2);
        assert_eq!(compiler.compilations(), 1);

        compiler.compile(&request(SOURCE, true)).unwrap();
        assert_eq!(compiler.compilations(), 2);

        let mut other_context = request(SOURCE, false);
        other_context.context = ContextId::new(2);
        compiler.compile(&other_context).unwrap();
        assert_eq!(compiler.compilations(), 3);
    }

    #[test]
    fn reports_malformed_and_rejected_sources() {
        let compiler = RefCompiler::new();
        let err = compiler.compile(&request("__kernel void k()\n{\n", false)).unwrap_err();
        assert!(matches!(err, BackendError::Compilation { .. }), "{err}");

        compiler.reject_sources_containing("axpy1");
        let err = compiler.compile(&request(SOURCE, false)).unwrap_err();
        assert!(err.to_string().contains("axpy1"));
        assert_eq!(compiler.compilations(), 0);
    }
}
