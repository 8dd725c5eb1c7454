//! Lazily compiled programs and the per-model program cache.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{CommandQueue, CompileRequest, CompiledProgram, ContextId, Device};
use crate::cache::BuildOnceCache;
use crate::error::{TuneError, TuneResult};
use crate::expr::ExpressionBatch;
use crate::fingerprint::ProgramFingerprint;
use crate::profiling;
use crate::templates::{KernelTemplate, Variant};

/// Slot holding the kernels for aligned problem sizes.
pub const PRIMARY_SLOT: usize = 0;
/// Slot holding the kernels that handle ragged edges.
pub const FALLBACK_SLOT: usize = 1;

const FP64_EXTENSION: &str = "cl_khr_fp64";

/// Pragma enabling `extension` when the device lists it, otherwise empty.
pub fn define_extension(device: &dyn Device, extension: &str) -> String {
    if device.has_extension(extension) {
        format!("#pragma OPENCL EXTENSION {extension} : enable\n")
    } else {
        String::new()
    }
}

/// Program source that is only compiled the first time it is needed.
pub struct LazyProgram {
    context: ContextId,
    name: String,
    force_recompilation: bool,
    source: String,
    fragments: usize,
    compiled: Mutex<Option<Arc<dyn CompiledProgram>>>,
}

impl LazyProgram {
    /// Shell whose source starts with `preamble`.
    pub fn new(
        context: ContextId,
        name: impl Into<String>,
        preamble: String,
        force_recompilation: bool,
    ) -> Self {
        LazyProgram {
            context,
            name: name.into(),
            force_recompilation,
            source: preamble,
            fragments: 0,
            compiled: Mutex::new(None),
        }
    }

    /// Appends a source fragment. Only possible before the shell is shared.
    pub fn add(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.source.push_str(fragment);
        self.fragments += 1;
    }

    /// Whether no variant contributed kernels to this shell.
    pub fn is_empty(&self) -> bool {
        self.fragments == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
            .lock()
            .expect("lazy program mutex poisoned")
            .is_some()
    }

    /// Compiles on first use and returns the cached program afterwards.
    pub fn program(&self, queue: &dyn CommandQueue) -> TuneResult<Arc<dyn CompiledProgram>> {
        let mut compiled = self.compiled.lock().expect("lazy program mutex poisoned");
        if let Some(existing) = compiled.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let _compile_scope = profiling::scope("autokern.program.compile");
        tracing::debug!(
            program = self.name.as_str(),
            bytes = self.source.len(),
            force = self.force_recompilation,
            "compiling program"
        );
        let program = queue.compiler().compile(&CompileRequest {
            context: self.context,
            name: self.name.clone(),
            source: self.source.clone(),
            force_recompilation: self.force_recompilation,
        })?;
        *compiled = Some(Arc::clone(&program));
        Ok(program)
    }
}

impl fmt::Debug for LazyProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyProgram")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("fragments", &self.fragments)
            .field("source_bytes", &self.source.len())
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

/// Primary and fallback programs for one `(context, fingerprint)`, holding
/// the kernels of every variant of the model that built them.
#[derive(Debug)]
pub struct CompiledProgramSet {
    fingerprint: ProgramFingerprint,
    programs: [LazyProgram; 2],
    variant_count: usize,
}

impl CompiledProgramSet {
    pub fn fingerprint(&self) -> &ProgramFingerprint {
        &self.fingerprint
    }

    pub fn slot(&self, slot: usize) -> Option<&LazyProgram> {
        self.programs.get(slot)
    }

    pub fn primary(&self) -> &LazyProgram {
        &self.programs[PRIMARY_SLOT]
    }

    pub fn fallback(&self) -> &LazyProgram {
        &self.programs[FALLBACK_SLOT]
    }

    /// Number of variants whose kernels were emitted into this set.
    pub fn variant_count(&self) -> usize {
        self.variant_count
    }

    /// Compiled program of `slot`, compiling it if needed.
    pub fn program(
        &self,
        slot: usize,
        queue: &dyn CommandQueue,
    ) -> TuneResult<Arc<dyn CompiledProgram>> {
        let shell = self.slot(slot).ok_or_else(|| {
            TuneError::invalid_argument(format!(
                "program slot {slot} does not exist for {}",
                self.fingerprint
            ))
        })?;
        shell.program(queue)
    }

    /// Compiles every shell that holds kernels.
    pub fn compile_all(&self, queue: &dyn CommandQueue) -> TuneResult<()> {
        for shell in self.programs.iter().filter(|shell| !shell.is_empty()) {
            shell.program(queue)?;
        }
        Ok(())
    }
}

/// Program store of one selection model, keyed by `(context, fingerprint)`.
/// Entries are built once and live as long as the model.
pub struct ProgramCache {
    entries: BuildOnceCache<(ContextId, ProgramFingerprint), CompiledProgramSet>,
    builds: AtomicUsize,
}

impl ProgramCache {
    pub fn new() -> Self {
        ProgramCache {
            entries: BuildOnceCache::new(),
            builds: AtomicUsize::new(0),
        }
    }

    /// Returns the program set for `(context, fingerprint)`, emitting every
    /// variant's sources the first time the key is seen.
    pub fn obtain(
        &self,
        context: ContextId,
        fingerprint: &ProgramFingerprint,
        device: &dyn Device,
        variants: &[Variant],
        batch: &ExpressionBatch,
        force_recompilation: bool,
    ) -> TuneResult<Arc<CompiledProgramSet>> {
        let key = (context, fingerprint.clone());
        let (set, hit) = self.entries.get_or_try_build(key, || {
            let _build_scope = profiling::scope("autokern.program_cache.build");
            build_program_set(
                context,
                fingerprint,
                device,
                variants,
                batch,
                force_recompilation,
            )
        })?;
        if hit {
            profiling::cache_event("autokern.program_cache.hit");
        } else {
            profiling::cache_event("autokern.program_cache.miss");
            self.builds.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                program = fingerprint.as_str(),
                %context,
                variants = variants.len(),
                "built program set"
            );
        }
        Ok(set)
    }

    pub fn get(&self, context: ContextId, fingerprint: &ProgramFingerprint) -> Option<Arc<CompiledProgramSet>> {
        self.entries.get(&(context, fingerprint.clone()))
    }

    /// Number of program sets built so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

fn build_program_set(
    context: ContextId,
    fingerprint: &ProgramFingerprint,
    device: &dyn Device,
    variants: &[Variant],
    batch: &ExpressionBatch,
    force_recompilation: bool,
) -> TuneResult<CompiledProgramSet> {
    let preamble = define_extension(device, FP64_EXTENSION);
    let mut programs = [
        LazyProgram::new(
            context,
            fingerprint.as_str(),
            preamble.clone(),
            force_recompilation,
        ),
        LazyProgram::new(
            context,
            fingerprint.fallback_name(),
            preamble,
            force_recompilation,
        ),
    ];

    for (index, variant) in variants.iter().enumerate() {
        let sources = variant.generate_sources(index, batch, device)?;
        if sources.len() > programs.len() {
            return Err(TuneError::invalid_argument(format!(
                "variant {index} emitted {} program sources, at most {} are supported",
                sources.len(),
                programs.len()
            )));
        }
        for (program, source) in programs.iter_mut().zip(sources.iter()) {
            program.add(source);
        }
    }

    Ok(CompiledProgramSet {
        fingerprint: fingerprint.clone(),
        programs,
        variant_count: variants.len(),
    })
}
