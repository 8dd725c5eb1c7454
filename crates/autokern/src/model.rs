//! Variant selection and empirical tuning for one `(operation, dtype)` pair.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::backend::CommandQueue;
use crate::env;
use crate::error::{TuneError, TuneResult};
use crate::expr::ExpressionBatch;
use crate::fingerprint::{fingerprint, BindingPolicy};
use crate::predictor::{argmin, CostPredictor};
use crate::profiling;
use crate::program::{CompiledProgramSet, ProgramCache};
use crate::shape::InputShape;
use crate::templates::{KernelTemplate, Variant};

/// Why [`SelectionModel::execute`] picked a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionReason {
    /// A tuned override exists for the exact input shape.
    Override,
    /// No predictor was consulted; the baseline variant runs.
    Default,
    /// Lowest predicted cost.
    Predicted,
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectionReason::Override => "override",
            SelectionReason::Default => "default",
            SelectionReason::Predicted => "predicted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub variant: usize,
    pub reason: SelectionReason,
}

/// Measurements of one [`SelectionModel::tune`] pass.
#[derive(Debug, Clone, PartialEq)]
pub struct TuneReport {
    pub shape: InputShape,
    /// Wall-clock time per variant, in variant order.
    pub durations: Vec<Duration>,
    /// Variant recorded as the override for `shape`.
    pub best: usize,
}

/// Candidate variants of one operation bound to a command queue.
///
/// Variant `0` is the baseline. Programs for every variant are emitted
/// together and cached per `(context, fingerprint)` for the lifetime of the
/// model.
pub struct SelectionModel {
    variants: Vec<Variant>,
    predictor: Option<Box<dyn CostPredictor>>,
    overrides: RwLock<HashMap<InputShape, usize>>,
    queue: Arc<dyn CommandQueue>,
    programs: ProgramCache,
}

impl SelectionModel {
    pub fn new(
        variants: Vec<Variant>,
        predictor: Option<Box<dyn CostPredictor>>,
        queue: Arc<dyn CommandQueue>,
    ) -> TuneResult<Self> {
        if variants.is_empty() {
            return Err(TuneError::invalid_argument(
                "a selection model needs at least one variant",
            ));
        }
        if let Some(predictor) = &predictor {
            if variants.len() == 1 {
                return Err(TuneError::invalid_argument(
                    "single-variant models never consult a predictor",
                ));
            }
            if predictor.num_outputs() != variants.len() {
                return Err(TuneError::invalid_argument(format!(
                    "predictor scores {} variants, the model has {}",
                    predictor.num_outputs(),
                    variants.len()
                )));
            }
        }
        Ok(SelectionModel {
            variants,
            predictor,
            overrides: RwLock::new(HashMap::new()),
            queue,
            programs: ProgramCache::new(),
        })
    }

    /// Model that always runs `variant`.
    pub fn single(variant: Variant, queue: Arc<dyn CommandQueue>) -> Self {
        SelectionModel {
            variants: vec![variant],
            predictor: None,
            overrides: RwLock::new(HashMap::new()),
            queue,
            programs: ProgramCache::new(),
        }
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn has_predictor(&self) -> bool {
        self.predictor.is_some()
    }

    pub fn queue(&self) -> &Arc<dyn CommandQueue> {
        &self.queue
    }

    /// Variant recorded by [`SelectionModel::tune`] for exactly `shape`.
    pub fn override_for(&self, shape: &InputShape) -> Option<usize> {
        self.overrides
            .read()
            .expect("override table poisoned")
            .get(shape)
            .copied()
    }

    /// Number of program sets this model has built.
    pub fn program_builds(&self) -> usize {
        self.programs.builds()
    }

    /// Picks a variant for `batch` and submits it without waiting.
    ///
    /// A tuned override for the batch's input sizes wins. Otherwise variant
    /// `0` runs when `bypass_predictor` is set or no predictor is attached,
    /// and the cheapest predicted variant runs in every other case.
    pub fn execute(
        &self,
        batch: &ExpressionBatch,
        bypass_predictor: bool,
        force_recompilation: bool,
    ) -> TuneResult<Selection> {
        self.check_context(batch)?;
        let programs = self.programs_for(batch, force_recompilation)?;
        let shape = self.variants[0].input_sizes(batch)?;
        let selection = self.select(&shape, bypass_predictor)?;

        let variant = &self.variants[selection.variant];
        if env::log_selection_enabled() {
            tracing::info!(
                variant = selection.variant,
                kind = variant.kind(),
                reason = %selection.reason,
                %shape,
                "selected kernel variant"
            );
        } else {
            tracing::debug!(
                variant = selection.variant,
                kind = variant.kind(),
                reason = %selection.reason,
                %shape,
                "selected kernel variant"
            );
        }
        variant.enqueue(self.queue.as_ref(), &programs, selection.variant, batch)?;
        Ok(selection)
    }

    /// Runs every variant on `batch` in isolation, timing each one, and
    /// records the fastest as the override for the batch's input sizes.
    pub fn tune(&self, batch: &ExpressionBatch) -> TuneResult<TuneReport> {
        let _tune_scope = profiling::scope("autokern.tune");
        self.check_context(batch)?;
        let programs = self.programs_for(batch, false)?;
        let shape = self.variants[0].input_sizes(batch)?;

        programs.compile_all(self.queue.as_ref())?;
        self.queue.finish()?;

        let mut durations = Vec::with_capacity(self.variants.len());
        for (index, variant) in self.variants.iter().enumerate() {
            let start = Instant::now();
            variant.enqueue(self.queue.as_ref(), &programs, index, batch)?;
            self.queue.finish()?;
            durations.push(start.elapsed());
        }

        let mut best = 0;
        for (index, duration) in durations.iter().enumerate() {
            if *duration < durations[best] {
                best = index;
            }
        }
        self.overrides
            .write()
            .expect("override table poisoned")
            .insert(shape.clone(), best);

        tracing::info!(
            %shape,
            best,
            kind = self.variants[best].kind(),
            best_ms = durations[best].as_secs_f64() * 1e3,
            variants = self.variants.len(),
            "tuned kernel variants"
        );
        Ok(TuneReport {
            shape,
            durations,
            best,
        })
    }

    fn check_context(&self, batch: &ExpressionBatch) -> TuneResult<()> {
        let expected = self.queue.context();
        let found = batch.context();
        if expected == found {
            Ok(())
        } else {
            Err(TuneError::ContextMismatch { expected, found })
        }
    }

    fn programs_for(
        &self,
        batch: &ExpressionBatch,
        force_recompilation: bool,
    ) -> TuneResult<Arc<CompiledProgramSet>> {
        let fingerprint = fingerprint(batch, BindingPolicy::BindToHandle)?;
        let device = self.queue.device();
        self.programs.obtain(
            self.queue.context(),
            &fingerprint,
            device.as_ref(),
            &self.variants,
            batch,
            force_recompilation,
        )
    }

    fn select(&self, shape: &InputShape, bypass_predictor: bool) -> TuneResult<Selection> {
        if let Some(variant) = self.override_for(shape) {
            return Ok(Selection {
                variant,
                reason: SelectionReason::Override,
            });
        }
        let default = Selection {
            variant: 0,
            reason: SelectionReason::Default,
        };
        let predictor = match &self.predictor {
            Some(predictor) if !bypass_predictor => predictor,
            _ => return Ok(default),
        };
        let costs = predictor.predict(shape);
        if costs.len() != self.variants.len() {
            return Err(TuneError::invalid_argument(format!(
                "predictor returned {} costs for {} variants",
                costs.len(),
                self.variants.len()
            )));
        }
        match argmin(&costs) {
            Some(variant) => Ok(Selection {
                variant,
                reason: SelectionReason::Predicted,
            }),
            None => {
                tracing::warn!(%shape, "predictor returned no usable cost, running the baseline variant");
                Ok(default)
            }
        }
    }
}

impl fmt::Debug for SelectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionModel")
            .field("variants", &self.variants)
            .field("has_predictor", &self.has_predictor())
            .field("queue", &self.queue.id())
            .field("program_builds", &self.program_builds())
            .finish()
    }
}
