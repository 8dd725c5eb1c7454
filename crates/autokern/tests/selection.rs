use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use autokern::backend::KernelArg;
use autokern::predictor::CostPredictor;
use autokern::{
    BufferHandle, CommandQueue, ExpressionBatch, InputShape, NumericType, OperationType,
    SelectionModel, SelectionReason, SymbolicExpression, TuneError, Variant,
};
use autokern_backend_ref::{RefContext, RefQueue};

/// Returns the same costs for every shape.
struct FixedCosts(Vec<f32>);

impl CostPredictor for FixedCosts {
    fn predict(&self, _shape: &InputShape) -> Vec<f32> {
        self.0.clone()
    }

    fn num_outputs(&self) -> usize {
        self.0.len()
    }
}

/// Claims two outputs but returns three costs.
struct Miscounted;

impl CostPredictor for Miscounted {
    fn predict(&self, _shape: &InputShape) -> Vec<f32> {
        vec![1.0, 2.0, 3.0]
    }

    fn num_outputs(&self) -> usize {
        2
    }
}

fn vaxpy_variants() -> Result<Vec<Variant>> {
    Ok(vec![
        Variant::from_profile(OperationType::VectorAxpy, &[1, 64, 128, 1])?,
        Variant::from_profile(OperationType::VectorAxpy, &[4, 128, 64, 2])?,
    ])
}

fn model_with(
    queue: &Arc<RefQueue>,
    predictor: Option<Box<dyn CostPredictor>>,
) -> Result<SelectionModel> {
    let queue: Arc<dyn CommandQueue> = queue.clone();
    Ok(SelectionModel::new(vaxpy_variants()?, predictor, queue)?)
}

fn axpy_batch(context: &RefContext, len: usize) -> Result<ExpressionBatch> {
    let x = BufferHandle::vector(context.id(), NumericType::F32, len);
    let y = BufferHandle::vector(context.id(), NumericType::F32, len);
    Ok(SymbolicExpression::axpy(&y, 0.5, &x, &y)?.into())
}

#[test]
fn without_a_predictor_the_baseline_runs() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    let model = model_with(&queue, None)?;

    for bypass in [false, true] {
        let selection = model.execute(&axpy_batch(&context, 100)?, bypass, false)?;
        assert_eq!(selection.variant, 0);
        assert_eq!(selection.reason, SelectionReason::Default);
    }
    assert!(queue.launches().iter().all(|launch| launch.kernel == "axpy0"));
    Ok(())
}

#[test]
fn predictor_picks_the_cheapest_variant_unless_bypassed() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    let model = model_with(&queue, Some(Box::new(FixedCosts(vec![2.0, 1.0]))))?;

    let predicted = model.execute(&axpy_batch(&context, 100)?, false, false)?;
    assert_eq!(predicted.variant, 1);
    assert_eq!(predicted.reason, SelectionReason::Predicted);

    let bypassed = model.execute(&axpy_batch(&context, 100)?, true, false)?;
    assert_eq!(bypassed.variant, 0);
    assert_eq!(bypassed.reason, SelectionReason::Default);

    let kernels: Vec<_> = queue.launches().into_iter().map(|l| l.kernel).collect();
    assert_eq!(kernels, ["axpy1", "axpy0"]);
    // Both variants live in the same program set.
    assert_eq!(model.program_builds(), 1);
    assert_eq!(context.compiler().compilations(), 1);
    Ok(())
}

#[test]
fn equal_costs_select_the_lowest_index() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    let model = model_with(&queue, Some(Box::new(FixedCosts(vec![1.0, 1.0]))))?;

    let selection = model.execute(&axpy_batch(&context, 100)?, false, false)?;
    assert_eq!(selection.variant, 0);
    assert_eq!(selection.reason, SelectionReason::Predicted);
    Ok(())
}

#[test]
fn unusable_costs_fall_back_to_the_baseline() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    let model = model_with(&queue, Some(Box::new(FixedCosts(vec![f32::NAN, f32::NAN]))))?;

    let selection = model.execute(&axpy_batch(&context, 100)?, false, false)?;
    assert_eq!(selection.variant, 0);
    assert_eq!(selection.reason, SelectionReason::Default);
    Ok(())
}

#[test]
fn miscounted_predictions_are_rejected() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    let model = model_with(&queue, Some(Box::new(Miscounted)))?;

    let err = model
        .execute(&axpy_batch(&context, 100)?, false, false)
        .unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");
    assert!(queue.launches().is_empty());
    Ok(())
}

#[test]
fn construction_validates_the_predictor() -> Result<()> {
    let context = RefContext::default();
    let queue: Arc<dyn CommandQueue> = context.create_queue();

    let wrong_width = SelectionModel::new(
        vaxpy_variants()?,
        Some(Box::new(FixedCosts(vec![1.0, 2.0, 3.0]))),
        Arc::clone(&queue),
    )
    .unwrap_err();
    assert!(wrong_width.is_invalid_argument(), "{wrong_width}");

    let single = SelectionModel::new(
        vec![Variant::default_for(OperationType::VectorAxpy)],
        Some(Box::new(FixedCosts(vec![1.0]))),
        Arc::clone(&queue),
    )
    .unwrap_err();
    assert!(single.is_invalid_argument(), "{single}");

    let empty = SelectionModel::new(Vec::new(), None, queue).unwrap_err();
    assert!(matches!(empty, TuneError::InvalidArgument(_)));
    Ok(())
}

#[test]
fn tuned_override_wins_over_the_predictor() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    queue.set_variant_latency(1, Duration::from_millis(20));
    let model = model_with(&queue, Some(Box::new(FixedCosts(vec![5.0, 1.0]))))?;

    let report = model.tune(&axpy_batch(&context, 64)?)?;
    assert_eq!(report.best, 0);
    assert_eq!(report.shape, InputShape::from([64]));
    assert_eq!(report.durations.len(), 2);
    assert!(report.durations[1] >= Duration::from_millis(20));
    assert_eq!(model.override_for(&InputShape::from([64])), Some(0));

    // Every variant was launched once and waited on before the next one.
    let kernels: Vec<_> = queue.launches().into_iter().map(|l| l.kernel).collect();
    assert_eq!(kernels, ["axpy0", "axpy1"]);
    assert!(queue.finishes() >= 3);
    assert_eq!(queue.pending(), 0);

    let tuned = model.execute(&axpy_batch(&context, 64)?, false, false)?;
    assert_eq!(tuned.variant, 0);
    assert_eq!(tuned.reason, SelectionReason::Override);

    let bypassed = model.execute(&axpy_batch(&context, 64)?, true, false)?;
    assert_eq!(bypassed.reason, SelectionReason::Override);

    let untuned = model.execute(&axpy_batch(&context, 128)?, false, false)?;
    assert_eq!(untuned.variant, 1);
    assert_eq!(untuned.reason, SelectionReason::Predicted);
    Ok(())
}

#[test]
fn reductions_run_in_two_passes_over_a_shared_workspace() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    let dyn_queue: Arc<dyn CommandQueue> = queue.clone();
    let model = SelectionModel::single(Variant::default_for(OperationType::Reduction), dyn_queue);

    let x = BufferHandle::vector(context.id(), NumericType::F64, 1000);
    let y = BufferHandle::vector(context.id(), NumericType::F64, 1000);
    let out = BufferHandle::scalar(context.id(), NumericType::F64);
    let batch = ExpressionBatch::single(SymbolicExpression::dot(&out, &x, &y)?);
    model.execute(&batch, false, false)?;

    let launches = queue.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[0].kernel, "dot0_0");
    assert_eq!(launches[1].kernel, "dot0_1");
    let workspace = KernelArg::Workspace {
        slot: 0,
        bytes: 128 * 8,
    };
    assert!(launches[0].args.contains(&workspace));
    assert!(launches[1].args.contains(&workspace));
    Ok(())
}

#[test]
fn buffers_past_unsigned_int_indexing_are_rejected() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    let model = model_with(&queue, None)?;

    let err = model.execute(&axpy_batch(&context, 1usize << 32)?, false, false).unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");
    let err = model.tune(&axpy_batch(&context, 1usize << 32)?).unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");
    assert!(queue.launches().is_empty());

    model.execute(&axpy_batch(&context, 64)?, false, false)?;
    assert_eq!(queue.launches().len(), 1);
    Ok(())
}
