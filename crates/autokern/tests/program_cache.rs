use std::sync::Arc;
use std::thread;

use anyhow::Result;
use autokern::backend::BackendError;
use autokern::{
    BufferHandle, CommandQueue, ExpressionBatch, NumericType, OperationType, SelectionModel,
    SymbolicExpression, TuneError, Variant,
};
use autokern_backend_ref::{RefContext, RefQueue};

fn axpy_batch(context: &RefContext, len: usize) -> Result<ExpressionBatch> {
    let x = BufferHandle::vector(context.id(), NumericType::F32, len);
    let y = BufferHandle::vector(context.id(), NumericType::F32, len);
    Ok(SymbolicExpression::axpy(&y, 2.0, &x, &y)?.into())
}

fn vaxpy_model(queue: &Arc<RefQueue>) -> SelectionModel {
    let queue: Arc<dyn CommandQueue> = queue.clone();
    SelectionModel::single(Variant::default_for(OperationType::VectorAxpy), queue)
}

#[test]
fn structurally_identical_batches_compile_once() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    let model = vaxpy_model(&queue);

    model.execute(&axpy_batch(&context, 64)?, false, false)?;
    model.execute(&axpy_batch(&context, 4096)?, false, false)?;

    assert_eq!(model.program_builds(), 1);
    assert_eq!(context.compiler().compilations(), 1);
    assert_eq!(context.compiler().requests(), 1);
    assert_eq!(queue.launches().len(), 2);
    Ok(())
}

#[test]
fn different_aliasing_builds_a_new_program_set() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    let model = vaxpy_model(&queue);

    model.execute(&axpy_batch(&context, 64)?, false, false)?;
    let x = BufferHandle::vector(context.id(), NumericType::F32, 64);
    let y = BufferHandle::vector(context.id(), NumericType::F32, 64);
    let z = BufferHandle::vector(context.id(), NumericType::F32, 64);
    let out_of_place: ExpressionBatch = SymbolicExpression::axpy(&z, 2.0, &x, &y)?.into();
    model.execute(&out_of_place, false, false)?;

    assert_eq!(model.program_builds(), 2);
    assert_eq!(context.compiler().compilations(), 2);
    Ok(())
}

#[test]
fn force_recompilation_bypasses_the_compiler_artifact_cache() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();

    // Separate models emit identical source, so the compiler can reuse the artifact.
    vaxpy_model(&queue).execute(&axpy_batch(&context, 64)?, false, false)?;
    vaxpy_model(&queue).execute(&axpy_batch(&context, 64)?, false, false)?;
    assert_eq!(context.compiler().requests(), 2);
    assert_eq!(context.compiler().compilations(), 1);

    let forced = vaxpy_model(&queue);
    forced.execute(&axpy_batch(&context, 64)?, false, true)?;
    assert_eq!(context.compiler().compilations(), 2);

    // The shell is compiled now; forcing again does not rebuild the set.
    forced.execute(&axpy_batch(&context, 64)?, false, true)?;
    assert_eq!(forced.program_builds(), 1);
    assert_eq!(context.compiler().compilations(), 2);
    Ok(())
}

#[test]
fn concurrent_executions_share_one_build() -> Result<()> {
    let context = Arc::new(RefContext::default());
    let queue = context.create_queue();
    let model = Arc::new(vaxpy_model(&queue));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let context = Arc::clone(&context);
            let model = Arc::clone(&model);
            thread::spawn(move || -> Result<()> {
                model.execute(&axpy_batch(&context, 256)?, false, false)?;
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }

    assert_eq!(model.program_builds(), 1);
    assert_eq!(context.compiler().compilations(), 1);
    assert_eq!(queue.launches().len(), 8);
    Ok(())
}

#[test]
fn compilation_failures_propagate_unchanged() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    context.compiler().reject_sources_containing("axpy0");
    let model = vaxpy_model(&queue);

    let err = model
        .execute(&axpy_batch(&context, 64)?, false, false)
        .unwrap_err();
    assert!(
        matches!(err, TuneError::Backend(BackendError::Compilation { .. })),
        "{err}"
    );
    assert!(queue.launches().is_empty());
    Ok(())
}

#[test]
fn batches_from_another_context_are_rejected() -> Result<()> {
    let context = RefContext::default();
    let other = RefContext::default();
    let queue = context.create_queue();
    let model = vaxpy_model(&queue);

    let err = model
        .execute(&axpy_batch(&other, 64)?, false, false)
        .unwrap_err();
    assert!(matches!(err, TuneError::ContextMismatch { .. }), "{err}");
    assert_eq!(model.program_builds(), 0);
    assert!(model.tune(&axpy_batch(&other, 64)?).is_err());
    Ok(())
}

#[test]
fn ragged_matrix_products_run_the_fallback_program() -> Result<()> {
    let context = RefContext::default();
    let queue = context.create_queue();
    let dyn_queue: Arc<dyn CommandQueue> = queue.clone();
    let model = SelectionModel::single(
        Variant::default_for(OperationType::MatrixProductNN),
        dyn_queue,
    );

    let gemm = |m: usize, n: usize, k: usize| -> Result<ExpressionBatch> {
        let a = BufferHandle::matrix(context.id(), NumericType::F32, m, k);
        let b = BufferHandle::matrix(context.id(), NumericType::F32, k, n);
        let c = BufferHandle::matrix(context.id(), NumericType::F32, m, n);
        Ok(SymbolicExpression::gemm(&c, &a, &b, false, false)?.into())
    };

    model.execute(&gemm(64, 64, 64)?, false, false)?;
    model.execute(&gemm(33, 64, 64)?, false, false)?;

    let launches = queue.launches();
    assert_eq!(launches[0].kernel, "gemm0");
    assert!(!launches[0].program.ends_with("_fb"));
    assert_eq!(launches[1].kernel, "gemm0_fb");
    assert!(launches[1].program.ends_with("_fb"));
    assert_eq!(launches[1].global.as_slice(), &[16, 16]);
    assert_eq!(model.program_builds(), 1);
    Ok(())
}
