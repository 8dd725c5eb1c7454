use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use autokern::backend::{
    BackendError, BackendResult, CommandQueue, ContextId, Device, KernelArg, KernelLaunch,
    ProgramCompiler, QueueId, WorkSize,
};

use crate::compiler::RefCompiler;
use crate::device::RefDevice;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);
static NEXT_QUEUE: AtomicU64 = AtomicU64::new(1);

/// A device plus the compiler whose artifacts its queues share.
pub struct RefContext {
    id: ContextId,
    device: Arc<RefDevice>,
    compiler: Arc<RefCompiler>,
}

impl RefContext {
    pub fn new(device: RefDevice) -> Self {
        RefContext {
            id: ContextId::new(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)),
            device: Arc::new(device),
            compiler: Arc::new(RefCompiler::new()),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn device(&self) -> &Arc<RefDevice> {
        &self.device
    }

    pub fn compiler(&self) -> &Arc<RefCompiler> {
        &self.compiler
    }

    pub fn create_queue(&self) -> Arc<RefQueue> {
        self.create_queue_with_latency(Duration::ZERO)
    }

    /// Queue whose `finish` takes `latency` per pending launch.
    pub fn create_queue_with_latency(&self, latency: Duration) -> Arc<RefQueue> {
        Arc::new(RefQueue {
            id: QueueId::new(NEXT_QUEUE.fetch_add(1, Ordering::Relaxed)),
            context: self.id,
            device: Arc::clone(&self.device),
            compiler: Arc::clone(&self.compiler),
            latency,
            variant_latency: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            finishes: AtomicUsize::new(0),
        })
    }
}

impl Default for RefContext {
    fn default() -> Self {
        Self::new(RefDevice::new())
    }
}

/// One accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub program: String,
    pub kernel: String,
    pub variant: usize,
    pub global: WorkSize,
    pub local: WorkSize,
    pub args: Vec<KernelArg>,
}

pub struct RefQueue {
    id: QueueId,
    context: ContextId,
    device: Arc<RefDevice>,
    compiler: Arc<RefCompiler>,
    latency: Duration,
    variant_latency: Mutex<HashMap<usize, Duration>>,
    pending: Mutex<Vec<LaunchRecord>>,
    history: Mutex<Vec<LaunchRecord>>,
    finishes: AtomicUsize,
}

impl RefQueue {
    /// Extra simulated time for every launch of variant `variant`.
    pub fn set_variant_latency(&self, variant: usize, latency: Duration) {
        self.variant_latency
            .lock()
            .expect("reference queue latency table poisoned")
            .insert(variant, latency);
    }

    /// Every launch accepted so far, in submission order.
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.history
            .lock()
            .expect("reference queue history poisoned")
            .clone()
    }

    pub fn clear_launches(&self) {
        self.history
            .lock()
            .expect("reference queue history poisoned")
            .clear();
    }

    /// Launches submitted since the last `finish`.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .expect("reference queue poisoned")
            .len()
    }

    pub fn finishes(&self) -> usize {
        self.finishes.load(Ordering::SeqCst)
    }

    pub fn ref_compiler(&self) -> &Arc<RefCompiler> {
        &self.compiler
    }

    fn launch_latency(&self, launches: &[LaunchRecord]) -> Duration {
        let table = self
            .variant_latency
            .lock()
            .expect("reference queue latency table poisoned");
        launches
            .iter()
            .map(|launch| self.latency + table.get(&launch.variant).copied().unwrap_or_default())
            .sum()
    }
}

fn check_work_sizes(kernel: &str, global: &WorkSize, local: &WorkSize) -> BackendResult<()> {
    if global.is_empty() || global.len() > 3 || global.len() != local.len() {
        return Err(BackendError::execution(format!(
            "{kernel}: global {global:?} and local {local:?} work sizes disagree on dimensions"
        )));
    }
    for (dim, (&global, &local)) in global.iter().zip(local.iter()).enumerate() {
        if local == 0 || global % local != 0 {
            return Err(BackendError::execution(format!(
                "{kernel}: global size {global} is not a multiple of local size {local} in dimension {dim}"
            )));
        }
    }
    Ok(())
}

impl CommandQueue for RefQueue {
    fn id(&self) -> QueueId {
        self.id
    }

    fn context(&self) -> ContextId {
        self.context
    }

    fn device(&self) -> Arc<dyn Device> {
        Arc::clone(&self.device) as Arc<dyn Device>
    }

    fn compiler(&self) -> Arc<dyn ProgramCompiler> {
        Arc::clone(&self.compiler) as Arc<dyn ProgramCompiler>
    }

    fn submit(&self, launch: KernelLaunch) -> BackendResult<()> {
        if !launch.program.has_kernel(&launch.kernel) {
            return Err(BackendError::execution(format!(
                "program {} has no kernel {}",
                launch.program.name(),
                launch.kernel
            )));
        }
        check_work_sizes(&launch.kernel, &launch.global, &launch.local)?;
        let record = LaunchRecord {
            program: launch.program.name().to_string(),
            kernel: launch.kernel,
            variant: launch.variant,
            global: launch.global,
            local: launch.local,
            args: launch.args,
        };
        tracing::trace!(queue = %self.id, kernel = record.kernel.as_str(), "accepted launch");
        self.history
            .lock()
            .expect("reference queue history poisoned")
            .push(record.clone());
        self.pending
            .lock()
            .expect("reference queue poisoned")
            .push(record);
        Ok(())
    }

    fn finish(&self) -> BackendResult<()> {
        let drained: Vec<LaunchRecord> = self
            .pending
            .lock()
            .expect("reference queue poisoned")
            .drain(..)
            .collect();
        let latency = self.launch_latency(&drained);
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        self.finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use autokern::backend::{CompileRequest, ProgramCompiler};
    use smallvec::smallvec;

    use super::*;

    fn launch(queue: &RefQueue, kernel: &str, variant: usize) -> KernelLaunch {
        let program = queue
            .compiler()
            .compile(&CompileRequest {
                context: queue.context(),
                name: "p".to_string(),
                source: "__kernel void k0()\n{\n}\n__kernel void k1()\n{\n}\n".to_string(),
                force_recompilation: false,
            })
            .unwrap();
        KernelLaunch {
            program,
            kernel: kernel.to_string(),
            global: smallvec![64],
            local: smallvec![16],
            args: vec![KernelArg::Size(3)],
            variant,
        }
    }

    #[test]
    fn queues_share_their_context() {
        let context = RefContext::default();
        let a = context.create_queue();
        let b = context.create_queue();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.context(), context.id());
        assert_eq!(b.context(), context.id());
        assert!(Arc::ptr_eq(a.ref_compiler(), b.ref_compiler()));
    }

    #[test]
    fn submit_records_and_finish_drains() {
        let queue = RefContext::default().create_queue();
        queue.submit(launch(&queue, "k0", 0)).unwrap();
        queue.submit(launch(&queue, "k1", 1)).unwrap();
        assert_eq!(queue.pending(), 2);
        queue.finish().unwrap();
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.finishes(), 1);
        let kernels: Vec<_> = queue.launches().into_iter().map(|l| l.kernel).collect();
        assert_eq!(kernels, vec!["k0", "k1"]);
    }

    #[test]
    fn submit_rejects_unknown_kernels_and_ragged_work_sizes() {
        let queue = RefContext::default().create_queue();
        assert!(queue.submit(launch(&queue, "k2", 0)).is_err());

        let mut ragged = launch(&queue, "k0", 0);
        ragged.global = smallvec![65];
        let err = queue.submit(ragged).unwrap_err();
        assert!(err.to_string().contains("not a multiple"));
        assert!(queue.launches().is_empty());
    }

    #[test]
    fn finish_waits_for_variant_latency() {
        let queue = RefContext::default().create_queue();
        queue.set_variant_latency(1, Duration::from_millis(20));
        queue.submit(launch(&queue, "k1", 1)).unwrap();
        let start = Instant::now();
        queue.finish().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
