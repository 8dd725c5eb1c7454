//! In-process reference backend for `autokern`.
//!
//! Nothing runs on a device: the compiler checks and indexes kernel source,
//! and queues record launches and simulate their latency on `finish`. Hosts
//! without an accelerator and the `autokern` test-suite run against it.

pub mod compiler;
pub mod device;
pub mod queue;

pub use compiler::{RefCompiler, RefProgram};
pub use device::RefDevice;
pub use queue::{LaunchRecord, RefContext, RefQueue};
