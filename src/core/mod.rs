pub mod archiver;
pub mod catalog;
pub mod classifier;
pub mod dump;
pub mod lock;
pub mod orchestrator;
pub mod process;
pub mod restore;
pub mod retry;
pub mod runtime;
pub mod sink;

#[cfg(test)]
pub mod testing;

pub use catalog::{Catalog, CatalogBuilder};
pub use classifier::{classify, EngineKind};
pub use lock::InstanceLock;
pub use orchestrator::{Orchestrator, RunError, RunReport, RunSettings, RunState};
pub use process::SystemRunner;
pub use restore::{generate as generate_restore_guide, RestoreGuide, RestoreStep};
pub use runtime::{DockerRuntime, WorkloadRuntime};
pub use sink::{ArchivalSink, ResticSink};
