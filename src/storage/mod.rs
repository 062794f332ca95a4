//! Instance filesystem: workspace lifecycle, mount plan, artifact harvest

pub mod artifacts;
pub mod mounts;
pub mod workspace;

pub use artifacts::{ArtifactCollector, Collection};
pub use mounts::MountPlan;
pub use workspace::{ARGS_FILE, ENTRY_FILE, InstanceDir};
