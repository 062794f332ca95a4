//! Kernel isolation primitives: namespaces and syscall filtering

pub mod namespace;
pub mod seccomp;
pub mod seccomp_bpf;
pub mod syscall_table;

pub use namespace::{IdMapping, NamespaceConfig, setup_user_namespace};
pub use seccomp::{HARD_DENY, SyscallFilter};
