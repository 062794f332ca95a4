//! Per-instance resource ceilings

pub mod rlimit;

pub use rlimit::RlimitConfig;
