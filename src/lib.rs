//! Process lifecycle core for the EMOS kernel.
//!
//! Implements `fork`, `exit`, `waitpid`, `execv` and `getpid` for
//! single-threaded processes on top of narrow collaborator traits: a
//! scheduler, an address-space service and a program loader.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod process;
pub mod services;
pub mod sync;
pub mod syscalls;

#[cfg(test)]
mod testkit;

pub use config::LifecycleConfig;
pub use process::{CpuRegisters, Process, ProcessError, ProcessId, ProcessState};
pub use services::process_service::{init_process_service, process_service, Platform, ProcessService};
