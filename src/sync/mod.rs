//! Synchronization primitives used by process records

mod condvar;

pub use condvar::Condvar;
