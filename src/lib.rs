#![doc = include_str!("../README.md")]
#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod chain;
mod core;
pub mod error;
pub mod hl;
pub mod raw;
mod utils {
    pub mod panicking;
    pub mod queue;
    pub mod scope;
}

pub use self::{
    chain::{Chain, LockId},
    hl::lock::{AsyncLock, ProtectOrQueue},
};
