//! A RAL-like module to support PL330 register access
//!
//! The PL330 register file repeats the same per-channel registers eight
//! times, at two different strides. This module represents those clusters
//! as arrays of structs, so that a channel index selects the register
//! cluster. Field modules follow the RAL layout, so the `ral-registers`
//! macros work on every register that has named fields.

#![allow(
    non_snake_case, // Compatibility with RAL
    non_upper_case_globals, // Compatibility with RAL
)]

pub mod pl330;

pub use ral_registers::{modify_reg, read_reg, write_reg};
use ral_registers::{RORegister, RWRegister, WORegister};

/// Pointer to static register memory
///
/// Similar to the RAL's `Instance` type, but copy.
pub(crate) struct Static<T>(pub(crate) *const T);
impl<T> core::ops::Deref for Static<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        // Safety: pointer points to static memory (peripheral memory)
        unsafe { &*self.0 }
    }
}
impl<T> Clone for Static<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Static<T> {}
