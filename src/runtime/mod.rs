//! Runtime abstractions for the dense buffers a convolution reads and writes.
//!
//! The lowering core only needs three things from a buffer runtime: the
//! extent of an axis of a live buffer, a fresh allocation of a given shape
//! and element type, and elementwise access. Buffers are `ndarray` arrays so
//! the latter two come from the array type itself; allocation goes through
//! [`TensorRuntime`] so hosts can impose their own limits.

pub mod types;

pub use types::{HostRuntime, RuntimeError, TensorDesc, TensorRuntime};
