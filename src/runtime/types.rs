//! Shared runtime surface types for buffer backends.

use std::fmt;

use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::types::{DType, Element};

/// Shape and element type of a dense, row-major buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorDesc {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Self { shape, dtype }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .shape
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x");
        write!(f, "{}<{}>", self.dtype.as_str(), dims)
    }
}

/// Structured runtime error for buffer backends.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// Requested element type does not match the buffer element type.
    #[error("dtype mismatch: requested {requested:?}, buffer holds {actual:?}")]
    DTypeMismatch { requested: DType, actual: DType },
    /// Allocation exceeds the configured element budget.
    #[error("allocation of {requested} elements exceeds limit of {limit}")]
    AllocationTooLarge { requested: usize, limit: usize },
    /// Freshly allocated buffer is not contiguous in row-major order.
    #[error("buffer is not contiguous in standard layout")]
    NonContiguous,
}

/// Buffer allocation capability consumed by the executor.
pub trait TensorRuntime {
    /// Allocate a zero-initialised buffer matching `desc`.
    fn allocate<T: Element>(&self, desc: &TensorDesc) -> Result<ArrayD<T>, RuntimeError>;

    /// Run-time extent of `axis` of a live buffer.
    fn extent<T>(&self, buffer: &ArrayViewD<'_, T>, axis: usize) -> Option<usize> {
        buffer.shape().get(axis).copied()
    }
}

/// Host-memory runtime backed by `ndarray` allocations.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostRuntime {
    /// Optional cap on the number of elements of one allocation.
    pub max_elements: Option<usize>,
}

impl HostRuntime {
    pub fn with_limit(max_elements: usize) -> Self {
        Self {
            max_elements: Some(max_elements),
        }
    }
}

impl TensorRuntime for HostRuntime {
    fn allocate<T: Element>(&self, desc: &TensorDesc) -> Result<ArrayD<T>, RuntimeError> {
        if desc.dtype != T::DTYPE {
            return Err(RuntimeError::DTypeMismatch {
                requested: desc.dtype,
                actual: T::DTYPE,
            });
        }
        if let Some(limit) = self.max_elements {
            let requested = desc.num_elements();
            if requested > limit {
                return Err(RuntimeError::AllocationTooLarge { requested, limit });
            }
        }
        Ok(ArrayD::<T>::zeros(IxDyn(&desc.shape)))
    }
}
