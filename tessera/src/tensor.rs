//! Tensor trait definition

use crate::dtype::DType;

/// Minimal shape/dtype view shared by every tensor-like type in the crate.
///
/// Named protocol tensors and backend buffers implement this so validation
/// code can reason about them uniformly.
pub trait Tensor {
    /// Returns the shape of the tensor as a slice of dimensions
    fn shape(&self) -> &[usize];

    /// Returns the data type of tensor elements
    fn dtype(&self) -> DType;

    /// Returns the total number of elements in the tensor
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns the size of the tensor data in bytes
    fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }
}
