//! Device tensor handles and the double-buffer used for every stateful field.
//!
//! Storage is owned by a [`ComputeBackend`](crate::backend::ComputeBackend);
//! the types here are small `Copy` handles that name a slot in that storage.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Width/height of a 2D neuron field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    /// The degenerate 1x1 extent fed to the top layer as feedback.
    pub const UNIT: Extent = Extent {
        width: 1,
        height: 1,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn area(self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Shape of a plain 2D field of this extent.
    pub fn field(self) -> Shape {
        Shape::new(self, 1)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Extent plus a per-unit depth.
///
/// Depth 1 is a neuron field. Weight fields carry one entry per receptive
/// field tap and are stored unit-major: all taps of a unit are contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub extent: Extent,
    pub depth: u32,
}

impl Shape {
    pub const fn new(extent: Extent, depth: u32) -> Self {
        Self { extent, depth }
    }

    #[inline]
    pub fn len(self) -> usize {
        self.extent.area() * self.depth as usize
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn index(self, x: u32, y: u32, k: u32) -> usize {
        (x as usize + y as usize * self.extent.width as usize) * self.depth as usize + k as usize
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.depth == 1 {
            write!(f, "{}", self.extent)
        } else {
            write!(f, "{}x{}", self.extent, self.depth)
        }
    }
}

/// Handle to a backend-owned tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tensor {
    id: u32,
    shape: Shape,
}

impl Tensor {
    /// Only backends mint handles.
    pub(crate) fn new(id: u32, shape: Shape) -> Self {
        Self { id, shape }
    }

    #[inline]
    pub fn id(self) -> u32 {
        self.id
    }

    #[inline]
    pub fn shape(self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn extent(self) -> Extent {
        self.shape.extent
    }

    #[inline]
    pub fn len(self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.shape.is_empty()
    }
}

/// Two tensors of one shape with a parity bit selecting which one is current.
///
/// Kernels write `current()` and read `previous()`. `swap()` promotes the
/// freshly written buffer to `previous` for the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleBuffer {
    slots: [Tensor; 2],
    parity: u8,
}

impl DoubleBuffer {
    pub fn new(first: Tensor, second: Tensor) -> Self {
        debug_assert_eq!(first.shape(), second.shape());
        Self {
            slots: [first, second],
            parity: 0,
        }
    }

    #[inline]
    pub fn current(&self) -> Tensor {
        self.slots[self.parity as usize]
    }

    #[inline]
    pub fn previous(&self) -> Tensor {
        self.slots[(self.parity ^ 1) as usize]
    }

    #[inline]
    pub fn swap(&mut self) {
        self.parity ^= 1;
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.slots[0].shape()
    }

    /// Puts `tensor` in the `previous` role and returns the tensor it displaced.
    pub fn replace_previous(&mut self, tensor: Tensor) -> Tensor {
        debug_assert_eq!(tensor.shape(), self.shape());
        let slot = (self.parity ^ 1) as usize;
        std::mem::replace(&mut self.slots[slot], tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> DoubleBuffer {
        let shape = Extent::new(3, 2).field();
        DoubleBuffer::new(Tensor::new(0, shape), Tensor::new(1, shape))
    }

    #[test]
    fn swap_exchanges_roles() {
        let mut buf = pair();
        let (cur, prev) = (buf.current(), buf.previous());
        buf.swap();
        assert_eq!(buf.current(), prev);
        assert_eq!(buf.previous(), cur);
    }

    #[test]
    fn double_swap_restores_identities() {
        let mut buf = pair();
        let before = buf;
        buf.swap();
        buf.swap();
        assert_eq!(buf, before);
    }

    #[test]
    fn replace_previous_keeps_current() {
        let mut buf = pair();
        let cur = buf.current();
        let other = Tensor::new(9, buf.shape());
        let old = buf.replace_previous(other);
        assert_eq!(old.id(), 1);
        assert_eq!(buf.previous(), other);
        assert_eq!(buf.current(), cur);
    }

    #[test]
    fn unit_major_indexing() {
        let shape = Shape::new(Extent::new(4, 3), 9);
        assert_eq!(shape.len(), 108);
        assert_eq!(shape.index(0, 0, 0), 0);
        assert_eq!(shape.index(1, 0, 0), 9);
        assert_eq!(shape.index(0, 1, 2), 38);
        assert_eq!(shape.index(3, 2, 8), 107);
    }
}
