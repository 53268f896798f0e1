//! Admission work classes.
//!
//! Replicated writes are throttled in two independent pools. Tokens are never
//! moved from one pool to the other.

use std::fmt;
use std::ops::{Index, IndexMut};

/// Priority class of a replicated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkClass {
    /// Latency-sensitive foreground writes.
    Regular,
    /// Background writes that tolerate throttling.
    Elastic,
}

impl WorkClass {
    /// Every work class, in index order.
    pub const ALL: [Self; 2] = [Self::Regular, Self::Elastic];

    /// Returns a stable lowercase name for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Elastic => "elastic",
        }
    }

    /// Returns the slot of this class in per-class arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Regular => 0,
            Self::Elastic => 1,
        }
    }
}

impl fmt::Display for WorkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per work class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerClass<T>([T; 2]);

impl<T> PerClass<T> {
    /// Creates a container from explicit regular and elastic values.
    #[must_use]
    pub const fn new(regular: T, elastic: T) -> Self {
        Self([regular, elastic])
    }

    /// Builds a container by calling `f` for each class.
    pub fn from_fn(mut f: impl FnMut(WorkClass) -> T) -> Self {
        Self([f(WorkClass::Regular), f(WorkClass::Elastic)])
    }

    /// Iterates over `(class, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (WorkClass, &T)> {
        WorkClass::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<WorkClass> for PerClass<T> {
    type Output = T;

    fn index(&self, class: WorkClass) -> &T {
        &self.0[class.index()]
    }
}

impl<T> IndexMut<WorkClass> for PerClass<T> {
    fn index_mut(&mut self, class: WorkClass) -> &mut T {
        &mut self.0[class.index()]
    }
}
