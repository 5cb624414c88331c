//! Id filters applied during search.
//!
//! A filter decides which inner ids may appear in a result set. Rejected ids
//! still participate in graph traversal (their neighbors are explored), so
//! a restrictive filter does not strand the search in a filtered-out region.

use crate::InnerId;

/// Pure predicate over inner ids.
pub trait IdFilter: Sync {
    /// Whether `inner_id` may appear in the result set.
    fn allows(&self, inner_id: InnerId) -> bool;
}

/// Simple function-based filter.
pub struct FnFilter<F: Fn(InnerId) -> bool + Sync>(pub F);

impl<F: Fn(InnerId) -> bool + Sync> IdFilter for FnFilter<F> {
    fn allows(&self, inner_id: InnerId) -> bool {
        self.0(inner_id)
    }
}

/// Always-pass filter (no filtering).
pub struct NoFilter;

impl IdFilter for NoFilter {
    fn allows(&self, _inner_id: InnerId) -> bool {
        true
    }
}
