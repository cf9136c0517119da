//! Batch planning.
//!
//! A batch of wide entity operations is turned into backend actions up front and then
//! partitioned into transactions by recursive halving:
//!
//! ```text
//! ops:  [A B C D E F]            too large
//!        /         \
//!   [A B C]       [D E F]        [A B C] fits, [D E F] too large
//!                  /    \
//!                [D]   [E F]     both fit
//!
//! transactions: [A B C] [D] [E F]   (order preserved)
//! ```
//!
//! An operation's actions are never spread over two transactions, so every entity
//! still changes atomically.

use std::ops::Range;

use bytes::Bytes;
use harvest_table::TableAction;

use crate::error::{Error, Result};

/// Backend actions of one logical operation.
#[derive(Debug)]
pub(crate) struct PlannedWrite {
    pub actions: Vec<TableAction>,
    /// Sum of the stored entity sizes the actions transfer.
    pub data_size: usize,
    pub result: PlannedResult,
}

/// What to hand back once a planned write committed.
#[derive(Debug)]
pub(crate) enum PlannedResult {
    /// Segment 0 is the first action; its etag becomes the entity etag.
    Written {
        partition_key: String,
        row_key: String,
        segment_count: usize,
        content: Bytes,
    },
    Deleted,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchLimits {
    pub max_operations: usize,
    pub max_data_size: usize,
    pub allow_splits: bool,
    pub max_split_depth: u32,
}

/// Partition `writes` into contiguous ranges that each fit one transaction.
///
/// # Errors
///
/// `RequestTooLarge` when the batch does not fit and splitting is disallowed, when a
/// single operation does not fit on its own, or when `max_split_depth` is reached.
pub(crate) fn plan_transactions(
    writes: &[PlannedWrite],
    limits: BatchLimits,
) -> Result<Vec<Range<usize>>> {
    let mut ranges = Vec::new();
    if !writes.is_empty() {
        split(writes, 0..writes.len(), 0, limits, &mut ranges)?;
    }
    Ok(ranges)
}

fn split(
    writes: &[PlannedWrite],
    range: Range<usize>,
    depth: u32,
    limits: BatchLimits,
    out: &mut Vec<Range<usize>>,
) -> Result<()> {
    let operations: usize = writes[range.clone()].iter().map(|w| w.actions.len()).sum();
    let data_size: usize = writes[range.clone()].iter().map(|w| w.data_size).sum();
    if operations <= limits.max_operations && data_size <= limits.max_data_size {
        out.push(range);
        return Ok(());
    }

    if range.len() == 1 {
        return Err(Error::RequestTooLarge(format!(
            "one operation needs {operations} actions and {data_size} bytes, limits are {} and {}",
            limits.max_operations, limits.max_data_size
        )));
    }
    if !limits.allow_splits {
        return Err(Error::RequestTooLarge(format!(
            "batch of {} operations needs {operations} actions and {data_size} bytes and splitting is disabled",
            range.len()
        )));
    }
    if depth >= limits.max_split_depth {
        return Err(Error::RequestTooLarge(format!(
            "batch still too large after {depth} splits"
        )));
    }

    let mid = range.start + range.len() / 2;
    split(writes, range.start..mid, depth + 1, limits, out)?;
    split(writes, mid..range.end, depth + 1, limits, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_table::TableRow;

    fn write(actions: usize, data_size: usize) -> PlannedWrite {
        PlannedWrite {
            actions: (0..actions)
                .map(|i| TableAction::Add(TableRow::new("p", format!("r~{i:02}"))))
                .collect(),
            data_size,
            result: PlannedResult::Deleted,
        }
    }

    fn limits(allow_splits: bool) -> BatchLimits {
        BatchLimits {
            max_operations: 4,
            max_data_size: 100,
            allow_splits,
            max_split_depth: 16,
        }
    }

    #[test]
    fn test_fitting_batch_is_one_transaction() {
        let writes = vec![write(1, 30), write(2, 30), write(1, 40)];
        assert_eq!(plan_transactions(&writes, limits(false)).unwrap(), vec![0..3]);
    }

    #[test]
    fn test_empty_batch() {
        assert!(plan_transactions(&[], limits(true)).unwrap().is_empty());
    }

    #[test]
    fn test_split_preserves_order_and_covers_everything() {
        let writes: Vec<_> = (0..7).map(|_| write(1, 45)).collect();
        let ranges = plan_transactions(&writes, limits(true)).unwrap();
        assert!(ranges.len() >= 4);

        let mut next = 0;
        for range in &ranges {
            assert_eq!(range.start, next);
            let size: usize = writes[range.clone()].iter().map(|w| w.data_size).sum();
            assert!(size <= 100);
            next = range.end;
        }
        assert_eq!(next, writes.len());
    }

    #[test]
    fn test_split_by_action_count() {
        let writes = vec![write(3, 1), write(3, 1)];
        assert_eq!(
            plan_transactions(&writes, limits(true)).unwrap(),
            vec![0..1, 1..2]
        );
    }

    #[test]
    fn test_no_split_when_disallowed() {
        let writes = vec![write(1, 60), write(1, 60)];
        assert!(matches!(
            plan_transactions(&writes, limits(false)),
            Err(Error::RequestTooLarge(_))
        ));
    }

    #[test]
    fn test_single_oversized_operation_fails() {
        let writes = vec![write(1, 10), write(1, 500)];
        assert!(matches!(
            plan_transactions(&writes, limits(true)),
            Err(Error::RequestTooLarge(_))
        ));
    }

    #[test]
    fn test_depth_bound() {
        let writes: Vec<_> = (0..8).map(|_| write(1, 60)).collect();
        let shallow = BatchLimits {
            max_split_depth: 2,
            ..limits(true)
        };
        // Needs 3 levels of halving to isolate single writes
        assert!(matches!(
            plan_transactions(&writes, shallow),
            Err(Error::RequestTooLarge(_))
        ));
        assert_eq!(
            plan_transactions(&writes, limits(true)).unwrap().len(),
            8
        );
    }
}
