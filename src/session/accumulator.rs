//! Per-query fragment reassembly
//!
//! Fragments of one answer are keyed by `subBatchSerial` and joined in
//! ascending order once every part has arrived; arrival order is irrelevant.
//! The part count is taken from the first fragment and then frozen.

use std::collections::BTreeMap;
use tracing::warn;

use crate::protocol::{QueryResult, ResponseFragment};

/// Outcome of feeding one fragment
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// More fragments are needed
    Pending,
    /// Every part arrived
    Complete(QueryResult),
    /// The service reported that the query produced no batches
    Empty,
}

/// Collects the fragments of a single correlation id
#[derive(Debug)]
pub struct FragmentAccumulator {
    request_id: String,
    expected: Option<i64>,
    fragments: BTreeMap<i64, ResponseFragment>,
}

impl FragmentAccumulator {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            expected: None,
            fragments: BTreeMap::new(),
        }
    }

    /// Part count learned from the first fragment
    pub fn expected(&self) -> Option<i64> {
        self.expected
    }

    /// Distinct sequence numbers received so far
    pub fn received(&self) -> usize {
        self.fragments.len()
    }

    /// Feed one fragment and report whether the answer is now complete.
    pub fn push(&mut self, fragment: ResponseFragment) -> Progress {
        let expected = match self.expected {
            Some(expected) => {
                if fragment.total_sub_batches != expected {
                    warn!(
                        request_id = %self.request_id,
                        expected,
                        hint = fragment.total_sub_batches,
                        "Fragment carries a different part count, keeping the first"
                    );
                }
                expected
            }
            None => {
                if fragment.total_batches <= 0 || fragment.total_sub_batches < 0 {
                    return Progress::Empty;
                }
                self.expected = Some(fragment.total_sub_batches);
                fragment.total_sub_batches
            }
        };

        let serial = fragment.sub_batch_serial;
        if self.fragments.insert(serial, fragment).is_some() {
            warn!(
                request_id = %self.request_id,
                serial,
                "Sequence number received twice, keeping the latest"
            );
        }

        // A part count of 0 means this fragment is the whole answer.
        if expected == 0 {
            return Progress::Complete(self.assemble(0));
        }

        // Serials are opaque ordering keys (the service numbers them from 1),
        // so completion counts distinct serials rather than checking 0..expected.
        if self.fragments.len() as i64 >= expected {
            return Progress::Complete(self.assemble(expected));
        }

        Progress::Pending
    }

    fn assemble(&mut self, expected: i64) -> QueryResult {
        let fragments = std::mem::take(&mut self.fragments);
        let count = fragments.len();

        let mut result = QueryResult {
            message_type: String::new(),
            request_id: self.request_id.clone(),
            total_batches: 0,
            total_sub_batches: expected,
            cache_info: None,
            fragments: count,
            data: Vec::new(),
        };

        for (_, fragment) in fragments {
            result.message_type = fragment.message_type;
            result.total_batches = fragment.total_batches;
            if fragment.cache_info.is_some() {
                result.cache_info = fragment.cache_info;
            }
            result.data.extend(fragment.data);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Row;
    use serde_json::json;

    fn row(v: i64) -> Row {
        let mut row = Row::new();
        row.insert("v".into(), json!(v));
        row
    }

    fn fragment(serial: i64, total: i64, values: &[i64]) -> ResponseFragment {
        ResponseFragment {
            message_type: "DATA".into(),
            request_id: "req".into(),
            batch_serial: 1,
            total_batches: 1,
            split_serial: 1,
            total_split_serials: 1,
            cache_info: None,
            sub_batch_serial: serial,
            total_sub_batches: total,
            data: values.iter().copied().map(row).collect(),
        }
    }

    fn values(result: &QueryResult) -> Vec<i64> {
        result
            .data
            .iter()
            .map(|r| r["v"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut acc = FragmentAccumulator::new("req");
        assert_eq!(acc.push(fragment(2, 3, &[5, 6])), Progress::Pending);
        assert_eq!(acc.expected(), Some(3));
        assert_eq!(acc.push(fragment(0, 3, &[1, 2])), Progress::Pending);

        match acc.push(fragment(1, 3, &[3, 4])) {
            Progress::Complete(result) => {
                assert_eq!(values(&result), vec![1, 2, 3, 4, 5, 6]);
                assert_eq!(result.fragments, 3);
                assert_eq!(result.total_sub_batches, 3);
                assert_eq!(result.request_id, "req");
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_one_based_serials_complete() {
        let mut acc = FragmentAccumulator::new("req");
        assert_eq!(acc.push(fragment(2, 2, &[3])), Progress::Pending);

        match acc.push(fragment(1, 2, &[1, 2])) {
            Progress::Complete(result) => {
                assert_eq!(values(&result), vec![1, 2, 3]);
                assert_eq!(result.fragments, 2);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_hint_completes_immediately() {
        let mut acc = FragmentAccumulator::new("req");
        match acc.push(fragment(0, 0, &[7])) {
            Progress::Complete(result) => {
                assert_eq!(values(&result), vec![7]);
                assert_eq!(result.fragments, 1);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_batches_is_empty() {
        let mut acc = FragmentAccumulator::new("req");
        let mut first = fragment(0, 2, &[]);
        first.total_batches = 0;
        assert_eq!(acc.push(first), Progress::Empty);

        let mut acc = FragmentAccumulator::new("req");
        assert_eq!(acc.push(fragment(0, -1, &[])), Progress::Empty);
    }

    #[test]
    fn test_duplicate_serial_last_write_wins() {
        let mut acc = FragmentAccumulator::new("req");
        assert_eq!(acc.push(fragment(0, 2, &[1])), Progress::Pending);
        assert_eq!(acc.push(fragment(0, 2, &[9])), Progress::Pending);
        assert_eq!(acc.received(), 1);

        match acc.push(fragment(1, 2, &[2])) {
            Progress::Complete(result) => assert_eq!(values(&result), vec![9, 2]),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_part_count_frozen_after_first_fragment() {
        let mut acc = FragmentAccumulator::new("req");
        assert_eq!(acc.push(fragment(0, 2, &[1])), Progress::Pending);
        // A later fragment claiming five parts does not extend the wait
        assert!(matches!(
            acc.push(fragment(1, 5, &[2])),
            Progress::Complete(_)
        ));
    }

    #[test]
    fn test_cache_info_carried_into_result() {
        let mut acc = FragmentAccumulator::new("req");
        let mut first = fragment(0, 2, &[1]);
        first.cache_info = Some("HIT".into());
        acc.push(first);

        match acc.push(fragment(1, 2, &[2])) {
            Progress::Complete(result) => assert_eq!(result.cache_info.as_deref(), Some("HIT")),
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
