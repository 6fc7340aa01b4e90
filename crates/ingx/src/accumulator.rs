//! 🧺 The Batch Accumulator: a shopping cart with a weight limit and a bouncer.
//!
//! Records go in one at a time. When the cart is full by count or by (estimated) bytes,
//! it says so, and the caller must [`flush`](BatchAccumulator::flush) before adding more.
//! Order is preserved, no record is ever split, and a single record bigger than the byte
//! limit still gets a batch of its own rather than being turned away at the door.
//!
//! 🔒 The bouncer part: while a batch is in flight, its document ids are on a list. A
//! record whose id is on that list is [`Blocked`](Admission::Blocked) until the batch
//! resolves, so two submissions of the same document never race each other.

use std::collections::HashSet;

use crate::common::{Batch, Record};

/// 🚦 What happened when you tried to add a record.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// ✅ In the cart, and there's still room.
    Accepted,
    /// 🧺 The cart is full; flush it.
    ///
    /// `None`: your record made it in and filled the cart.
    /// `Some(record)`: your record didn't fit. Here it is back. Flush, then re-add it.
    BatchFull(Option<Record>),
    /// 🔒 That document id is in an in-flight batch. Wait for it to resolve, then re-add.
    Blocked(Record),
}

/// 🧺 Collects records into bounded batches.
#[derive(Debug)]
pub struct BatchAccumulator {
    max_records: usize,
    max_bytes: usize,
    records: Vec<Record>,
    bytes: usize,
    next_seq: u64,
    in_flight: HashSet<String>,
}

impl BatchAccumulator {
    /// 🏗️ Limits are clamped to at least 1 so a zero can't wedge the pipeline.
    pub fn new(max_records: usize, max_bytes: usize) -> Self {
        let max_records = max_records.max(1);
        Self {
            max_records,
            max_bytes: max_bytes.max(1),
            records: Vec::with_capacity(max_records.min(4096)),
            bytes: 0,
            next_seq: 1,
            in_flight: HashSet::new(),
        }
    }

    /// ➕ Offer a record to the current batch.
    pub fn add(&mut self, record: Record) -> Admission {
        if self.is_in_flight(record.id()) {
            return Admission::Blocked(record);
        }
        if self.is_full() {
            return Admission::BatchFull(Some(record));
        }

        let record_bytes = record.estimated_bytes();
        if !self.records.is_empty() && self.bytes + record_bytes > self.max_bytes {
            return Admission::BatchFull(Some(record));
        }

        self.bytes += record_bytes;
        self.records.push(record);

        if self.is_full() {
            Admission::BatchFull(None)
        } else {
            Admission::Accepted
        }
    }

    /// 🧺 Either limit reached. A lone oversized record counts as full.
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_records || self.bytes >= self.max_bytes
    }

    /// 🗑️ Hand over whatever is in the cart as a numbered [`Batch`]. `None` if empty.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut self.records);
        self.bytes = 0;
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(Batch::new(seq, records))
    }

    /// 📋 Records waiting in the current, unflushed batch.
    pub fn pending_len(&self) -> usize {
        self.records.len()
    }

    /// 📏 Estimated bytes of that same batch.
    pub fn pending_bytes(&self) -> usize {
        self.bytes
    }

    /// 🗑️ Throw away the unflushed batch and return how many records were in it.
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.records.len();
        self.records.clear();
        self.bytes = 0;
        discarded
    }

    /// 🔒 Put every id in `batch` on the in-flight list.
    pub fn mark_in_flight(&mut self, batch: &Batch) {
        self.in_flight
            .extend(batch.records().iter().map(|r| r.id().to_string()));
    }

    /// 🔓 Take ids off the in-flight list once their batch has resolved.
    pub fn release<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        for id in ids {
            self.in_flight.remove(id);
        }
    }

    /// 🔒 Is a batch carrying `id` still out with the workers?
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(row: u64) -> Record {
        Record::new(
            row,
            vec![
                ("id".to_string(), Some(format!("doc-{row}"))),
                ("v".to_string(), Some("x".repeat(10))),
            ],
            Some("id"),
        )
    }

    /// 🔄 The loop every caller writes: add, flush on full, re-add the bounced record.
    fn drain(acc: &mut BatchAccumulator, n: u64) -> Vec<Batch> {
        let mut batches = Vec::new();
        for row in 1..=n {
            let mut next = Some(record(row));
            while let Some(rec) = next.take() {
                match acc.add(rec) {
                    Admission::Accepted => {}
                    Admission::BatchFull(bounced) => {
                        batches.extend(acc.flush());
                        next = bounced;
                    }
                    Admission::Blocked(_) => panic!("💀 nothing is in flight in this test"),
                }
            }
        }
        batches.extend(acc.flush());
        batches
    }

    #[test]
    fn the_one_where_batch_count_is_ceil_n_over_b() {
        for (n, b) in [(0u64, 3usize), (1, 3), (3, 3), (4, 3), (10, 1), (1200, 500), (999, 100)] {
            let mut acc = BatchAccumulator::new(b, usize::MAX);
            let batches = drain(&mut acc, n);
            let expected = (n as usize).div_ceil(b);
            assert_eq!(batches.len(), expected, "n={n} b={b}");

            // 🎯 no loss, no duplication, source order intact
            let rows: Vec<u64> = batches
                .iter()
                .flat_map(|batch| batch.records().iter().map(Record::row))
                .collect();
            assert_eq!(rows, (1..=n).collect::<Vec<_>>(), "n={n} b={b}");
        }
    }

    #[test]
    fn the_one_where_1200_records_make_500_500_200() {
        let mut acc = BatchAccumulator::new(500, usize::MAX);
        let sizes: Vec<usize> = drain(&mut acc, 1200).iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
    }

    #[test]
    fn the_one_where_bytes_fill_up_before_the_count_does() {
        let per_record = record(1).estimated_bytes();
        let mut acc = BatchAccumulator::new(1000, per_record * 3);
        let batches = drain(&mut acc, 7);
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert!(batches.iter().all(|b| b.estimated_bytes() <= per_record * 3));
    }

    #[test]
    fn the_one_where_a_giant_record_gets_a_batch_to_itself() {
        let mut acc = BatchAccumulator::new(10, 4);
        assert_eq!(acc.add(record(1)), Admission::BatchFull(None));
        let batch = acc.flush().expect("💀 the giant should be in there");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.seq(), 1);
    }

    #[test]
    fn the_one_where_a_full_cart_hands_the_record_back() {
        let mut acc = BatchAccumulator::new(1, usize::MAX);
        assert_eq!(acc.add(record(1)), Admission::BatchFull(None));
        assert_eq!(acc.add(record(2)), Admission::BatchFull(Some(record(2))));
        assert_eq!(acc.pending_len(), 1);
    }

    #[test]
    fn the_one_where_in_flight_ids_are_held_at_the_door() {
        let mut acc = BatchAccumulator::new(2, usize::MAX);
        acc.add(record(1));
        let first = acc.flush().expect("💀 batch");
        acc.mark_in_flight(&first);
        assert!(acc.is_in_flight("doc-1"));

        assert_eq!(acc.add(record(1)), Admission::Blocked(record(1)));
        assert_eq!(acc.add(record(2)), Admission::Accepted);

        acc.release(first.records().iter().map(Record::id));
        assert!(!acc.is_in_flight("doc-1"));
        assert_eq!(acc.add(record(1)), Admission::BatchFull(None));
        assert_eq!(acc.flush().map(|b| b.seq()), Some(2));
    }

    #[test]
    fn the_one_where_flushing_an_empty_cart_is_a_no_op() {
        let mut acc = BatchAccumulator::new(5, 100);
        assert!(acc.flush().is_none());
        acc.add(record(1));
        assert_eq!(acc.discard_pending(), 1);
        assert!(acc.flush().is_none());
        assert_eq!(acc.pending_bytes(), 0);
    }
}
