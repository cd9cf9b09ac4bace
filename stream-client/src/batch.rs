use crate::record::{PartitionTarget, Record};

/// Frame bytes written once per batch: record count (4) and flags/reserved (4).
pub const BATCH_FRAME_OVERHEAD: usize = 8;

/// Default upper bound for a batch, matching what the stream accepts in one request.
pub const DEFAULT_MAX_BATCH_SIZE_BYTES: usize = 1024 * 1024;

/// Accumulates outbound records under a byte budget.
///
/// A record is either wholly included or rejected, and a rejection leaves the builder
/// untouched. The budget covers framing overhead, so `size_bytes()` is what would go on the
/// wire and never exceeds `max_size_bytes()`.
#[derive(Debug)]
pub struct BatchBuilder {
    max_size_bytes: usize,
    size_bytes: usize,
    records: Vec<Record>,
    target: PartitionTarget,
}

impl BatchBuilder {
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            max_size_bytes,
            size_bytes: BATCH_FRAME_OVERHEAD,
            records: Vec::new(),
            target: PartitionTarget::Any,
        }
    }

    pub fn with_target(mut self, target: PartitionTarget) -> Self {
        self.target = target;
        self
    }

    /// Add a record if it fits, otherwise hand it back.
    pub fn try_add(&mut self, record: Record) -> Result<(), Record> {
        if !self.fits(&record) {
            return Err(record);
        }
        self.size_bytes += record.encoded_len();
        self.records.push(record);
        Ok(())
    }

    pub fn fits(&self, record: &Record) -> bool {
        self.size_bytes + record.encoded_len() <= self.max_size_bytes
    }

    /// Whether the record could be sent at all, even in a fresh batch.
    pub fn fits_empty(&self, record: &Record) -> bool {
        BATCH_FRAME_OVERHEAD + record.encoded_len() <= self.max_size_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn max_size_bytes(&self) -> usize {
        self.max_size_bytes
    }

    pub fn target(&self) -> &PartitionTarget {
        &self.target
    }

    /// Returns the accumulated records in insertion order and resets the builder.
    pub fn drain(&mut self) -> Vec<Record> {
        self.size_bytes = BATCH_FRAME_OVERHEAD;
        std::mem::take(&mut self.records)
    }

    /// Seal the accumulated records into a batch ready to send, resetting the builder.
    pub fn seal(&mut self) -> Batch {
        let size_bytes = self.size_bytes;
        Batch {
            records: self.drain(),
            size_bytes,
            target: self.target.clone(),
        }
    }
}

/// A sealed, size-bounded group of records sent as one network operation.
#[derive(Clone, Debug)]
pub struct Batch {
    records: Vec<Record>,
    size_bytes: usize,
    target: PartitionTarget,
}

impl Batch {
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn target(&self) -> &PartitionTarget {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RECORD_FRAME_OVERHEAD;

    fn record_of(len: usize, tag: u8) -> Record {
        Record::new(vec![tag; len])
    }

    #[test]
    fn test_accepts_3000_small_records_in_order() {
        let mut builder = BatchBuilder::new(200_000);

        for i in 0..3000u32 {
            let record = Record::new(format!("{:0>50}", i));
            assert!(builder.try_add(record).is_ok(), "record {i} should fit");
        }
        assert!(builder.size_bytes() <= builder.max_size_bytes());

        let drained = builder.drain();
        assert_eq!(drained.len(), 3000);
        for (i, record) in drained.iter().enumerate() {
            assert_eq!(record.body_as_str(), Some(format!("{:0>50}", i).as_str()));
        }
        assert!(builder.is_empty());
        assert_eq!(builder.size_bytes(), BATCH_FRAME_OVERHEAD);
    }

    #[test]
    fn test_rejection_leaves_builder_untouched() {
        let max = BATCH_FRAME_OVERHEAD + 2 * (RECORD_FRAME_OVERHEAD + 10);
        let mut builder = BatchBuilder::new(max);

        assert!(builder.try_add(record_of(10, 1)).is_ok());
        assert!(builder.try_add(record_of(10, 2)).is_ok());
        assert_eq!(builder.size_bytes(), max);

        let rejected = builder.try_add(record_of(1, 3)).unwrap_err();
        assert_eq!(rejected, record_of(1, 3));
        assert_eq!(builder.len(), 2);
        assert_eq!(builder.size_bytes(), max);
    }

    #[test]
    fn test_size_never_exceeds_maximum() {
        let mut builder = BatchBuilder::new(1_000);
        for len in (0..400).map(|i| (i * 37) % 120) {
            let accepted = builder.try_add(record_of(len, 0)).is_ok();
            assert!(
                builder.size_bytes() <= builder.max_size_bytes(),
                "len {len} accepted={accepted}"
            );
        }
        let expected: usize = BATCH_FRAME_OVERHEAD
            + builder
                .drain()
                .iter()
                .map(Record::encoded_len)
                .sum::<usize>();
        assert!(expected <= 1_000);
    }

    #[test]
    fn test_record_larger_than_budget_never_fits() {
        let builder = BatchBuilder::new(64);
        let record = record_of(64, 0);
        assert!(!builder.fits_empty(&record));
        assert!(!builder.fits(&record));
    }

    #[test]
    fn test_seal_carries_target_and_resets() {
        let mut builder = BatchBuilder::new(1_000).with_target(PartitionTarget::Id(2));
        builder.try_add(record_of(5, 0)).unwrap();

        let batch = builder.seal();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.target(), &PartitionTarget::Id(2));
        assert_eq!(batch.size_bytes(), BATCH_FRAME_OVERHEAD + RECORD_FRAME_OVERHEAD + 5);
        assert!(builder.is_empty());
        assert!(builder.seal().is_empty());
    }
}
