//! Greedy packing of single-partition rows into entity group transactions.
//!
//! Rows are taken in order and a batch is closed as soon as the next row would
//! push it past the row count or byte bound. Not optimal, but no batch ever
//! exceeds the limits and every row lands in exactly one batch.

use crate::entity::TableEntity;
use crate::settings::BatchSettings;
use crate::store::{OperationKind, TableBatch, TableOperation};
use crate::{debug, AppError};

struct BatchAccumulator {
    max_rows: usize,
    max_bytes: usize,
    buf: Vec<TableOperation>,
    bytes: usize,
}

impl BatchAccumulator {
    fn new(max_rows: usize, max_bytes: usize) -> Self {
        Self { max_rows, max_bytes, buf: Vec::new(), bytes: 0 }
    }

    /// Returns the closed batch when `op` does not fit next to what is buffered.
    fn push(&mut self, op: TableOperation, size: usize) -> Option<(Vec<TableOperation>, usize)> {
        let projected = self.bytes.saturating_add(size);
        let closed = if !self.buf.is_empty() && (self.buf.len() == self.max_rows || projected > self.max_bytes) {
            self.take_all()
        } else {
            None
        };
        self.bytes = self.bytes.saturating_add(size);
        self.buf.push(op);
        closed
    }

    fn take_all(&mut self) -> Option<(Vec<TableOperation>, usize)> {
        if self.buf.is_empty() {
            return None;
        }
        let out = std::mem::replace(&mut self.buf, Vec::with_capacity(self.max_rows));
        let bytes = std::mem::replace(&mut self.bytes, 0);
        Some((out, bytes))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    max_rows: usize,
    max_bytes: usize,
}

impl Default for BatchPlanner {
    fn default() -> Self {
        Self::from_settings(&BatchSettings::default())
    }
}

impl BatchPlanner {
    /// # Panics
    /// When either limit is zero.
    pub fn new(max_rows: usize, max_bytes: usize) -> Self {
        assert!(max_rows > 0, "max_rows must be > 0");
        assert!(max_bytes > 0, "max_bytes must be > 0");
        Self { max_rows, max_bytes }
    }

    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self::new(settings.max_rows, settings.max_bytes)
    }

    /// All `entities` must share one partition key.
    pub fn plan(&self, entities: Vec<TableEntity>, kind: OperationKind) -> Result<Vec<TableBatch>, AppError> {
        let Some(partition_key) = entities.first().map(|e| e.partition_key.clone()) else {
            return Ok(Vec::new());
        };
        let mut acc = BatchAccumulator::new(self.max_rows, self.max_bytes);
        let mut batches = Vec::new();
        let close = |(operations, encoded_bytes): (Vec<TableOperation>, usize)| TableBatch {
            partition_key: partition_key.clone(),
            kind,
            operations,
            encoded_bytes,
        };

        for entity in entities {
            if entity.partition_key != partition_key {
                return Err(AppError::CrossPartitionBatch { expected: partition_key.clone(), found: entity.partition_key });
            }
            let op = TableOperation::new(kind, entity);
            let size = op.entity.encoded_size()?;
            if let Some(closed) = acc.push(op, size) {
                batches.push(close(closed));
            }
        }
        if let Some(tail) = acc.take_all() {
            batches.push(close(tail));
        }
        debug!("Planned {} {} batches for partition {}", batches.len(), kind, partition_key);
        Ok(batches)
    }
}
