// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capacity-bounded buffer sharded across independently locked partitions.
//!
//! Producers never block: [`PartitionedBuffer::try_add`] either places the item in
//! the first partition with spare room or hands it straight back. Consumers can poll
//! with [`PartitionedBuffer::try_take`] or wait with [`PartitionedBuffer::take`],
//! which honours a [`CancellationToken`] so shutdown and harvest timeouts never
//! strand a waiting task.
//!
//! # Layout
//!
//! ```text
//! capacity = 10, partitions = 3
//!
//!   proposed = ceil(10 / 3) = 4
//!   [ p0: 4 ][ p1: 4 ][ p2: 2 ]
//! ```
//!
//! Each partition is filled and drained first-in-first-out, but there is no
//! ordering guarantee across partitions. The live item count is tracked with an
//! atomic counter so size queries never take a lock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::BufferError;

struct Partition<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> Partition<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }
}

/// A bounded, multi-partition holding area for finished telemetry records.
///
/// Overall capacity is the sum of the partition capacities. Once accepted, an item
/// is owned by the buffer until a take operation moves it to a consumer.
pub struct PartitionedBuffer<T> {
    partitions: Vec<Partition<T>>,
    capacity: usize,
    count: AtomicUsize,
    rejected: AtomicU64,
    item_added: Notify,
}

impl<T> PartitionedBuffer<T> {
    /// Creates an empty buffer holding at most `capacity` items.
    ///
    /// Every partition is offered `ceil(capacity / partition_count)` slots, bounded by
    /// what is still unallocated, so trailing partitions absorb the remainder. Once the
    /// capacity is exhausted no further partitions are created, which means a small
    /// capacity can yield fewer than `partition_count` partitions. A capacity of zero
    /// produces a buffer with no partitions that rejects every add.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidPartitionCount`] when `partition_count` is zero.
    pub fn new(capacity: usize, partition_count: usize) -> Result<Self, BufferError> {
        if partition_count == 0 {
            return Err(BufferError::InvalidPartitionCount);
        }

        let proposed = capacity.div_ceil(partition_count);
        let mut remaining = capacity;
        let mut partitions = Vec::with_capacity(partition_count);
        while remaining > 0 && partitions.len() < partition_count {
            let size = remaining.min(proposed);
            partitions.push(Partition::new(size));
            remaining -= size;
        }

        Ok(Self {
            partitions,
            capacity,
            count: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            item_added: Notify::new(),
        })
    }

    /// Creates a buffer and seeds it from `items`, stopping at the first rejection.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidPartitionCount`] when `partition_count` is zero.
    pub fn with_items<I>(capacity: usize, partition_count: usize, items: I) -> Result<Self, BufferError>
    where
        I: IntoIterator<Item = T>,
    {
        let buffer = Self::new(capacity, partition_count)?;
        buffer.try_add_all(items);
        Ok(buffer)
    }

    /// Creates a buffer with a new layout and moves items out of `source` one at a
    /// time until the source is empty or the new buffer is full.
    ///
    /// Items that do not fit stay in `source` untouched.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidPartitionCount`] when `partition_count` is zero.
    pub fn migrate_from(
        capacity: usize,
        partition_count: usize,
        source: &PartitionedBuffer<T>,
    ) -> Result<Self, BufferError> {
        let buffer = Self::new(capacity, partition_count)?;
        let mut migrated = 0usize;

        // Check for room before taking so nothing is pulled out of the source
        // without a place to put it.
        while buffer.count() < buffer.capacity() {
            let Some(item) = source.try_take() else {
                break;
            };
            if let Err(item) = buffer.try_add(item) {
                if source.try_add(item).is_err() {
                    warn!("Unable to return item to source buffer during migration, item dropped");
                }
                break;
            }
            migrated += 1;
        }

        debug!(
            "Migrated {} items into resized buffer, {} left in source",
            migrated,
            source.count()
        );
        Ok(buffer)
    }

    /// Total number of items the buffer can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of partitions actually allocated.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Number of items currently held. Lock-free and eventually consistent.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Number of items turned away because every partition was full.
    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Places `item` in the first partition with spare room.
    ///
    /// There is no fairness across partitions. When every partition is full the item
    /// is handed back unchanged and the rejection counter is bumped so the drop stays
    /// observable.
    ///
    /// # Errors
    ///
    /// Returns the item when the buffer is saturated.
    pub fn try_add(&self, item: T) -> Result<(), T> {
        for partition in &self.partitions {
            #[allow(clippy::expect_used)]
            let mut items = partition.items.lock().expect("lock poisoned");
            if items.len() < partition.capacity {
                items.push_back(item);
                // Counted under the partition lock so a take of this item can never
                // be observed before its add.
                self.count.fetch_add(1, Ordering::AcqRel);
                drop(items);
                self.item_added.notify_waiters();
                return Ok(());
            }
        }

        self.rejected.fetch_add(1, Ordering::Relaxed);
        Err(item)
    }

    /// Adds items from `items` until the first rejection and returns how many were
    /// accepted. Partial success is expected; the rejected item and anything after it
    /// are not pulled into the buffer.
    pub fn try_add_all<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut accepted = 0;
        for item in items {
            if self.try_add(item).is_err() {
                break;
            }
            accepted += 1;
        }
        accepted
    }

    /// Removes an item from the first non-empty partition without waiting.
    pub fn try_take(&self) -> Option<T> {
        for partition in &self.partitions {
            #[allow(clippy::expect_used)]
            let mut items = partition.items.lock().expect("lock poisoned");
            if let Some(item) = items.pop_front() {
                self.count.fetch_sub(1, Ordering::AcqRel);
                return Some(item);
            }
        }
        None
    }

    /// Waits until an item is available or `cancel` fires.
    ///
    /// Returns `None` on cancellation. An item is only removed from a partition at the
    /// moment it is returned, so cancelling never loses or duplicates an item.
    pub async fn take(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let notified = self.item_added.notified();
            tokio::pin!(notified);
            // Register as a waiter before polling the partitions so an add that lands
            // between the check and the await still wakes us.
            notified.as_mut().enable();

            if let Some(item) = self.try_take() {
                return Some(item);
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                () = &mut notified => {}
            }
        }
    }

    /// Removes and returns everything currently held, partition by partition.
    pub fn drain(&self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.count());
        for partition in &self.partitions {
            #[allow(clippy::expect_used)]
            let mut items = partition.items.lock().expect("lock poisoned");
            let taken = items.len();
            drained.extend(items.drain(..));
            self.count.fetch_sub(taken, Ordering::AcqRel);
        }
        drained
    }
}

impl<T: Clone> PartitionedBuffer<T> {
    /// Returns a copy of every item currently held without removing anything.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        let mut snapshot = Vec::with_capacity(self.count());
        for partition in &self.partitions {
            #[allow(clippy::expect_used)]
            let items = partition.items.lock().expect("lock poisoned");
            snapshot.extend(items.iter().cloned());
        }
        snapshot
    }
}

impl<T> fmt::Debug for PartitionedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedBuffer")
            .field("capacity", &self.capacity)
            .field("partition_count", &self.partitions.len())
            .field("count", &self.count())
            .field("rejected", &self.rejected_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn partition_sizes<T>(buffer: &PartitionedBuffer<T>) -> Vec<usize> {
        buffer.partitions.iter().map(|p| p.capacity).collect()
    }

    #[test]
    fn test_partition_layout_absorbs_remainder() {
        let buffer = PartitionedBuffer::<u32>::new(10, 3).unwrap();
        assert_eq!(partition_sizes(&buffer), vec![4, 4, 2]);
        assert_eq!(buffer.capacity(), 10);
        assert_eq!(buffer.partition_count(), 3);
    }

    #[test]
    fn test_small_capacity_creates_fewer_partitions() {
        let buffer = PartitionedBuffer::<u32>::new(2, 3).unwrap();
        assert_eq!(partition_sizes(&buffer), vec![1, 1]);
        assert_eq!(buffer.partition_count(), 2);
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let buffer = PartitionedBuffer::new(0, 4).unwrap();
        assert_eq!(buffer.partition_count(), 0);
        assert_eq!(buffer.try_add(1), Err(1));
        assert_eq!(buffer.rejected_count(), 1);
    }

    #[test]
    fn test_zero_partitions_is_an_error() {
        assert_eq!(
            PartitionedBuffer::<u32>::new(10, 0).unwrap_err(),
            BufferError::InvalidPartitionCount
        );
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let buffer = PartitionedBuffer::new(10, 3).unwrap();
        for i in 0..10 {
            assert!(buffer.try_add(i).is_ok());
            assert!(buffer.count() <= 10);
        }
        assert_eq!(buffer.try_add(10), Err(10));
        assert_eq!(buffer.count(), 10);
        assert_eq!(buffer.rejected_count(), 1);
    }

    #[test]
    fn test_try_add_all_reports_partial_success() {
        let buffer = PartitionedBuffer::new(3, 2).unwrap();
        assert_eq!(buffer.try_add_all(0..5), 3);
        assert_eq!(buffer.count(), 3);
    }

    #[test]
    fn test_try_take_is_fifo_within_partition() {
        let buffer = PartitionedBuffer::new(4, 1).unwrap();
        buffer.try_add_all(["a", "b", "c"]);
        assert_eq!(buffer.try_take(), Some("a"));
        assert_eq!(buffer.try_take(), Some("b"));
        assert_eq!(buffer.try_take(), Some("c"));
        assert_eq!(buffer.try_take(), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_snapshot_does_not_remove() {
        let buffer = PartitionedBuffer::new(6, 3).unwrap();
        buffer.try_add_all(1..=5);
        let mut snapshot = buffer.snapshot();
        snapshot.sort_unstable();
        assert_eq!(snapshot, vec![1, 2, 3, 4, 5]);
        assert_eq!(buffer.count(), 5);
    }

    #[test]
    fn test_drain_empties_every_partition() {
        let buffer = PartitionedBuffer::new(6, 3).unwrap();
        buffer.try_add_all(1..=6);
        let drained = buffer.drain();
        assert_eq!(drained.len(), 6);
        assert_eq!(buffer.count(), 0);
        assert!(buffer.try_add(7).is_ok());
    }

    #[test]
    #[traced_test]
    fn test_migrate_leaves_overflow_in_source() {
        let source = PartitionedBuffer::new(5, 2).unwrap();
        assert_eq!(source.try_add_all(1..=5), 5);

        let destination = PartitionedBuffer::migrate_from(3, 2, &source).unwrap();

        assert_eq!(destination.count(), 3);
        assert_eq!(source.count(), 2);
        let mut all = destination.snapshot();
        all.extend(source.snapshot());
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3, 4, 5]);
        assert!(logs_contain("Migrated 3 items into resized buffer, 2 left in source"));
    }

    #[test]
    fn test_migrate_into_larger_buffer_moves_everything() {
        let source = PartitionedBuffer::new(4, 4).unwrap();
        source.try_add_all(0..4);
        let destination = PartitionedBuffer::migrate_from(8, 2, &source).unwrap();
        assert_eq!(destination.count(), 4);
        assert!(source.is_empty());
    }

    #[test]
    fn test_with_items_seeds_buffer() {
        let buffer = PartitionedBuffer::with_items(2, 1, vec![1, 2, 3]).unwrap();
        assert_eq!(buffer.count(), 2);
        assert_eq!(buffer.rejected_count(), 1);
    }

    #[tokio::test]
    async fn test_take_returns_available_item() {
        let buffer = PartitionedBuffer::new(2, 1).unwrap();
        buffer.try_add(42).unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(buffer.take(&cancel).await, Some(42));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_take_waits_for_producer() {
        let buffer = Arc::new(PartitionedBuffer::new(2, 2).unwrap());
        let cancel = CancellationToken::new();

        let consumer = {
            let buffer = Arc::clone(&buffer);
            let cancel = cancel.clone();
            tokio::spawn(async move { buffer.take(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.try_add("late").unwrap();

        let taken = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("take did not wake up")
            .unwrap();
        assert_eq!(taken, Some("late"));
    }

    #[tokio::test]
    async fn test_cancelled_take_returns_promptly_without_consuming() {
        let buffer = Arc::new(PartitionedBuffer::<u32>::new(2, 1).unwrap());
        let cancel = CancellationToken::new();

        let consumer = {
            let buffer = Arc::clone(&buffer);
            let cancel = cancel.clone();
            tokio::spawn(async move { buffer.take(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let taken = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("cancellation was not prompt")
            .unwrap();
        assert_eq!(taken, None);

        buffer.try_add(7).unwrap();
        assert_eq!(buffer.count(), 1);
        assert_eq!(buffer.try_take(), Some(7));
    }

    #[tokio::test]
    async fn test_take_with_cancelled_token_leaves_items() {
        let buffer = PartitionedBuffer::new(2, 1).unwrap();
        buffer.try_add(1).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(buffer.take(&cancel).await, None);
        assert_eq!(buffer.count(), 1);
    }

    proptest! {
        #[test]
        fn prop_count_never_exceeds_capacity(
            capacity in 0usize..64,
            partitions in 1usize..8,
            adds in 0usize..128,
        ) {
            let buffer = PartitionedBuffer::new(capacity, partitions).unwrap();
            let accepted = buffer.try_add_all(0..adds);
            prop_assert_eq!(accepted, adds.min(capacity));
            prop_assert!(buffer.count() <= capacity);
            let layout: usize = partition_sizes(&buffer).iter().sum();
            prop_assert_eq!(layout, capacity);
            prop_assert!(buffer.partition_count() <= partitions);
        }
    }
}
