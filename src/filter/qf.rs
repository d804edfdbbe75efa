//! Quotient filter: a compact approximate-membership structure.
//!
//! Each of the `2^q` slots is a single `u64` word: four metadata bits in the
//! low nibble, the fingerprint remainder in the upper 60 bits. A key hashes
//! to a 64-bit fingerprint whose low `q` bits pick the canonical slot
//! (the quotient) and whose upper bits are stored as the remainder.
//! Remainders with the same quotient form a *run*; overlapping runs pushed
//! right by collisions form a *cluster*. Runs inside a cluster appear in
//! ascending quotient order, and remainders inside a run are kept sorted,
//! which keeps lookups short and replica slot arrays bitwise identical.
//!
//! The whole slot array sits behind one reader-writer lock. Inserts and
//! removals shift elements across arbitrary slot ranges, so any finer
//! striping would have to serialize shifts that cross stripe boundaries
//! anyway; the single lock keeps every multi-slot mutation atomic with
//! respect to readers.

use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::hash::murmur3_x64_128_first;

const OCCUPIED: u64 = 1 << 0;
const RUN_START: u64 = 1 << 1;
const RUN_END: u64 = 1 << 2;
const SHIFTED: u64 = 1 << 3;

/// An element is stored in a slot iff one of these flags is set. The
/// `occupied` bit belongs to the canonical index and says nothing about
/// what the slot physically holds.
const ELEMENT: u64 = RUN_START | RUN_END | SHIFTED;

const REMAINDER_SHIFT: u32 = 4;

/// Smallest supported quotient width.
pub const MIN_LOG_SIZE: u32 = 4;
/// Largest supported quotient width.
pub const MAX_LOG_SIZE: u32 = 32;

const FILTER_SEED: u32 = 0;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("filter is full")]
    Full,

    #[error("log size {0} outside supported range [{MIN_LOG_SIZE}, {MAX_LOG_SIZE}]")]
    LogSize(u32),

    #[error("snapshot encode failed: {0}")]
    SnapshotEncode(String),

    #[error("snapshot decode failed: {0}")]
    SnapshotDecode(String),
}

/// What an insert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The fingerprint was already stored; the filter is unchanged.
    AlreadyPresent,
}

/// Thread-safe quotient filter.
///
/// Readers (`exists`, `count`) take the read lock; writers (`insert`,
/// `remove`, `restore`) take the write lock. `snapshot` holds the read lock
/// for the duration of encoding, so writers queue behind it.
pub struct QuotientFilter {
    inner: RwLock<Slots>,
}

/// The slot array plus its bookkeeping, serialized wholesale into snapshots.
#[derive(Serialize, Deserialize)]
struct Slots {
    data: Vec<u64>,
    mask: u64,
    quotient_bits: u32,
    count: u64,
}

impl QuotientFilter {
    /// Creates an empty filter with `2^log_size` slots.
    pub fn new(log_size: u32) -> Result<Self, FilterError> {
        Ok(Self {
            inner: RwLock::new(Slots::new(log_size)?),
        })
    }

    /// Inserts a key. Idempotent: re-inserting a stored fingerprint leaves
    /// the filter untouched. Fails with [`FilterError::Full`] when all
    /// `2^q` slots hold fingerprints and the key is new.
    pub fn insert(&self, key: &[u8]) -> Result<InsertOutcome, FilterError> {
        let mut slots = self.inner.write();
        let (quotient, remainder) = slots.fingerprint(key);
        slots.insert_fp(quotient, remainder)
    }

    /// Approximate membership test. Returns the verdict and the time spent
    /// probing (lock wait included).
    pub fn exists(&self, key: &[u8]) -> (bool, Duration) {
        let start = Instant::now();
        let slots = self.inner.read();
        let (quotient, remainder) = slots.fingerprint(key);
        let found = slots.contains_fp(quotient, remainder);
        (found, start.elapsed())
    }

    /// Removes a key's fingerprint. Returns true iff a slot was cleared.
    /// A colliding key that shares the fingerprint is removed with it;
    /// that is inherent to storing truncated fingerprints.
    pub fn remove(&self, key: &[u8]) -> bool {
        let mut slots = self.inner.write();
        let (quotient, remainder) = slots.fingerprint(key);
        slots.remove_fp(quotient, remainder)
    }

    /// Number of distinct fingerprints currently stored.
    pub fn count(&self) -> u64 {
        self.inner.read().count
    }

    /// Total slot capacity (`2^q`).
    pub fn capacity(&self) -> u64 {
        self.inner.read().capacity()
    }

    /// Current quotient width.
    pub fn log_size(&self) -> u32 {
        self.inner.read().quotient_bits
    }

    /// Encodes the full filter state into a gzip-wrapped byte stream.
    pub fn snapshot(&self) -> Result<Vec<u8>, FilterError> {
        let slots = self.inner.read();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        bincode::serialize_into(&mut encoder, &*slots)
            .map_err(|e| FilterError::SnapshotEncode(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| FilterError::SnapshotEncode(e.to_string()))
    }

    /// Decodes a snapshot stream and replaces the filter state in one step.
    /// Takes the write lock, so all readers and writers are quiesced for
    /// the swap.
    pub fn restore(&self, stream: &[u8]) -> Result<(), FilterError> {
        let decoder = GzDecoder::new(stream);
        let restored: Slots = bincode::deserialize_from(decoder)
            .map_err(|e| FilterError::SnapshotDecode(e.to_string()))?;
        restored.validate()?;
        *self.inner.write() = restored;
        Ok(())
    }
}

impl Slots {
    fn new(log_size: u32) -> Result<Self, FilterError> {
        if !(MIN_LOG_SIZE..=MAX_LOG_SIZE).contains(&log_size) {
            return Err(FilterError::LogSize(log_size));
        }
        let size = 1usize << log_size;
        Ok(Self {
            data: vec![0; size],
            mask: size as u64 - 1,
            quotient_bits: log_size,
            count: 0,
        })
    }

    fn validate(&self) -> Result<(), FilterError> {
        if !(MIN_LOG_SIZE..=MAX_LOG_SIZE).contains(&self.quotient_bits)
            || self.data.len() != 1usize << self.quotient_bits
            || self.mask != self.data.len() as u64 - 1
            || self.count > self.data.len() as u64
        {
            return Err(FilterError::SnapshotDecode(
                "inconsistent filter dimensions".to_string(),
            ));
        }
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.mask + 1
    }

    fn fingerprint(&self, key: &[u8]) -> (u64, u64) {
        let h = murmur3_x64_128_first(key, FILTER_SEED);
        (h & self.mask, h >> self.quotient_bits)
    }

    #[inline]
    fn inc(&self, i: u64) -> u64 {
        (i + 1) & self.mask
    }

    #[inline]
    fn dec(&self, i: u64) -> u64 {
        i.wrapping_sub(1) & self.mask
    }

    #[inline]
    fn word(&self, i: u64) -> u64 {
        self.data[i as usize]
    }

    #[inline]
    fn has_element(&self, i: u64) -> bool {
        self.word(i) & ELEMENT != 0
    }

    #[inline]
    fn is_occupied(&self, i: u64) -> bool {
        self.word(i) & OCCUPIED != 0
    }

    #[inline]
    fn is_run_start(&self, i: u64) -> bool {
        self.word(i) & RUN_START != 0
    }

    #[inline]
    fn is_run_end(&self, i: u64) -> bool {
        self.word(i) & RUN_END != 0
    }

    #[inline]
    fn is_shifted(&self, i: u64) -> bool {
        self.word(i) & SHIFTED != 0
    }

    #[inline]
    fn remainder(&self, i: u64) -> u64 {
        self.word(i) >> REMAINDER_SHIFT
    }

    /// Physical slot where `quotient`'s run starts, or where it would start
    /// if the quotient gained its first element.
    ///
    /// Walks back to the cluster start (the first unshifted slot), then
    /// pairs runs with occupied canonical indices while walking forward:
    /// the k-th run in a cluster belongs to the k-th set occupied bit.
    fn run_start_slot(&self, quotient: u64) -> u64 {
        let mut canonical = quotient;
        while self.is_shifted(canonical) {
            canonical = self.dec(canonical);
        }

        let mut slot = canonical;
        while canonical != quotient {
            // Skip the run anchored at this canonical index.
            while !self.is_run_end(slot) {
                slot = self.inc(slot);
            }
            slot = self.inc(slot);

            // Advance to the next canonical index owning a run, stopping
            // at the requested quotient either way.
            canonical = self.inc(canonical);
            while canonical != quotient && !self.is_occupied(canonical) {
                canonical = self.inc(canonical);
            }
        }
        slot
    }

    fn contains_fp(&self, quotient: u64, remainder: u64) -> bool {
        if !self.is_occupied(quotient) {
            return false;
        }
        let mut slot = self.run_start_slot(quotient);
        loop {
            let stored = self.remainder(slot);
            if stored == remainder {
                return true;
            }
            // Runs are sorted ascending, so walking past the target
            // remainder settles the question early.
            if stored > remainder || self.is_run_end(slot) {
                return false;
            }
            slot = self.inc(slot);
        }
    }

    fn insert_fp(&mut self, quotient: u64, remainder: u64) -> Result<InsertOutcome, FilterError> {
        // Fast path: the canonical slot is free and owns no run yet.
        if !self.is_occupied(quotient) && !self.has_element(quotient) {
            self.data[quotient as usize] =
                (remainder << REMAINDER_SHIFT) | OCCUPIED | RUN_START | RUN_END;
            self.count += 1;
            return Ok(InsertOutcome::Inserted);
        }

        let run_exists = self.is_occupied(quotient);
        let start = self.run_start_slot(quotient);

        // Find the sorted position inside the run, answering membership on
        // the way.
        let mut pos = start;
        let mut displaced_run_start = false;
        let mut old_run_end = None;
        if run_exists {
            loop {
                let stored = self.remainder(pos);
                if stored == remainder {
                    return Ok(InsertOutcome::AlreadyPresent);
                }
                if stored > remainder {
                    displaced_run_start = pos == start;
                    break;
                }
                if self.is_run_end(pos) {
                    old_run_end = Some(pos);
                    pos = self.inc(pos);
                    break;
                }
                pos = self.inc(pos);
            }
        }

        if self.count == self.capacity() {
            return Err(FilterError::Full);
        }

        if self.has_element(pos) {
            self.shift_right_from(pos);
        }

        let mut word = remainder << REMAINDER_SHIFT;
        if !run_exists {
            word |= RUN_START | RUN_END;
        } else if displaced_run_start {
            // The new smallest remainder heads the run; the old head just
            // moved one slot right and becomes a continuation.
            word |= RUN_START;
            let next = self.inc(pos);
            self.data[next as usize] &= !RUN_START;
        } else if let Some(end) = old_run_end {
            // Appended past the old tail.
            word |= RUN_END;
            self.data[end as usize] &= !RUN_END;
        }
        if pos != quotient {
            word |= SHIFTED;
        }

        self.data[pos as usize] = (self.word(pos) & OCCUPIED) | word;
        self.data[quotient as usize] |= OCCUPIED;
        self.count += 1;
        Ok(InsertOutcome::Inserted)
    }

    /// Opens a hole at `pos` by moving every element up to the next free
    /// slot one position right. Run flags travel with their element; the
    /// occupied bits stay put because they describe canonical indices.
    fn shift_right_from(&mut self, pos: u64) {
        let mut free = pos;
        while self.has_element(free) {
            free = self.inc(free);
        }
        while free != pos {
            let prev = self.dec(free);
            let payload = self.word(prev) & !OCCUPIED;
            self.data[free as usize] = (self.word(free) & OCCUPIED) | payload | SHIFTED;
            self.data[prev as usize] &= OCCUPIED;
            free = prev;
        }
    }

    fn remove_fp(&mut self, quotient: u64, remainder: u64) -> bool {
        if !self.is_occupied(quotient) {
            return false;
        }
        let start = self.run_start_slot(quotient);
        let mut pos = start;
        loop {
            let stored = self.remainder(pos);
            if stored == remainder {
                break;
            }
            if stored > remainder || self.is_run_end(pos) {
                return false;
            }
            pos = self.inc(pos);
        }

        let was_start = self.is_run_start(pos);
        let was_end = self.is_run_end(pos);

        if was_start && was_end {
            // The run dies with its only element.
            self.data[quotient as usize] &= !OCCUPIED;
        } else if was_end {
            let prev = self.dec(pos);
            self.data[prev as usize] |= RUN_END;
        }

        // Pull the rest of the cluster one slot left over the hole. The
        // shift stops at the first empty or unshifted slot: an unshifted
        // element sits at its canonical index and must not move.
        let mut run_quotient = quotient;
        let mut promote_next = was_start && !was_end;
        let mut hole = pos;
        loop {
            let next = self.inc(hole);
            if !self.has_element(next) || !self.is_shifted(next) {
                self.data[hole as usize] &= OCCUPIED;
                break;
            }

            if self.is_run_start(next) {
                // Crossing into the cluster's next run; find its quotient.
                run_quotient = self.inc(run_quotient);
                while !self.is_occupied(run_quotient) {
                    run_quotient = self.inc(run_quotient);
                }
            }

            let mut payload = self.word(next) & !OCCUPIED;
            if promote_next {
                payload |= RUN_START;
                promote_next = false;
            }
            if hole == run_quotient {
                payload &= !SHIFTED;
            } else {
                payload |= SHIFTED;
            }
            self.data[hole as usize] = (self.word(hole) & OCCUPIED) | payload;
            hole = next;
        }

        self.count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashSet;

    fn le_bytes(n: u64) -> [u8; 8] {
        n.to_le_bytes()
    }

    fn distinct_random_keys(rng: &mut StdRng, n: usize) -> Vec<u64> {
        let mut seen = HashSet::with_capacity(n);
        while seen.len() < n {
            seen.insert(rng.gen::<u64>());
        }
        seen.into_iter().collect()
    }

    #[test]
    fn basic_membership() {
        let qf = QuotientFilter::new(10).unwrap();

        for item in [1u64, 100, 1000, 10_000, 100_000] {
            qf.insert(&le_bytes(item)).unwrap();
            let (found, _) = qf.exists(&le_bytes(item));
            assert!(found, "item {item} should exist");
        }

        for item in [2u64, 200, 2000, 20_000, 200_000] {
            let (found, _) = qf.exists(&le_bytes(item));
            assert!(!found, "item {item} should not exist");
        }
    }

    #[test]
    fn duplicate_inserts_do_not_grow_count() {
        let qf = QuotientFilter::new(8).unwrap();

        assert_eq!(qf.insert(b"test").unwrap(), InsertOutcome::Inserted);
        assert_eq!(qf.insert(b"test").unwrap(), InsertOutcome::AlreadyPresent);
        assert_eq!(qf.count(), 1);

        qf.insert(b"different").unwrap();
        assert_eq!(qf.count(), 2);

        assert!(qf.exists(b"test").0);
        assert!(qf.exists(b"different").0);
    }

    #[test]
    fn fills_to_capacity_then_rejects() {
        let mut rng = StdRng::seed_from_u64(0x5107);
        let qf = QuotientFilter::new(8).unwrap();
        let capacity = qf.capacity();

        let keys = distinct_random_keys(&mut rng, capacity as usize);
        let mut stored = 0u64;
        for &key in &keys {
            if qf.insert(&le_bytes(key)).unwrap() == InsertOutcome::Inserted {
                stored += 1;
            }
        }
        assert_eq!(qf.count(), stored);

        // Top up in case of fingerprint collisions among the random keys,
        // then the next fresh key must be refused.
        while qf.count() < capacity {
            let _ = qf.insert(&le_bytes(rng.gen()));
        }
        for _ in 0..64 {
            match qf.insert(&le_bytes(rng.gen())) {
                Err(FilterError::Full) => {
                    assert_eq!(qf.count(), capacity);
                    return;
                }
                Ok(InsertOutcome::AlreadyPresent) => continue,
                other => panic!("expected filter-full, got {other:?}"),
            }
        }
        panic!("full filter kept accepting keys");
    }

    #[test]
    fn no_false_negatives_at_half_load() {
        let mut rng = StdRng::seed_from_u64(0xf11e);
        let qf = QuotientFilter::new(14).unwrap();
        let n = (qf.capacity() / 2) as usize;

        let keys = distinct_random_keys(&mut rng, n);
        for &key in &keys {
            qf.insert(&le_bytes(key)).unwrap();
        }

        let misses = keys
            .iter()
            .filter(|&&key| !qf.exists(&le_bytes(key)).0)
            .count();
        let rate = misses as f64 / n as f64;
        assert!(rate <= 0.01, "false negative rate {rate:.4} above 1%");
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut rng = StdRng::seed_from_u64(0xfa15e);
        let qf = QuotientFilter::new(10).unwrap();
        let n = (qf.capacity() / 2) as usize;

        let keys = distinct_random_keys(&mut rng, n);
        let inserted: HashSet<u64> = keys.iter().copied().collect();
        for &key in &keys {
            qf.insert(&le_bytes(key)).unwrap();
        }

        let probes = 10_000;
        let mut false_positives = 0;
        let mut tested = 0;
        while tested < probes {
            let candidate: u64 = rng.gen();
            if inserted.contains(&candidate) {
                continue;
            }
            tested += 1;
            if qf.exists(&le_bytes(candidate)).0 {
                false_positives += 1;
            }
        }
        let rate = false_positives as f64 / probes as f64;
        assert!(rate <= 0.01, "false positive rate {rate:.4} above 1%");
    }

    #[test]
    fn overflow_keeps_recall() {
        let mut rng = StdRng::seed_from_u64(0x0f10);
        let qf = QuotientFilter::new(14).unwrap();
        let capacity = qf.capacity() as usize;

        let keys = distinct_random_keys(&mut rng, capacity);
        let mut stored: Vec<u64> = Vec::with_capacity(capacity);
        for &key in &keys {
            if qf.insert(&le_bytes(key)).is_ok() {
                stored.push(key);
            }
        }

        // Push 25% past capacity; the overflow must be refused without
        // disturbing what is already stored.
        for _ in 0..capacity / 4 {
            let key: u64 = rng.gen();
            if qf.insert(&le_bytes(key)).is_ok() {
                stored.push(key);
            }
        }

        let found = stored
            .iter()
            .filter(|&&key| qf.exists(&le_bytes(key)).0)
            .count();
        let recall = found as f64 / stored.len() as f64;
        assert!(recall >= 0.95, "recall {recall:.4} below 95%");
    }

    #[test]
    fn extreme_keys() {
        let qf = QuotientFilter::new(10).unwrap();
        qf.insert(&le_bytes(0)).unwrap();
        qf.insert(&le_bytes(u64::MAX)).unwrap();
        assert!(qf.exists(&le_bytes(0)).0);
        assert!(qf.exists(&le_bytes(u64::MAX)).0);
    }

    #[test]
    fn remove_clears_and_preserves_neighbors() {
        let qf = QuotientFilter::new(4).unwrap();
        let items: Vec<String> = (1..=10).map(|i| format!("item{i}")).collect();

        for item in &items {
            qf.insert(item.as_bytes()).unwrap();
        }
        for item in &items {
            assert!(qf.exists(item.as_bytes()).0, "{item} missing after insert");
        }

        for item in items.iter().step_by(2) {
            assert!(qf.remove(item.as_bytes()), "failed to remove {item}");
        }

        // Odd-indexed survivors must still be found; a removed fingerprint
        // may linger only through a collision with a survivor.
        for item in items.iter().skip(1).step_by(2) {
            assert!(qf.exists(item.as_bytes()).0, "{item} lost by removal");
        }
        assert!(qf.count() <= items.len() as u64);
    }

    #[test]
    fn remove_bookkeeping() {
        let qf = QuotientFilter::new(8).unwrap();

        assert!(!qf.remove(b"absent"), "removing an absent key must be false");
        assert_eq!(qf.count(), 0);

        qf.insert(b"alpha").unwrap();
        qf.insert(b"beta").unwrap();
        assert_eq!(qf.count(), 2);

        assert!(qf.remove(b"alpha"));
        assert_eq!(qf.count(), 1);
        assert!(!qf.exists(b"alpha").0);
        assert!(qf.exists(b"beta").0);

        assert!(!qf.remove(b"alpha"), "double remove must be a no-op");
        assert_eq!(qf.count(), 1);
    }

    #[test]
    fn remove_inside_collision_runs() {
        // A tiny filter forces long shared clusters, exercising run-start
        // promotion, run-end demotion and cross-run shifts.
        let mut rng = StdRng::seed_from_u64(0xdead);
        let qf = QuotientFilter::new(5).unwrap();

        let keys = distinct_random_keys(&mut rng, 24);
        let mut stored = Vec::new();
        for &key in &keys {
            if qf.insert(&le_bytes(key)).is_ok() {
                stored.push(key);
            }
        }

        let (removed, kept): (Vec<u64>, Vec<u64>) =
            stored.iter().partition(|&&k| k % 2 == 0);
        for &key in &removed {
            qf.remove(&le_bytes(key));
        }
        for &key in &kept {
            assert!(
                qf.exists(&le_bytes(key)).0,
                "survivor {key} lost during removals"
            );
        }
    }

    #[test]
    fn snapshot_roundtrip_is_bitwise_identical() {
        let mut rng = StdRng::seed_from_u64(0x54a9);
        let qf = QuotientFilter::new(10).unwrap();
        for key in distinct_random_keys(&mut rng, 400) {
            qf.insert(&le_bytes(key)).unwrap();
        }

        let stream = qf.snapshot().unwrap();
        let other = QuotientFilter::new(4).unwrap();
        other.restore(&stream).unwrap();

        assert_eq!(other.count(), qf.count());
        assert_eq!(other.log_size(), qf.log_size());
        let a = qf.inner.read();
        let b = other.inner.read();
        assert_eq!(a.data, b.data);
        assert_eq!(a.mask, b.mask);
    }

    #[test]
    fn restore_rejects_garbage() {
        let qf = QuotientFilter::new(8).unwrap();
        assert!(matches!(
            qf.restore(b"not a snapshot"),
            Err(FilterError::SnapshotDecode(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_log_size() {
        assert!(matches!(QuotientFilter::new(3), Err(FilterError::LogSize(3))));
        assert!(matches!(
            QuotientFilter::new(33),
            Err(FilterError::LogSize(33))
        ));
    }
}
