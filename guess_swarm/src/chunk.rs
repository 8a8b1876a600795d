use std::cmp::Ordering;

use crate::error::{ChunkErrorKind, ChunkResult};

/// Identity of whatever currently owns a `Busy` interval (a download attempt).
pub type OwnerId = u64;

/// Status of a byte interval within a `ChunkMap`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Status {
    Empty,
    Busy,
    Done,
    /// Returned only from range queries that straddle more than one status;
    /// never stored as an interval's own status.
    Overlap,
}

/// A single half-open byte interval `[from, to)` together with its status and,
/// for `Busy` intervals, the download currently reserving it.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Interval {
    from: u64,
    to: u64,
    status: Status,
    owner: Option<OwnerId>,
}

impl Interval {
    fn new(from: u64, to: u64, status: Status, owner: Option<OwnerId>) -> Interval {
        Interval {
            from,
            to,
            status,
            owner,
        }
    }

    pub fn from(&self) -> u64 {
        self.from
    }

    pub fn to(&self) -> u64 {
        self.to
    }

    pub fn len(&self) -> u64 {
        self.to - self.from
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    fn mergeable_with(&self, other: &Interval) -> bool {
        self.status == other.status && self.owner == other.owner && self.to == other.from
    }
}

/// An ordered, non-overlapping set of intervals spanning `[0, size)`, used to
/// track which byte ranges of a downloading file are empty, reserved by a
/// source, or already on disk.
///
/// Invariant upheld by every public mutator: the interval list stays sorted
/// by `from`, pairwise disjoint, and always covers exactly `[0, size)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkMap {
    size: Option<u64>,
    intervals: Vec<Interval>,
}

impl ChunkMap {
    /// Create a `ChunkMap` for a file of known `size`, entirely `Empty`.
    pub fn new(size: u64) -> ChunkMap {
        let intervals = if size == 0 {
            Vec::new()
        } else {
            vec![Interval::new(0, size, Status::Empty, None)]
        };

        ChunkMap {
            size: Some(size),
            intervals,
        }
    }

    /// Create a `ChunkMap` for a file whose size is not yet known. No holes
    /// can be allocated until `lock_size` is called.
    pub fn new_size_unknown() -> ChunkMap {
        ChunkMap {
            size: None,
            intervals: Vec::new(),
        }
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn is_size_known(&self) -> bool {
        self.size.is_some()
    }

    /// Lock in the size of a previously size-unknown file, truncating the
    /// map to `[0, size)`. Any reservation extending past `size` is clipped;
    /// returns the set of owners whose reservation was clipped so the caller
    /// can fail those sources.
    pub fn lock_size(&mut self, size: u64) -> ChunkResult<Vec<OwnerId>> {
        if self.size.is_some() {
            return Err(ChunkErrorKind::SizeAlreadyKnown { size: self.size.unwrap() }.into());
        }

        self.size = Some(size);
        if self.intervals.is_empty() {
            self.intervals.push(Interval::new(0, size, Status::Empty, None));
            return Ok(Vec::new());
        }

        let mut truncated_owners = Vec::new();
        let mut new_intervals = Vec::new();
        for interval in self.intervals.drain(..) {
            if interval.from >= size {
                if let Some(owner) = interval.owner {
                    truncated_owners.push(owner);
                }
                continue;
            }
            if interval.to > size {
                if let Some(owner) = interval.owner {
                    truncated_owners.push(owner);
                }
                new_intervals.push(Interval::new(interval.from, size, interval.status, interval.owner));
            } else {
                new_intervals.push(interval);
            }
        }

        let covered_to = new_intervals.last().map(|i| i.to).unwrap_or(0);
        if covered_to < size {
            new_intervals.push(Interval::new(covered_to, size, Status::Empty, None));
        }

        self.intervals = new_intervals;
        self.merge_adjacent();

        Ok(truncated_owners)
    }

    /// Select an `Empty` interval for `owner` to fetch: the largest `Empty`
    /// interval, ties broken by lowest offset. The chosen range is reserved
    /// as `Busy` for `owner` before being returned.
    pub fn find_hole(&mut self, owner: OwnerId) -> Option<(u64, u64)> {
        let best = self
            .intervals
            .iter()
            .enumerate()
            .filter(|(_, i)| i.status == Status::Empty)
            .max_by(|(_, a), (_, b)| match a.len().cmp(&b.len()) {
                Ordering::Equal => b.from.cmp(&a.from),
                other => other,
            })
            .map(|(index, i)| (index, i.from, i.to));

        let (index, from, to) = best?;
        self.intervals[index] = Interval::new(from, to, Status::Busy, Some(owner));
        self.merge_adjacent();

        Some((from, to))
    }

    /// Select the largest intersection between an `Empty` interval we hold
    /// and a remote's advertised `ranges` (each half-open and sorted).
    pub fn find_available_hole(&mut self, owner: OwnerId, ranges: &[(u64, u64)]) -> Option<(u64, u64)> {
        let mut best: Option<(u64, u64)> = None;

        for interval in self.intervals.iter().filter(|i| i.status == Status::Empty) {
            for &(r_from, r_to) in ranges {
                let from = interval.from.max(r_from);
                let to = interval.to.min(r_to);
                if from >= to {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((b_from, b_to)) => (to - from) > (b_to - b_from),
                };
                if better {
                    best = Some((from, to));
                }
            }
        }

        let (from, to) = best?;
        self.update(owner, from, to, Status::Busy);

        Some((from, to))
    }

    /// Classify the status of `[from, to)`: `Done` iff fully covered by
    /// `Done`, `Busy` iff any part is `Busy`, `Empty` iff entirely `Empty`,
    /// else `Overlap`.
    pub fn chunk_status(&self, from: u64, to: u64) -> Status {
        let mut seen_done = false;
        let mut seen_busy = false;
        let mut seen_empty = false;

        for interval in self.intervals.iter() {
            let overlap_from = interval.from.max(from);
            let overlap_to = interval.to.min(to);
            if overlap_from >= overlap_to {
                continue;
            }
            match interval.status {
                Status::Done => seen_done = true,
                Status::Busy => seen_busy = true,
                Status::Empty => seen_empty = true,
                Status::Overlap => unreachable!("Overlap is never stored"),
            }
        }

        match (seen_done, seen_busy, seen_empty) {
            (true, false, false) => Status::Done,
            (false, true, false) => Status::Busy,
            (false, false, true) => Status::Empty,
            _ => Status::Overlap,
        }
    }

    /// Classify the status at a single byte offset.
    pub fn pos_status(&self, pos: u64) -> Option<Status> {
        self.intervals
            .iter()
            .find(|i| i.from <= pos && pos < i.to)
            .map(|i| i.status)
    }

    /// Overwrite `[from, to)` with `new_status` under `owner`. Marking a
    /// range `Done` releases any `Busy` reservation over the same range
    /// regardless of which owner held it.
    pub fn update(&mut self, owner: OwnerId, from: u64, to: u64, new_status: Status) {
        if from >= to {
            return;
        }

        let mut new_intervals = Vec::with_capacity(self.intervals.len() + 2);
        for interval in self.intervals.iter() {
            if interval.to <= from || interval.from >= to {
                new_intervals.push(*interval);
                continue;
            }

            if interval.from < from {
                new_intervals.push(Interval::new(interval.from, from, interval.status, interval.owner));
            }

            let owner_for_new = if new_status == Status::Busy { Some(owner) } else { None };
            let overlap_from = interval.from.max(from);
            let overlap_to = interval.to.min(to);
            new_intervals.push(Interval::new(overlap_from, overlap_to, new_status, owner_for_new));

            if interval.to > to {
                new_intervals.push(Interval::new(to, interval.to, interval.status, interval.owner));
            }
        }

        new_intervals.sort_by_key(|i| i.from);
        self.intervals = new_intervals;
        self.merge_adjacent();
    }

    /// Normalize the interval list: merge adjacent intervals sharing the
    /// same `(status, owner)`.
    pub fn merge_adjacent(&mut self) {
        if self.intervals.is_empty() {
            return;
        }

        self.intervals.sort_by_key(|i| i.from);

        let mut merged = Vec::with_capacity(self.intervals.len());
        let mut current = self.intervals[0];
        for &next in &self.intervals[1..] {
            if current.mergeable_with(&next) {
                current = Interval::new(current.from, next.to, current.status, current.owner);
            } else {
                merged.push(current);
                current = next;
            }
        }
        merged.push(current);

        self.intervals = merged;
    }

    /// Transition every `Done` interval back to `Empty` (used after an
    /// integrity failure forces a restart of the file).
    pub fn reset(&mut self) {
        for interval in self.intervals.iter_mut() {
            if interval.status == Status::Done {
                interval.status = Status::Empty;
                interval.owner = None;
            }
        }
        self.merge_adjacent();
    }

    /// Release every reservation held by `owner`, returning them to `Empty`.
    pub fn clear_owner(&mut self, owner: OwnerId) {
        for interval in self.intervals.iter_mut() {
            if interval.status == Status::Busy && interval.owner == Some(owner) {
                interval.status = Status::Empty;
                interval.owner = None;
            }
        }
        self.merge_adjacent();
    }

    /// Total bytes currently `Done`.
    pub fn done_bytes(&self) -> u64 {
        self.intervals
            .iter()
            .filter(|i| i.status == Status::Done)
            .map(|i| i.len())
            .sum()
    }

    /// `true` once every byte of the file is `Done`.
    pub fn is_complete(&self) -> bool {
        match self.size {
            None => false,
            Some(0) => true,
            Some(_) => self.intervals.iter().all(|i| i.status == Status::Done),
        }
    }

    /// The `Done` intervals, for upload range advertisement.
    pub fn done_ranges(&self) -> Vec<(u64, u64)> {
        self.intervals
            .iter()
            .filter(|i| i.status == Status::Done)
            .map(|i| (i.from, i.to))
            .collect()
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }
}
