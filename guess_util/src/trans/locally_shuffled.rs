use std::num::Wrapping;
use std::ops::Add;

use num::{Bounded, One, Zero};

use crate::trans::{SequentialIds, TransactionIds};

const TRANSACTION_ID_PREALLOC_LEN: usize = 2048;

/// Provides transaction ids that are locally shuffled.
///
/// We compose sequential ids into a block of `TRANSACTION_ID_PREALLOC_LEN`,
/// fisher-shuffle the block, and hand out ids from it in order. When the
/// block is exhausted we repeat. This keeps ids unique over a long span
/// while making them unguessable from a short run of observed traffic.
pub struct LocallyShuffledIds<T> {
    sequential: SequentialIds<T>,
    stored_ids: Vec<T>,
}

impl<T> LocallyShuffledIds<T>
where
    T: One + Zero + Clone + Copy + Eq + Bounded + Default,
    Wrapping<T>: Add<Wrapping<T>, Output = Wrapping<T>>,
{
    pub fn new() -> LocallyShuffledIds<T> {
        LocallyShuffledIds::start_at(T::zero())
    }

    pub fn start_at(start: T) -> LocallyShuffledIds<T> {
        LocallyShuffledIds {
            sequential: SequentialIds::start_at(start),
            stored_ids: Vec::new(),
        }
    }

    fn refill_stored_ids(&mut self) {
        self.stored_ids.clear();

        let max_value = T::max_value();
        let min_value = T::min_value();

        let mut contains_min_value = false;
        let mut contains_max_value = false;

        let mut num_ids_generated = 0;
        while num_ids_generated < TRANSACTION_ID_PREALLOC_LEN
            && (!contains_min_value || !contains_max_value)
        {
            let next_id = self.sequential.generate();

            contains_min_value = contains_min_value || next_id == min_value;
            contains_max_value = contains_max_value || next_id == max_value;

            self.stored_ids.push(next_id);
            num_ids_generated += 1;
        }

        crate::fisher_shuffle(&mut self.stored_ids[..]);
    }
}

impl<T> TransactionIds<T> for LocallyShuffledIds<T>
where
    T: One + Zero + Clone + Copy + Eq + Bounded + Default,
    Wrapping<T>: Add<Wrapping<T>, Output = Wrapping<T>>,
{
    fn generate(&mut self) -> T {
        self.stored_ids.pop().unwrap_or_else(|| {
            self.refill_stored_ids();

            self.generate()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::LocallyShuffledIds;
    use crate::trans::TransactionIds;

    #[test]
    fn positive_single_prealloc_u8_overflow() {
        let u8_num_values = 2u32.pow(0u8.count_zeros()) as usize;
        let duplicates_to_find = super::TRANSACTION_ID_PREALLOC_LEN / u8_num_values;

        let mut generator = LocallyShuffledIds::<u8>::new();
        let mut tid_count = vec![0u8; u8_num_values];

        for tid in (0..super::TRANSACTION_ID_PREALLOC_LEN).map(|_| generator.generate()) {
            tid_count[tid as usize] += 1;
        }

        for count in tid_count.iter() {
            assert_eq!(*count, duplicates_to_find as u8);
        }
    }

    #[test]
    fn positive_single_prealloc_u32_no_overflow() {
        let mut generator = LocallyShuffledIds::<u32>::new();
        let mut tid_count = [0u8; super::TRANSACTION_ID_PREALLOC_LEN];

        for tid in (0..super::TRANSACTION_ID_PREALLOC_LEN).map(|_| generator.generate()) {
            tid_count[tid as usize] += 1;
        }

        for count in tid_count.iter() {
            assert_eq!(*count, 1);
        }
    }

    #[test]
    fn positive_multiple_prealloc_u32_no_overflow() {
        let mut generator = LocallyShuffledIds::<u32>::new();
        let mut tid_count = [0u8; super::TRANSACTION_ID_PREALLOC_LEN * 2];

        for tid in (0..(super::TRANSACTION_ID_PREALLOC_LEN * 2)).map(|_| generator.generate()) {
            tid_count[tid as usize] += 1;
        }

        for count in tid_count.iter() {
            assert_eq!(*count, 1);
        }
    }
}
