use std::num::Wrapping;
use std::ops::Add;

use num::{One, Zero};

use crate::trans::TransactionIds;

/// Generates sequentially unique ids and wraps on overflow.
pub struct SequentialIds<T> {
    next_id: T,
}

impl<T> SequentialIds<T>
where
    T: Zero,
{
    pub fn new() -> SequentialIds<T> {
        SequentialIds::start_at(T::zero())
    }

    pub fn start_at(start: T) -> SequentialIds<T> {
        SequentialIds { next_id: start }
    }
}

impl<T> TransactionIds<T> for SequentialIds<T>
where
    T: One + Clone,
    Wrapping<T>: Add<Wrapping<T>, Output = Wrapping<T>>,
{
    fn generate(&mut self) -> T {
        let curr_id = self.next_id.clone();
        self.next_id = (Wrapping(self.next_id.clone()) + Wrapping(T::one())).0;

        curr_id
    }
}
