//! Shared primitives used by `guess_swarm` and `guess_net`.

extern crate chrono;
extern crate num;
extern crate rand;
extern crate sha1;

/// Working with and expressing SHA-1 values.
pub mod sha;

/// Byte <-> network primitive conversions used by wire codecs.
pub mod convert;

/// Address classification helpers.
pub mod net;

/// Transaction id generation (message unique identifiers, query key store keys).
pub mod trans;

/// Deterministic fixtures for dependent crates' tests.
pub mod test_support;

pub use sha::{ShaHash, SHA_HASH_LEN};

/// Applies a Fisher-Yates shuffle on the given list.
pub fn fisher_shuffle<T: Copy>(list: &mut [T]) {
    for i in 0..list.len() {
        let swap_index = (rand::random::<usize>() % (list.len() - i)) + i;

        let temp = list[i];
        list[i] = list[swap_index];
        list[swap_index] = temp;
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn positive_fisher_shuffle() {
        let mut test_slice = [1, 2, 3, 4];

        super::fisher_shuffle(&mut test_slice);

        assert!(test_slice.contains(&1));
        assert!(test_slice.contains(&2));
        assert!(test_slice.contains(&3));
        assert!(test_slice.contains(&4));
    }
}
