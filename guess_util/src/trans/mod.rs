mod locally_shuffled;
mod sequential;

pub use self::locally_shuffled::LocallyShuffledIds;
pub use self::sequential::SequentialIds;

/// Generates unique values of `T`, handed out one at a time.
pub trait TransactionIds<T> {
    fn generate(&mut self) -> T;
}

/// A 128 bit message unique identifier, built from two independently shuffled
/// 64 bit halves so a MUID cannot be guessed from observing a run of outgoing
/// queries (the halves wrap and reshuffle on independent schedules).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Muid([u8; 16]);

impl Muid {
    pub fn from_halves(high: u64, low: u64) -> Muid {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&high.to_be_bytes());
        bytes[8..].copy_from_slice(&low.to_be_bytes());

        Muid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Generates MUIDs for outgoing GUESS messages by composing two
/// `LocallyShuffledIds<u64>` generators, mirroring the action-id/message-id
/// split bip_dht uses to keep its transaction space collision free.
pub struct MuidGenerator {
    high: LocallyShuffledIds<u64>,
    low: LocallyShuffledIds<u64>,
}

impl MuidGenerator {
    pub fn new() -> MuidGenerator {
        MuidGenerator {
            high: LocallyShuffledIds::new(),
            low: LocallyShuffledIds::new(),
        }
    }

    pub fn generate(&mut self) -> Muid {
        Muid::from_halves(self.high.generate(), self.low.generate())
    }
}
