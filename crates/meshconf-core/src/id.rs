//! Random 64-bit identifiers for conferences and participants.

/// Returns a uniformly random 64-bit identifier.
pub fn random_id() -> u64 {
    rand::random::<u64>()
}

/// Returns a random identifier that is never zero.
///
/// Zero is kept free so it can stand for "no conference yet" in logs and
/// snapshots.
pub fn random_nonzero_id() -> u64 {
    loop {
        let id = random_id();
        if id != 0 {
            return id;
        }
    }
}
