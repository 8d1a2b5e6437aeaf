use std::fmt;
use std::str::from_utf8;

// ice-chars minus '+' and '/' so the values are safe in any signaling channel.
const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Random identifier of `L` ascii characters.
pub struct Id<const L: usize>([u8; L]);

impl<const L: usize> Id<L> {
    pub fn random_with(rng: &mut fastrand::Rng) -> Id<L> {
        let mut x = [0; L];
        for val in x.iter_mut() {
            *val = CHARS[rng.usize(..CHARS.len())];
        }
        Id(x)
    }
}

impl<const L: usize> fmt::Display for Id<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = from_utf8(&self.0).expect("ascii characters");
        write!(f, "{s}")
    }
}
