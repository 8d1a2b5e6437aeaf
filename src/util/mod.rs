use std::time::Instant;

mod pii;
pub(crate) use pii::Pii;

pub(crate) trait Soonest {
    fn soonest(self, other: Self) -> Self;
}

impl Soonest for Option<Instant> {
    fn soonest(self, other: Self) -> Self {
        match (self, other) {
            (Some(v1), Some(v2)) => Some(v1.min(v2)),
            (None, v) | (v, None) => v,
        }
    }
}
