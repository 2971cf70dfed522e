/// Hybrid logical clock timestamp: a wall-clock component paired with a
/// logical counter that breaks ties within one wall-clock tick.
///
/// The derived ordering compares `real` first, then `logic`, which is the
/// key order used by timestamp lookups and trims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hlc {
    pub real: u64,
    pub logic: u64,
}

impl Hlc {
    pub const ZERO: Hlc = Hlc { real: 0, logic: 0 };

    pub fn new(real: u64, logic: u64) -> Self {
        Hlc { real, logic }
    }
}

impl std::fmt::Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.real, self.logic)
    }
}
