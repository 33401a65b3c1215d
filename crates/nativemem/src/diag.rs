//! Diagnostics snapshots

#![forbid(unsafe_code)]

use crate::internal_prelude::*;

/// A number of blocks, and their total size in bytes
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
#[display("{count} ({bytes} bytes)")]
#[non_exhaustive]
pub struct Tally {
    /// Number of blocks
    pub count: usize,
    /// Total bytes
    pub bytes: usize,
}

/// Snapshot of a [`ReclamationEngine`]'s state
///
/// Obtained from [`ReclamationEngine::diagnostics`].
/// Everything is as of a single moment,
/// except `permits_available`, which is read separately.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub struct Diagnostics {
    /// Lifecycle state of the background worker
    pub phase: Phase,

    /// Is the worker in the middle of a burst of reclamation?
    pub processing: bool,

    /// Tokens awaiting reclamation, recently delivered
    pub young: Tally,

    /// Tokens awaiting reclamation for longer than `young_after`
    pub aged: Tally,

    /// Tokens awaiting reclamation for longer than `old_after`
    pub old: Tally,

    /// Tokens dequeued, whose native free is in progress
    pub in_flight: usize,

    /// Blocks freed by reclamation, in total
    pub disposed: Tally,

    /// Blocks freed by explicit release, in total
    pub released: Tally,

    /// Blocks allocated and not yet freed
    ///
    /// Includes blocks whose tokens are awaiting reclamation.
    pub live: Tally,

    /// Budget permits (bytes) not currently acquired
    pub permits_available: usize,

    /// Budget ceiling; `None` if unlimited
    pub permits_ceiling: Option<usize>,
}

impl Tally {
    /// Count one more block of `size` bytes
    pub(crate) fn add(&mut self, size: usize) {
        self.count += 1;
        self.bytes += size;
    }

    /// Count one fewer block of `size` bytes
    pub(crate) fn sub(&mut self, size: usize) {
        debug_assert!(self.count > 0 && self.bytes >= size, "tally underflow");
        self.count = self.count.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(size);
    }
}

impl Diagnostics {
    /// Tokens awaiting reclamation in generation `g`
    pub fn generation(&self, g: Generation) -> Tally {
        match g {
            Generation::Young => self.young,
            Generation::Aged => self.aged,
            Generation::Old => self.old,
        }
    }

    /// Tokens awaiting reclamation, in all generations
    pub fn pending(&self) -> Tally {
        Generation::ALL
            .iter()
            .map(|g| self.generation(*g))
            .fold(Tally::default(), |a, b| Tally {
                count: a.count + b.count,
                bytes: a.bytes + b.bytes,
            })
    }

    /// Are no tokens awaiting reclamation, and no free in progress?
    pub fn is_drained(&self) -> bool {
        self.pending().count == 0 && self.in_flight == 0
    }
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}; pending: young {}, aged {}, old {}; in flight {}; ",
            self.phase,
            if self.processing { " (processing)" } else { "" },
            self.young,
            self.aged,
            self.old,
            self.in_flight,
        )?;
        write!(
            f,
            "disposed {}; released {}; live {}; permits {}/",
            self.disposed, self.released, self.live, self.permits_available,
        )?;
        match self.permits_ceiling {
            Some(ceiling) => write!(f, "{}", ceiling),
            None => write!(f, "unlimited"),
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use serde_json::json;

    fn example() -> Diagnostics {
        Diagnostics {
            phase: Phase::Running,
            processing: true,
            young: Tally { count: 2, bytes: 20 },
            aged: Tally::default(),
            old: Tally { count: 1, bytes: 5 },
            in_flight: 1,
            disposed: Tally { count: 7, bytes: 70 },
            released: Tally { count: 3, bytes: 30 },
            live: Tally { count: 4, bytes: 35 },
            permits_available: 65,
            permits_ceiling: Some(100),
        }
    }

    #[test]
    fn tally() {
        let mut t = Tally::default();
        t.add(10);
        t.add(5);
        t.sub(10);
        assert_eq!(t, Tally { count: 1, bytes: 5 });
        assert_eq!(t.to_string(), "1 (5 bytes)");
    }

    #[test]
    fn summary() {
        let d = example();
        assert_eq!(d.pending(), Tally { count: 3, bytes: 25 });
        assert!(!d.is_drained());
        assert_eq!(d.generation(Generation::Old).bytes, 5);
        assert_eq!(
            d.to_string(),
            "running (processing); pending: young 2 (20 bytes), aged 0 (0 bytes), old 1 (5 bytes); \
             in flight 1; disposed 7 (70 bytes); released 3 (30 bytes); live 4 (35 bytes); \
             permits 65/100"
        );
    }

    #[test]
    fn serialize() {
        let j = serde_json::to_value(example()).unwrap();
        assert_eq!(j["phase"], json!("running"));
        assert_eq!(j["old"], json!({ "count": 1, "bytes": 5 }));
        assert_eq!(j["permits_ceiling"], json!(100));
    }
}
