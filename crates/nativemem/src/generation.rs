//! Generational buckets of delivered tokens
//!
//! Together the buckets are the reclamation queue:
//! delivery appends to the young bucket,
//! and the worker takes from the oldest end of the oldest non-empty bucket.
//! Since promotion preserves order, that is FIFO overall.
//!
//! Ages are for diagnostics.  In a healthy system tokens never get past `Young`.

#![forbid(unsafe_code)]

use crate::internal_prelude::*;

/// Age class of a token awaiting reclamation
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Generation {
    /// Recently delivered
    #[display("young")]
    Young,

    /// Waiting longer than [`young_after`](crate::ConfigBuilder::young_after)
    #[display("aged")]
    Aged,

    /// Waiting longer than [`old_after`](crate::ConfigBuilder::old_after)
    #[display("old")]
    Old,
}

/// The three buckets
///
/// Invariants:
///
///  * Within each bucket, tokens are in order of `enqueued`, oldest at the front.
///  * Every token in `Old` is at least as old as every token in `Aged`,
///    and likewise `Aged` vs `Young`.
///  * Each bucket's `tally` matches its tokens.
#[derive(Debug, Default)]
pub(crate) struct Buckets {
    /// Indexed by [`Generation::index`]
    buckets: [Bucket; 3],
}

/// One bucket
#[derive(Debug, Default)]
struct Bucket {
    /// The tokens, oldest first
    tokens: VecDeque<Token>,

    /// Count and bytes of `tokens`
    tally: Tally,
}

/// What a sweep did
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub(crate) struct Promoted {
    /// Moved from `Young` to `Aged`
    pub(crate) to_aged: Tally,

    /// Moved from `Aged` to `Old`
    pub(crate) to_old: Tally,
}

impl Generation {
    /// All generations, youngest first
    pub const ALL: [Generation; 3] = [Generation::Young, Generation::Aged, Generation::Old];

    /// Index into arrays indexed by generation
    pub(crate) fn index(self) -> usize {
        match self {
            Generation::Young => 0,
            Generation::Aged => 1,
            Generation::Old => 2,
        }
    }
}

impl Bucket {
    /// Append a token which is no older than any already here
    fn push_back(&mut self, token: Token) {
        debug_assert!(
            self.tokens
                .back()
                .is_none_or(|last| last.enqueued <= token.enqueued),
            "token delivered out of order"
        );
        self.tally.add(token.size);
        self.tokens.push_back(token);
    }

    /// Remove the oldest token
    fn pop_front(&mut self) -> Option<Token> {
        let token = self.tokens.pop_front()?;
        self.tally.sub(token.size);
        Some(token)
    }
}

impl Buckets {
    /// Deliver a token into the young bucket
    pub(crate) fn push(&mut self, token: Token) {
        self.bucket_mut(Generation::Young).push_back(token);
    }

    /// Remove the oldest token of all
    pub(crate) fn pop_oldest(&mut self) -> Option<Token> {
        Generation::ALL
            .iter()
            .rev()
            .find_map(|g| self.bucket_mut(*g).pop_front())
    }

    /// Are all the buckets empty?
    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.tokens.is_empty())
    }

    /// Count and bytes currently in generation `g`
    pub(crate) fn tally(&self, g: Generation) -> Tally {
        self.buckets[g.index()].tally
    }

    /// Promote tokens whose age has crossed a threshold
    ///
    /// Young to aged first, so that a token which has crossed both thresholds
    /// (eg, because nothing has been draining the queue) ends up old straight away.
    pub(crate) fn sweep(&mut self, now: Instant, timings: &Timings) -> Promoted {
        let to_aged = self.promote(Generation::Young, timings.young_after, now);
        let to_old = self.promote(Generation::Aged, timings.old_after, now);
        Promoted { to_aged, to_old }
    }

    /// Move tokens at least `threshold` old out of `from` and into the next generation
    ///
    /// Scans from the oldest end and stops at the first token that is young enough.
    fn promote(&mut self, from: Generation, threshold: Duration, now: Instant) -> Tally {
        let to = match from {
            Generation::Young => Generation::Aged,
            Generation::Aged | Generation::Old => Generation::Old,
        };
        let mut moved = Tally::default();
        if from == to {
            return moved;
        }
        loop {
            let src = self.bucket_mut(from);
            let Some(oldest) = src.tokens.front() else {
                break;
            };
            if oldest.age(now) < threshold {
                break;
            }
            let Some(token) = src.pop_front() else {
                break;
            };
            moved.add(token.size);
            self.bucket_mut(to).push_back(token);
        }
        moved
    }

    /// Mutable access to one bucket
    fn bucket_mut(&mut self, g: Generation) -> &mut Bucket {
        &mut self.buckets[g.index()]
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
    use itertools::Itertools;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn token(t0: Instant, at: u64, addr: usize, size: usize) -> Token {
        Token {
            address: Address::new(addr).unwrap(),
            size,
            enqueued: t0 + secs(at),
        }
    }

    fn counts(b: &Buckets) -> [usize; 3] {
        Generation::ALL.map(|g| b.tally(g).count)
    }

    fn drain(b: &mut Buckets) -> Vec<usize> {
        std::iter::from_fn(|| b.pop_oldest())
            .map(|t| t.address.get())
            .collect_vec()
    }

    #[test]
    fn fifo() {
        let t0 = Instant::now();
        let mut b = Buckets::default();
        assert!(b.is_empty());
        for i in 1..=5 {
            b.push(token(t0, i, i as usize, 10));
        }
        assert_eq!(b.tally(Generation::Young), Tally { count: 5, bytes: 50 });
        assert_eq!(drain(&mut b), [1, 2, 3, 4, 5]);
        assert!(b.is_empty());
        assert_eq!(b.tally(Generation::Young), Tally::default());
    }

    #[test]
    fn sweep() {
        let timings = Timings::default();
        let t0 = Instant::now();
        let mut b = Buckets::default();
        b.push(token(t0, 0, 1, 100));
        b.push(token(t0, 5, 2, 200));
        b.push(token(t0, 55, 3, 300));

        // Nothing old enough yet
        let p = b.sweep(t0 + secs(9), &timings);
        assert_eq!(p, Promoted::default());
        assert_eq!(counts(&b), [3, 0, 0]);

        let p = b.sweep(t0 + secs(16), &timings);
        assert_eq!(p.to_aged, Tally { count: 2, bytes: 300 });
        assert_eq!(counts(&b), [1, 2, 0]);

        let p = b.sweep(t0 + secs(61), &timings);
        assert_eq!(p.to_old, Tally { count: 1, bytes: 100 });
        assert_eq!(counts(&b), [1, 1, 1]);
        assert_eq!(b.tally(Generation::Old).bytes, 100);

        // Sweeping again at the same time changes nothing; sweeping never demotes
        assert_eq!(b.sweep(t0 + secs(61), &timings), Promoted::default());
        assert_eq!(b.sweep(t0, &timings), Promoted::default());
        assert_eq!(counts(&b), [1, 1, 1]);

        // Delivered later, still drained in delivery order
        b.push(token(t0, 70, 4, 400));
        assert_eq!(drain(&mut b), [1, 2, 3, 4]);
    }

    #[test]
    fn sweep_straight_to_old() {
        let timings = Timings::default();
        let t0 = Instant::now();
        let mut b = Buckets::default();
        b.push(token(t0, 0, 1, 1));
        b.push(token(t0, 1, 2, 1));

        let p = b.sweep(t0 + secs(3600), &timings);
        assert_eq!(p.to_aged.count, 2);
        assert_eq!(p.to_old.count, 2);
        assert_eq!(counts(&b), [0, 0, 2]);
        assert_eq!(drain(&mut b), [1, 2]);
    }

    #[test]
    fn display() {
        assert_eq!(Generation::ALL.map(|g| g.to_string()), ["young", "aged", "old"]);
    }
}
