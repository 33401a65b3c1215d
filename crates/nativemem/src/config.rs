//! Configuration (private module)

use crate::internal_prelude::*;

/// Default worker tick
const DEFAULT_TICK: Duration = Duration::from_millis(15);

/// Default age at which a token is promoted from young to aged
const DEFAULT_YOUNG_AFTER: Duration = Duration::from_secs(10);

/// Default age at which a token is promoted from aged to old
const DEFAULT_OLD_AFTER: Duration = Duration::from_secs(60);

/// Default wait for budget, before forcing a cleanup
const DEFAULT_ALLOCATION_WAIT: Duration = Duration::from_secs(2);

/// Default bound on the cleanup forced by a starved allocation
const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);

define_derive_deftly! {
    /// Define setters on the builder for every field of type `Option<usize>` or `Option<Duration>`
    ///
    /// The field type must be spelled precisely that way:
    /// we use `approx_equal(...)`.
    BuilderSetters:

    impl ConfigBuilder {
      $(
        ${when approx_equal($ftype, { Option::<usize> })}

        ${fattrs doc}
        ///
        /// (Setter method.)
        pub fn $fname(&mut self, value: usize) -> &mut Self {
            self.$fname = Some(value);
            self
        }
      )
      $(
        ${when approx_equal($ftype, { Option::<Duration> })}

        ${fattrs doc}
        ///
        /// (Setter method.)
        pub fn $fname(&mut self, value: Duration) -> &mut Self {
            self.$fname = Some(value);
            self
        }
      )
    }
}

/// Configuration for a [`ReclamationEngine`]
///
/// This is where the native memory budget is specified.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Config {
    /// Native memory ceiling in bytes; `None` means unlimited
    ///
    /// Guaranteed not to be zero.
    pub(crate) budget: Option<usize>,

    /// Everything else, all of which can be changed at runtime
    pub(crate) timings: Timings,
}

/// Configuration for a [`ReclamationEngine`] (builder)
//
// Durations are in humantime format ("15ms", "2s", "1min").
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Default, Deftly)]
#[derive_deftly(BuilderSetters)]
pub struct ConfigBuilder {
    /// Maximum native memory outstanding at once, in bytes
    ///
    /// Allocations beyond this wait for blocks to be freed.
    /// Default is unlimited.
    #[serde(default)]
    budget: Option<usize>,

    /// How long the reclamation worker waits for a token before doing housekeeping
    ///
    /// Default is 15ms.
    #[serde(default, with = "humantime_serde::option")]
    tick: Option<Duration>,

    /// Age at which an unreclaimed token counts as aged
    ///
    /// Default is 10 seconds.
    #[serde(default, with = "humantime_serde::option")]
    young_after: Option<Duration>,

    /// Age at which an unreclaimed token counts as old
    ///
    /// Old tokens mean reclamation is not keeping up, and are logged.
    /// Default is 60 seconds.
    #[serde(default, with = "humantime_serde::option")]
    old_after: Option<Duration>,

    /// How long an allocation waits for budget before forcing a cleanup
    ///
    /// Default is 2 seconds.
    #[serde(default, with = "humantime_serde::option")]
    allocation_wait: Option<Duration>,

    /// Bound on the cleanup an allocation forces when the budget stays exhausted
    ///
    /// Default is 2 seconds.
    #[serde(default, with = "humantime_serde::option")]
    cleanup_timeout: Option<Duration>,
}

/// The parts of the configuration that can change on a running engine
///
/// Invariants: `tick` is nonzero, and `young_after < old_after`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct Timings {
    /// Worker queue wait, and idle housekeeping period
    pub(crate) tick: Duration,

    /// Promotion age, young to aged
    pub(crate) young_after: Duration,

    /// Promotion age, aged to old
    pub(crate) old_after: Duration,

    /// Allocation wait for budget
    pub(crate) allocation_wait: Duration,

    /// Bound on a cleanup forced by allocation
    pub(crate) cleanup_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            tick: DEFAULT_TICK,
            young_after: DEFAULT_YOUNG_AFTER,
            old_after: DEFAULT_OLD_AFTER,
            allocation_wait: DEFAULT_ALLOCATION_WAIT,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }
}

impl Default for Config {
    /// Unlimited budget, default timings
    fn default() -> Self {
        Config {
            budget: None,
            timings: Timings::default(),
        }
    }
}

impl Config {
    /// Start building a [`Config`]
    ///
    /// Returns a fresh default [`ConfigBuilder`].
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// The native memory ceiling in bytes, or `None` if unlimited
    pub fn budget(&self) -> Option<usize> {
        self.budget
    }

    /// Worker tick
    pub fn tick(&self) -> Duration {
        self.timings.tick
    }

    /// Maximum wait for budget, before an allocation forces a cleanup
    pub fn allocation_wait(&self) -> Duration {
        self.timings.allocation_wait
    }

    /// Bound on the cleanup forced by a starved allocation
    pub fn cleanup_timeout(&self) -> Duration {
        self.timings.cleanup_timeout
    }
}

impl ConfigBuilder {
    /// Builds a new `Config` from a builder
    ///
    /// Returns an error if the field values are invalid or inconsistent.
    pub fn build(&self) -> Result<Config, ConfigBuildError> {
        if self.budget == Some(0) {
            return Err(ConfigBuildError::Invalid {
                field: "budget".into(),
                problem: "must be nonzero (omit it for no limit)".into(),
            });
        }

        let defaults = Timings::default();
        let timings = Timings {
            tick: self.tick.unwrap_or(defaults.tick),
            young_after: self.young_after.unwrap_or(defaults.young_after),
            old_after: self.old_after.unwrap_or(defaults.old_after),
            allocation_wait: self.allocation_wait.unwrap_or(defaults.allocation_wait),
            cleanup_timeout: self.cleanup_timeout.unwrap_or(defaults.cleanup_timeout),
        };

        if timings.tick.is_zero() {
            return Err(ConfigBuildError::Invalid {
                field: "tick".into(),
                problem: "must be nonzero".into(),
            });
        }

        if timings.young_after >= timings.old_after {
            return Err(ConfigBuildError::Inconsistent {
                fields: vec!["young_after".into(), "old_after".into()],
                problem: format!(
                    "young_after ({:?}) must be less than old_after ({:?})",
                    timings.young_after, timings.old_after,
                ),
            });
        }

        Ok(Config {
            budget: self.budget,
            timings,
        })
    }
}
