use std::time::Duration;

/// How often the wall clock is sampled when running under a time constraint:
/// once every this many instructions.
pub const DEFAULT_TIME_GRANULARITY: u64 = 10;

/// Execution budget for one VM run. Budgets are cooperative: the instruction
/// budget is exact, the time budget is polled every few instructions to
/// amortize clock reads. `AutoContinue` additionally makes the machine run
/// through `suspend` statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraints {
    /// No limit.
    None,
    /// Stop after this many executed instructions.
    InstrCount(u64),
    /// Stop once this much wall time has passed.
    Timed {
        limit: Duration,
        /// Clock poll interval in instructions.
        granularity: u64,
    },
    /// No limit, and `suspend` statements are ignored.
    AutoContinue,
}

impl Constraints {
    /// No limit.
    #[must_use]
    pub fn none() -> Self {
        Self::None
    }

    /// Limit by executed instruction count.
    #[must_use]
    pub fn max_instructions(count: u64) -> Self {
        Self::InstrCount(count)
    }

    /// Limit by wall time, polled at the default granularity.
    #[must_use]
    pub fn max_time(limit: Duration) -> Self {
        Self::Timed {
            limit,
            granularity: DEFAULT_TIME_GRANULARITY,
        }
    }

    /// Limit by wall time with a custom poll interval.
    #[must_use]
    pub fn max_time_with_granularity(limit: Duration, granularity: u64) -> Self {
        Self::Timed {
            limit,
            granularity: granularity.max(1),
        }
    }

    /// Run through `suspend` statements without stopping.
    #[must_use]
    pub fn auto_continue() -> Self {
        Self::AutoContinue
    }

    #[must_use]
    pub fn is_auto_continue(&self) -> bool {
        matches!(self, Self::AutoContinue)
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Self::None
    }
}
