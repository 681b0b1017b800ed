use std::fmt;

use crate::error::{ErrorKind, EvalError, EvalResult};

/// A lazy ordered sequence of integers: `from`, `from + step`, ... up to and
/// including `to` (in step direction).
///
/// `step == 0` is rejected, and the direction of `to - from` must agree with
/// the sign of `step`. A sequence always contains at least one element
/// (`from` itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerSequence {
    from: i64,
    to: i64,
    step: i64,
    current: i64,
}

impl IntegerSequence {
    pub fn new(from: i64, to: i64, step: i64) -> EvalResult<Self> {
        if step == 0 {
            return Err(EvalError::new(
                ErrorKind::OutOfRange,
                "IntegerSequence with step 0 is invalid",
            ));
        }
        if (to >= from) != (step > 0) && to != from {
            return Err(EvalError::new(
                ErrorKind::OutOfRange,
                format!("IntegerSequence direction mismatch: from {from} to {to} step {step}"),
            ));
        }
        Ok(Self {
            from,
            to,
            step,
            current: from,
        })
    }

    #[must_use]
    pub fn from(&self) -> i64 {
        self.from
    }

    #[must_use]
    pub fn to(&self) -> i64 {
        self.to
    }

    #[must_use]
    pub fn step(&self) -> i64 {
        self.step
    }

    /// The element the iteration currently points at.
    #[must_use]
    pub fn current(&self) -> i64 {
        self.current
    }

    /// Rewinds to the first element.
    pub fn reset(&mut self) {
        self.current = self.from;
    }

    /// Advances to the next element. Returns `false` when the sequence is
    /// exhausted (current stays on the last valid element).
    pub fn next(&mut self) -> bool {
        let Some(next) = self.current.checked_add(self.step) else {
            return false;
        };
        let in_range = if self.step > 0 { next <= self.to } else { next >= self.to };
        if in_range {
            self.current = next;
        }
        in_range
    }

    /// Number of elements the sequence produces.
    #[must_use]
    pub fn len(&self) -> u64 {
        let span = self.to.abs_diff(self.from);
        span / self.step.unsigned_abs() + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false // a valid sequence always yields `from`
    }
}

impl fmt::Display for IntegerSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_seq({}, {}, {})", self.from, self.to, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_step() {
        assert_eq!(
            IntegerSequence::new(0, 10, 0).unwrap_err().kind(),
            ErrorKind::OutOfRange
        );
    }

    #[test]
    fn rejects_direction_mismatch() {
        assert!(IntegerSequence::new(0, 10, -1).is_err());
        assert!(IntegerSequence::new(10, 0, 1).is_err());
        // single element sequences work with either sign
        assert!(IntegerSequence::new(5, 5, -3).is_ok());
    }

    #[test]
    fn iterates_inclusive_with_step() {
        let mut seq = IntegerSequence::new(0, 10, 3).unwrap();
        let mut got = vec![seq.current()];
        while seq.next() {
            got.push(seq.current());
        }
        assert_eq!(got, vec![0, 3, 6, 9]);
        assert_eq!(seq.len(), 4);
        seq.reset();
        assert_eq!(seq.current(), 0);
    }

    #[test]
    fn iterates_downwards() {
        let mut seq = IntegerSequence::new(3, 1, -1).unwrap();
        let mut got = vec![seq.current()];
        while seq.next() {
            got.push(seq.current());
        }
        assert_eq!(got, vec![3, 2, 1]);
    }
}
