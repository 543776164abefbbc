//! Validated concurrency limits.

use std::{fmt, num::IntErrorKind, num::NonZeroUsize, str::FromStr};

use conv::{ConvUtil, ValueFrom};

use crate::ConfigError;

pub(crate) const DEFAULT_LIMIT: usize = 3;

/// A concurrency limit: the maximum number of jobs allowed to run at once.
///
/// Always at least 1. Construct one with [Limit::new], or convert from an integer, float or string
/// using [TryFrom] / [FromStr], which reject anything that isn't a positive integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Limit(NonZeroUsize);

impl Limit {
    /// Returns `None` if `limit` is zero.
    pub fn new(limit: usize) -> Option<Self> {
        NonZeroUsize::new(limit).map(Self)
    }

    /// The limit as a plain integer.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl Default for Limit {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT).expect("default limit should be positive")
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<NonZeroUsize> for Limit {
    fn from(limit: NonZeroUsize) -> Self {
        Self(limit)
    }
}

impl TryFrom<usize> for Limit {
    type Error = ConfigError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Limit::new(value).ok_or_else(|| ConfigError::NotPositive(value.to_string()))
    }
}

macro_rules! limit_from_int {
    ($($t:ty),*) => {
        $(
            impl TryFrom<$t> for Limit {
                type Error = ConfigError;

                #[allow(unused_comparisons)]
                fn try_from(value: $t) -> Result<Self, Self::Error> {
                    if value <= 0 {
                        return Err(ConfigError::NotPositive(value.to_string()));
                    }
                    let limit = usize::value_from(value)
                        .map_err(|_| ConfigError::TooLarge(value.to_string()))?;

                    Limit::try_from(limit)
                }
            }
        )*
    };
}

limit_from_int!(i32, i64, u32, u64);

impl TryFrom<f64> for Limit {
    type Error = ConfigError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value.fract() != 0.0 {
            return Err(ConfigError::NotAnInteger(value.to_string()));
        }
        if value <= 0.0 {
            return Err(ConfigError::NotPositive(value.to_string()));
        }
        let limit = value
            .approx_as::<usize>()
            .map_err(|_| ConfigError::TooLarge(value.to_string()))?;

        Limit::try_from(limit)
    }
}

impl FromStr for Limit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.parse::<i64>() {
            Ok(value) => Limit::try_from(value),
            Err(e) => Err(match e.kind() {
                IntErrorKind::PosOverflow => ConfigError::TooLarge(s.to_owned()),
                IntErrorKind::NegOverflow => ConfigError::NotPositive(s.to_owned()),
                _ => ConfigError::NotAnInteger(s.to_owned()),
            }),
        }
    }
}

impl TryFrom<&str> for Limit {
    type Error = ConfigError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_three() {
        assert_eq!(Limit::default().get(), 3);
    }

    #[test]
    fn accepts_positive_integers() {
        assert_eq!(Limit::try_from(5usize).unwrap().get(), 5);
        assert_eq!(Limit::try_from(7i64).unwrap().get(), 7);
        assert_eq!(Limit::try_from(2.0f64).unwrap().get(), 2);
        assert_eq!(" +4 ".parse::<Limit>().unwrap().get(), 4);
    }

    #[test]
    fn rejects_zero_and_negatives() {
        assert_eq!(
            Limit::try_from(0usize),
            Err(ConfigError::NotPositive("0".into()))
        );
        assert_eq!(
            Limit::try_from(-5i32),
            Err(ConfigError::NotPositive("-5".into()))
        );
        assert_eq!(
            "-99999999999999999999".parse::<Limit>(),
            Err(ConfigError::NotPositive("-99999999999999999999".into()))
        );
    }

    #[test]
    fn rejects_non_integers() {
        assert!(matches!(
            Limit::try_from(2.5f64),
            Err(ConfigError::NotAnInteger(_))
        ));
        assert!(matches!(
            Limit::try_from(f64::NAN),
            Err(ConfigError::NotAnInteger(_))
        ));
        assert!(matches!(
            Limit::try_from(f64::INFINITY),
            Err(ConfigError::NotAnInteger(_))
        ));
        assert_eq!(
            "abc".parse::<Limit>(),
            Err(ConfigError::NotAnInteger("abc".into()))
        );
        assert!(matches!(
            "5.0".parse::<Limit>(),
            Err(ConfigError::NotAnInteger(_))
        ));
    }

    #[test]
    fn rejects_overflow() {
        assert!(matches!(
            "99999999999999999999".parse::<Limit>(),
            Err(ConfigError::TooLarge(_))
        ));
        assert!(matches!(
            Limit::try_from(1e30),
            Err(ConfigError::TooLarge(_))
        ));
    }
}
