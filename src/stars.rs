//! Fixed-point star values.
//!
//! Every star rating in the system is a decimal with exactly 8 fractional
//! digits, stored as a scaled integer. Binary floats are never used: repeated
//! averaging down a delegation chain has to give identical results on every
//! platform, and two values are tied iff they are equal after quantization.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of fractional digits kept after quantization.
pub const FRACTIONAL_DIGITS: u32 = 8;

/// Scale factor for the raw representation (10^8).
const SCALE: i64 = 100_000_000;

/// Highest allowed rating (5 stars).
const MAX_RAW: i64 = 5 * SCALE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StarsError {
    #[error("star value out of range [0, 5]: {0}")]
    OutOfRange(String),

    #[error("malformed star value: {0}")]
    Malformed(String),
}

/// A star rating in `[0, 5]` with 8 fractional digits.
///
/// The raw value is `rating * 10^8`, so derived `Eq`/`Ord` compare quantized
/// values directly. Averages are computed with exact integer division and
/// rounded half-to-even at the 8th fractional digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Stars(i64);

impl Stars {
    pub const ZERO: Stars = Stars(0);
    pub const FIVE: Stars = Stars(MAX_RAW);

    /// Build from a whole number of stars, as cast on a manual ballot.
    pub fn from_whole(stars: u8) -> Result<Stars, StarsError> {
        if stars > 5 {
            return Err(StarsError::OutOfRange(stars.to_string()));
        }
        Ok(Stars(i64::from(stars) * SCALE))
    }

    /// The scaled integer value (`rating * 10^8`).
    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Arithmetic mean of a non-empty slice, quantized to 8 fractional
    /// digits with round-half-to-even. Returns `None` for an empty slice:
    /// a choice nobody rated has no average, rather than an average of zero.
    pub fn mean(values: &[Stars]) -> Option<Stars> {
        if values.is_empty() {
            return None;
        }
        let sum: i128 = values.iter().map(|v| i128::from(v.0)).sum();
        Some(Stars(div_round_half_even(sum, values.len() as i128)))
    }

    /// Mean over a fixed denominator, for score phases where a ballot
    /// missing a choice contributes 0 but still counts in the denominator.
    pub fn mean_over(values: impl Iterator<Item = Stars>, denominator: usize) -> Option<Stars> {
        if denominator == 0 {
            return None;
        }
        let sum: i128 = values.map(|v| i128::from(v.0)).sum();
        Some(Stars(div_round_half_even(sum, denominator as i128)))
    }
}

/// Exact `numerator / denominator` rounded half-to-even.
///
/// Working on the exact rational rather than a widened intermediate keeps
/// quantization a single rounding step. Requires `numerator >= 0` and
/// `denominator > 0`, which holds for every sum of ratings.
fn div_round_half_even(numerator: i128, denominator: i128) -> i64 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    let doubled = remainder * 2;
    let rounded = if doubled > denominator || (doubled == denominator && quotient % 2 != 0) {
        quotient + 1
    } else {
        quotient
    };
    rounded as i64
}

impl fmt::Display for Stars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / SCALE;
        let frac = self.0 % SCALE;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let digits = format!("{:08}", frac);
        write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
    }
}

impl FromStr for Stars {
    type Err = StarsError;

    fn from_str(s: &str) -> Result<Stars, StarsError> {
        let (whole_part, frac_part) = match s.split_once('.') {
            Some((w, fr)) => (w, fr),
            None => (s, ""),
        };
        if whole_part.is_empty()
            || !whole_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(StarsError::Malformed(s.to_string()));
        }
        if frac_part.len() > FRACTIONAL_DIGITS as usize {
            return Err(StarsError::Malformed(s.to_string()));
        }
        let whole: i64 = whole_part
            .parse()
            .map_err(|_| StarsError::Malformed(s.to_string()))?;
        let mut frac: i64 = 0;
        if !frac_part.is_empty() {
            frac = frac_part
                .parse()
                .map_err(|_| StarsError::Malformed(s.to_string()))?;
            for _ in frac_part.len()..FRACTIONAL_DIGITS as usize {
                frac *= 10;
            }
        }
        let raw = whole
            .checked_mul(SCALE)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(|| StarsError::OutOfRange(s.to_string()))?;
        if raw > MAX_RAW {
            return Err(StarsError::OutOfRange(s.to_string()));
        }
        Ok(Stars(raw))
    }
}

impl From<Stars> for String {
    fn from(value: Stars) -> String {
        value.to_string()
    }
}

impl TryFrom<String> for Stars {
    type Error = StarsError;

    fn try_from(value: String) -> Result<Stars, StarsError> {
        value.parse()
    }
}
