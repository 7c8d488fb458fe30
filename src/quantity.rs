use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

/* ============================= TYPES ============================= */

/// An exact Kubernetes resource quantity.
///
/// Stored as signed nano-units on `i128`, so decimal SI (`m`, `k`, `M`, ...)
/// and binary SI (`Ki`, `Mi`, ...) values are represented exactly and
/// addition never loses precision: `1Gi == 1024Mi`, `1G != 1Gi`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    nanos: i128,
}

const NANO: i128 = 1_000_000_000;

/// Error returned when a quantity string cannot be parsed exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseQuantityError {
    input: String,
    reason: String,
}

impl ParseQuantityError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ParseQuantityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid quantity {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for ParseQuantityError {}

/* ============================= PARSING ============================= */

impl Quantity {
    pub const fn zero() -> Self {
        Self { nanos: 0 }
    }

    pub const fn one() -> Self {
        Self { nanos: NANO }
    }

    /// Whole-unit quantity for object counts.
    pub const fn from_count(count: u64) -> Self {
        Self {
            nanos: count as i128 * NANO,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    pub fn is_negative(&self) -> bool {
        self.nanos < 0
    }

    /// Parse a quantity string: an optional sign, a decimal mantissa, and
    /// either a scientific exponent (`1e3`), a decimal SI suffix
    /// (`n u m k M G T P E`), or a binary SI suffix (`Ki Mi Gi Ti Pi Ei`).
    pub fn parse(input: &str) -> Result<Self, ParseQuantityError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(ParseQuantityError::new(input, "empty string"));
        }

        let (negative, rest) = match s.strip_prefix('-') {
            Some(r) => (true, r),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };

        let mut int_digits = String::new();
        let mut frac_digits = String::new();
        let mut chars = rest.char_indices().peekable();

        while let Some((_, c)) = chars.peek() {
            if c.is_ascii_digit() {
                int_digits.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        if let Some((_, '.')) = chars.peek() {
            chars.next();
            while let Some((_, c)) = chars.peek() {
                if c.is_ascii_digit() {
                    frac_digits.push(*c);
                    chars.next();
                } else {
                    break;
                }
            }
        }

        if int_digits.is_empty() && frac_digits.is_empty() {
            return Err(ParseQuantityError::new(input, "missing digits"));
        }

        let suffix: &str = match chars.peek() {
            Some((i, _)) => &rest[*i..],
            None => "",
        };

        // Mantissa with the fraction folded in: value = mantissa * 10^-frac_len.
        if int_digits.len() + frac_digits.len() > 30 {
            return Err(ParseQuantityError::new(input, "too many digits"));
        }
        let mantissa: i128 = format!("{int_digits}{frac_digits}")
            .parse()
            .map_err(|_| ParseQuantityError::new(input, "mantissa out of range"))?;
        let frac_len = frac_digits.len() as i32;

        let nanos = match classify_suffix(suffix) {
            Some(Scale::Pow10(p)) => scale_pow10(mantissa, p - frac_len + 9)
                .ok_or_else(|| ParseQuantityError::new(input, "not exactly representable"))?,
            Some(Scale::Pow1024(p)) => {
                let base = mantissa
                    .checked_mul(1024i128.pow(p))
                    .ok_or_else(|| ParseQuantityError::new(input, "overflow"))?;
                scale_pow10(base, 9 - frac_len)
                    .ok_or_else(|| ParseQuantityError::new(input, "not exactly representable"))?
            }
            None => {
                return Err(ParseQuantityError::new(
                    input,
                    format!("unrecognized suffix {suffix:?}"),
                ));
            }
        };

        Ok(Self {
            nanos: if negative { -nanos } else { nanos },
        })
    }
}

enum Scale {
    Pow10(i32),
    Pow1024(u32),
}

fn classify_suffix(suffix: &str) -> Option<Scale> {
    // `1E3` is an exponent, `1E` is exa.
    if suffix.len() > 1
        && (suffix.starts_with('e') || suffix.starts_with('E'))
        && let Ok(exp) = suffix[1..].parse::<i32>()
    {
        return Some(Scale::Pow10(exp));
    }

    match suffix {
        "" => Some(Scale::Pow10(0)),
        "n" => Some(Scale::Pow10(-9)),
        "u" => Some(Scale::Pow10(-6)),
        "m" => Some(Scale::Pow10(-3)),
        "k" => Some(Scale::Pow10(3)),
        "M" => Some(Scale::Pow10(6)),
        "G" => Some(Scale::Pow10(9)),
        "T" => Some(Scale::Pow10(12)),
        "P" => Some(Scale::Pow10(15)),
        "E" => Some(Scale::Pow10(18)),
        "Ki" => Some(Scale::Pow1024(1)),
        "Mi" => Some(Scale::Pow1024(2)),
        "Gi" => Some(Scale::Pow1024(3)),
        "Ti" => Some(Scale::Pow1024(4)),
        "Pi" => Some(Scale::Pow1024(5)),
        "Ei" => Some(Scale::Pow1024(6)),
        _ => None,
    }
}

/// Scale by 10^pow. Scaling down requires exact divisibility, so values
/// finer than one nano-unit are rejected rather than rounded.
fn scale_pow10(value: i128, pow: i32) -> Option<i128> {
    if pow >= 0 {
        value.checked_mul(10i128.checked_pow(pow as u32)?)
    } else {
        let div = 10i128.checked_pow((-pow) as u32)?;
        if value % div != 0 {
            return None;
        }
        Some(value / div)
    }
}

/* ============================= FORMATTING ============================= */

// Ki is deliberately absent: byte sizes settle on Mi and up, while small
// whole numbers (object counts, CPUs) should print bare.
const BINARY_SUFFIXES: [(&str, i128); 5] = [
    ("Ei", 1 << 60),
    ("Pi", 1 << 50),
    ("Ti", 1 << 40),
    ("Gi", 1 << 30),
    ("Mi", 1 << 20),
];

impl fmt::Display for Quantity {
    /// Canonical form: whole values print bare, or with the largest binary
    /// suffix that keeps the mantissa integral; sub-unit values fall back
    /// to `m`, `u`, or `n`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos == 0 {
            return write!(f, "0");
        }
        let sign = if self.nanos < 0 { "-" } else { "" };
        let abs = self.nanos.saturating_abs();

        if abs % NANO == 0 {
            let units = abs / NANO;
            for (suffix, factor) in BINARY_SUFFIXES {
                if units % factor == 0 {
                    return write!(f, "{sign}{}{suffix}", units / factor);
                }
            }
            write!(f, "{sign}{units}")
        } else if abs % 1_000_000 == 0 {
            write!(f, "{sign}{}m", abs / 1_000_000)
        } else if abs % 1_000 == 0 {
            write!(f, "{sign}{}u", abs / 1_000)
        } else {
            write!(f, "{sign}{abs}n")
        }
    }
}

impl FromStr for Quantity {
    type Err = ParseQuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/* ============================= ARITHMETIC ============================= */

// Parsed quantities are bounded well below i128::MAX, so saturation is a
// backstop, not an expected path.
impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity {
            nanos: self.nanos.saturating_add(rhs.nanos),
        }
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.nanos = self.nanos.saturating_add(rhs.nanos);
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity {
            nanos: self.nanos.saturating_sub(rhs.nanos),
        }
    }
}

/* ============================= TESTS ============================= */
