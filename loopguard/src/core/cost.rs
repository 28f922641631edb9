//! Fixed-point dollar amounts and defensive cost extraction from agent output.
//!
//! Budget checks compare against a hard ceiling, so costs are kept as integer
//! micro-dollars rather than floats. Parsing never fails loudly: anything that
//! does not look like a non-negative decimal is treated as "no cost".

use std::fmt;
use std::ops::Add;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

const MICROS_PER_USD: u64 = 1_000_000;
const FRACTION_DIGITS: usize = 6;

/// Keys probed (in order) when looking for a cost figure in agent JSON output.
pub const COST_KEYS: [&str; 4] = ["total_cost_usd", "cost_usd", "total_cost", "cost"];

/// Non-negative USD amount with micro-dollar resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Usd(u64);

impl Usd {
    pub const ZERO: Usd = Usd(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn from_dollars(dollars: u64) -> Self {
        Self(dollars.saturating_mul(MICROS_PER_USD))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add(self, other: Usd) -> Usd {
        Usd(self.0.saturating_add(other.0))
    }

    /// Parse a decimal dollar string such as `"6"`, `"0.25"` or `"$1.50"`.
    ///
    /// Fraction digits beyond micro-dollar resolution are truncated. Negative,
    /// empty, or otherwise malformed input returns `None`.
    pub fn parse(raw: &str) -> Option<Usd> {
        let s = raw.trim();
        let s = s.strip_prefix('$').unwrap_or(s).trim();
        if s.is_empty() || s.starts_with('-') {
            return None;
        }
        if s.contains(['e', 'E']) {
            return parse_scientific(s);
        }
        let s = s.strip_prefix('+').unwrap_or(s);
        let (whole, frac) = match s.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return None;
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return None;
        }
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().ok()?
        };
        let mut frac_digits: String = frac.chars().take(FRACTION_DIGITS).collect();
        while frac_digits.len() < FRACTION_DIGITS {
            frac_digits.push('0');
        }
        let frac: u64 = frac_digits.parse().ok()?;
        let micros = whole.checked_mul(MICROS_PER_USD)?.checked_add(frac)?;
        Some(Usd(micros))
    }

    /// Interpret a JSON value (number or numeric string) as a dollar amount.
    pub fn from_json(value: &Value) -> Option<Usd> {
        match value {
            Value::Number(n) => Usd::parse(&n.to_string()),
            Value::String(s) => Usd::parse(s),
            _ => None,
        }
    }
}

fn parse_scientific(s: &str) -> Option<Usd> {
    let value: f64 = s.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let micros = (value * MICROS_PER_USD as f64).round();
    if micros > u64::MAX as f64 {
        return None;
    }
    Some(Usd(micros as u64))
}

impl Add for Usd {
    type Output = Usd;

    fn add(self, rhs: Usd) -> Usd {
        self.saturating_add(rhs)
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MICROS_PER_USD;
        let frac = self.0 % MICROS_PER_USD;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:06}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl Serialize for Usd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Usd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(UsdVisitor)
    }
}

struct UsdVisitor;

impl Visitor<'_> for UsdVisitor {
    type Value = Usd;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative dollar amount")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Usd, E> {
        Usd::parse(v).ok_or_else(|| E::custom(format!("invalid dollar amount '{v}'")))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Usd, E> {
        v.checked_mul(MICROS_PER_USD)
            .map(Usd)
            .ok_or_else(|| E::custom("dollar amount overflows"))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Usd, E> {
        let v = u64::try_from(v).map_err(|_| E::custom("dollar amount must be >= 0"))?;
        self.visit_u64(v)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Usd, E> {
        // Route through the decimal text so 0.1 becomes exactly 100_000 micros.
        Usd::parse(&v.to_string()).ok_or_else(|| E::custom(format!("invalid dollar amount {v}")))
    }
}

/// Find the cost figure in free-form agent output.
///
/// The whole output is tried as one JSON document first, then each line from
/// last to first (stream-json agents print the result record last). Within an
/// object the first non-null key from [`COST_KEYS`] wins; if that value is not
/// a valid amount the cost is unknown rather than falling through to later keys.
pub fn extract_cost(output: &str) -> Option<Usd> {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(output.trim())
        && let Some(found) = cost_in_object(&obj)
    {
        return found;
    }
    for line in output.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(found) = cost_in_object(&obj) {
            return found;
        }
    }
    None
}

/// `Some(_)` when the object carries a non-null cost key (parsed or not).
fn cost_in_object(obj: &Map<String, Value>) -> Option<Option<Usd>> {
    COST_KEYS
        .iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| !value.is_null())
        .map(Usd::from_json)
}
