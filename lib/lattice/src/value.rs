use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_derive::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Fixed-point decimal with an `i64` unscaled value and a base-10 scale.
/// Equality is structural: `Decimal::new(10, 1)` and `Decimal::new(1, 0)`
/// are distinct values even though both render as "1".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decimal {
    pub unscaled: i64,
    pub scale: u32,
}

impl Decimal {
    #[inline]
    pub fn new(unscaled: i64, scale: u32) -> Decimal {
        Decimal { unscaled, scale }
    }

    #[inline]
    pub fn to_f64(self) -> f64 {
        self.unscaled as f64 / 10f64.powi(self.scale as i32)
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Decimal) -> Ordering {
        // Bring both to the larger scale; i128 gives ample headroom.
        let scale = self.scale.max(other.scale);
        let lhs = self.unscaled as i128 * 10i128.pow(scale - self.scale);
        let rhs = other.unscaled as i128 * 10i128.pow(scale - other.scale);
        lhs.cmp(&rhs)
    }
}

impl PartialOrd for Decimal {
    #[inline]
    fn partial_cmp(&self, other: &Decimal) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.unscaled);
        }

        let sign = if self.unscaled < 0 { "-" } else { "" };
        let magnitude = (self.unscaled as i128).unsigned_abs();
        let divisor = 10u128.pow(self.scale);
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            magnitude / divisor,
            magnitude % divisor,
            width = self.scale as usize
        )
    }
}

impl FromStr for Decimal {
    type Err = ();

    fn from_str(text: &str) -> Result<Decimal, ()> {
        let (int_part, frac_part) = match text.find('.') {
            Some(dot) => (&text[..dot], &text[dot + 1..]),
            None => (text, ""),
        };

        if frac_part.len() > 18 || !frac_part.chars().all(|c| c.is_ascii_digit()) {
            return Err(());
        }

        let negative = int_part.starts_with('-');
        let unscaled_text: String = int_part.chars().filter(|&c| c != '-' && c != '+').chain(frac_part.chars()).collect();
        let magnitude: i64 = unscaled_text.parse().map_err(|_| ())?;

        Ok(Decimal {
            unscaled: if negative { -magnitude } else { magnitude },
            scale: frac_part.len() as u32,
        })
    }
}

/// Type tags for the scalar members of `Value`, used as coercion targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Bool,
    Int,
    Long,
    Double,
    Decimal,
    String,
    Bytes,
    DateTime,
}

/// The value union carried by cache keys, cache values, message bodies and
/// configuration. `Null` and `List` exist for wire composition (absent
/// results, entry sets) and are not coercion targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
}

impl Value {
    #[inline]
    pub fn tag(&self) -> Option<Tag> {
        match self {
            Value::Bool(_) => Some(Tag::Bool),
            Value::Int(_) => Some(Tag::Int),
            Value::Long(_) => Some(Tag::Long),
            Value::Double(_) => Some(Tag::Double),
            Value::Decimal(_) => Some(Tag::Decimal),
            Value::String(_) => Some(Tag::String),
            Value::Bytes(_) => Some(Tag::Bytes),
            Value::DateTime(_) => Some(Tag::DateTime),
            Value::Null | Value::List(_) => None,
        }
    }

    /// Value-preserving coercion to the target tag. Returns `None` whenever
    /// the conversion would lose information:
    ///
    /// | from \ to | Bool | Int | Long | Double | Decimal | String | Bytes | DateTime |
    /// |-----------|------|-----|------|--------|---------|--------|-------|----------|
    /// | Bool      | yes  | 0/1 | 0/1  | 0/1    | 0/1     | fmt    | -     | -        |
    /// | Int       | 0/1  | yes | yes  | yes    | scale 0 | fmt    | -     | -        |
    /// | Long      | 0/1  | fits| yes  | exact  | scale 0 | fmt    | -     | epoch ms |
    /// | Double    | -    |whole|whole | yes    | -       | fmt    | -     | -        |
    /// | Decimal   | -    |exact|exact | to_f64 | yes     | fmt    | -     | -        |
    /// | String    | parse|parse|parse | parse  | parse   | yes    | -     | rfc3339  |
    /// | Bytes     | -    | -   | -    | -      | -       | -      | yes   | -        |
    /// | DateTime  | -    | -   |epoch | -      | -       | rfc3339| -     | yes      |
    pub fn convert(&self, target: Tag) -> Option<Value> {
        if self.tag() == Some(target) {
            return Some(self.clone());
        }

        match (self, target) {
            (Value::Bool(b), Tag::Int) => Some(Value::Int(*b as i32)),
            (Value::Bool(b), Tag::Long) => Some(Value::Long(*b as i64)),
            (Value::Bool(b), Tag::Double) => Some(Value::Double(*b as i32 as f64)),
            (Value::Bool(b), Tag::Decimal) => Some(Value::Decimal(Decimal::new(*b as i64, 0))),
            (Value::Bool(b), Tag::String) => Some(Value::String(b.to_string())),

            (Value::Int(i), Tag::Bool) => bool_from_i64(*i as i64),
            (Value::Int(i), Tag::Long) => Some(Value::Long(*i as i64)),
            (Value::Int(i), Tag::Double) => Some(Value::Double(*i as f64)),
            (Value::Int(i), Tag::Decimal) => Some(Value::Decimal(Decimal::new(*i as i64, 0))),
            (Value::Int(i), Tag::String) => Some(Value::String(i.to_string())),

            (Value::Long(l), Tag::Bool) => bool_from_i64(*l),
            (Value::Long(l), Tag::Int) => {
                if *l >= i32::min_value() as i64 && *l <= i32::max_value() as i64 {
                    Some(Value::Int(*l as i32))
                } else {
                    None
                }
            }
            (Value::Long(l), Tag::Double) => {
                let d = *l as f64;
                if d as i64 == *l {
                    Some(Value::Double(d))
                } else {
                    None
                }
            }
            (Value::Long(l), Tag::Decimal) => Some(Value::Decimal(Decimal::new(*l, 0))),
            (Value::Long(l), Tag::String) => Some(Value::String(l.to_string())),
            (Value::Long(l), Tag::DateTime) => Utc.timestamp_millis_opt(*l).single().map(Value::DateTime),

            (Value::Double(d), Tag::Int) => {
                if d.fract() == 0.0 && *d >= i32::min_value() as f64 && *d <= i32::max_value() as f64 {
                    Some(Value::Int(*d as i32))
                } else {
                    None
                }
            }
            (Value::Double(d), Tag::Long) => {
                if d.fract() == 0.0 && (*d as i64) as f64 == *d {
                    Some(Value::Long(*d as i64))
                } else {
                    None
                }
            }
            (Value::Double(d), Tag::String) => Some(Value::String(d.to_string())),

            (Value::Decimal(d), Tag::Int) => {
                if d.scale == 0 {
                    Value::Long(d.unscaled).convert(Tag::Int)
                } else {
                    None
                }
            }
            (Value::Decimal(d), Tag::Long) => {
                if d.scale == 0 {
                    Some(Value::Long(d.unscaled))
                } else {
                    None
                }
            }
            (Value::Decimal(d), Tag::Double) => Some(Value::Double(d.to_f64())),
            (Value::Decimal(d), Tag::String) => Some(Value::String(d.to_string())),

            (Value::String(s), Tag::Bool) => match s.to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (Value::String(s), Tag::Int) => s.parse().ok().map(Value::Int),
            (Value::String(s), Tag::Long) => s.parse().ok().map(Value::Long),
            (Value::String(s), Tag::Double) => s.parse().ok().map(Value::Double),
            (Value::String(s), Tag::Decimal) => s.parse().ok().map(Value::Decimal),
            (Value::String(s), Tag::DateTime) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| Value::DateTime(dt.with_timezone(&Utc))),

            (Value::DateTime(dt), Tag::Long) => Some(Value::Long(dt.timestamp_millis())),
            (Value::DateTime(dt), Tag::String) => {
                Some(Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
            }

            _ => None,
        }
    }

    /// Total order across the union: values of the same variant compare
    /// naturally, values of different variants compare by variant rank.
    /// Doubles order by IEEE total ordering of their bit patterns' semantics
    /// via `partial_cmp` with NaN sorted last.
    pub fn cmp_order(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b).unwrap_or_else(|| {
                match (a.is_nan(), b.is_nan()) {
                    (true, false) => Ordering::Greater,
                    (false, true) => Ordering::Less,
                    _ => Ordering::Equal,
                }
            }),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp_order(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Encodes an optional value as a zero- or one-element list, the wire
    /// convention for "absent vs present" that survives `Null` being a
    /// storable value.
    pub fn from_option(value: Option<Value>) -> Value {
        Value::List(value.into_iter().collect())
    }

    /// Inverse of `from_option`.
    pub fn into_option(self) -> Option<Value> {
        match self {
            Value::List(mut items) if items.len() <= 1 => items.pop(),
            other => Some(other),
        }
    }

    /// Rough in-memory footprint, used by the binary unit calculator.
    pub fn approx_size(&self) -> u64 {
        match self {
            Value::Null => 1,
            Value::Bool(_) => 1,
            Value::Int(_) => 4,
            Value::Long(_) => 8,
            Value::Double(_) => 8,
            Value::Decimal(_) => 12,
            Value::String(s) => 8 + s.len() as u64,
            Value::Bytes(b) => 8 + b.len() as u64,
            Value::DateTime(_) => 12,
            Value::List(items) => 8 + items.iter().map(Value::approx_size).sum::<u64>(),
        }
    }

    #[inline]
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Long(_) => 3,
            Value::Double(_) => 4,
            Value::Decimal(_) => 5,
            Value::String(_) => 6,
            Value::Bytes(_) => 7,
            Value::DateTime(_) => 8,
            Value::List(_) => 9,
        }
    }
}

// Doubles take part in equality and hashing by bit pattern so `Value` can key
// the cache store and the index inverse maps.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.rank());
        match self {
            Value::Null => (),
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Long(l) => l.hash(state),
            Value::Double(d) => d.to_bits().hash(state),
            Value::Decimal(d) => d.hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::DateTime(dt) => dt.timestamp_millis().hash(state),
            Value::List(items) => {
                state.write_usize(items.len());
                for item in items {
                    item.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Long(l) => write!(f, "{}", l),
            Value::Double(d) => write!(f, "{}", d),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<i32> for Value {
    #[inline]
    fn from(i: i32) -> Value {
        Value::Int(i)
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(l: i64) -> Value {
        Value::Long(l)
    }
}

impl From<bool> for Value {
    #[inline]
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

#[inline]
fn bool_from_i64(value: i64) -> Option<Value> {
    match value {
        0 => Some(Value::Bool(false)),
        1 => Some(Value::Bool(true)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_widening() {
        assert_eq!(Value::Int(42).convert(Tag::Long), Some(Value::Long(42)));
        assert_eq!(Value::Int(42).convert(Tag::Double), Some(Value::Double(42.0)));
        assert_eq!(
            Value::Long(7).convert(Tag::Decimal),
            Some(Value::Decimal(Decimal::new(7, 0)))
        );
    }

    #[test]
    fn test_narrowing_preserves_value_or_fails() {
        assert_eq!(Value::Long(100).convert(Tag::Int), Some(Value::Int(100)));
        assert_eq!(Value::Long(1 << 40).convert(Tag::Int), None);
        assert_eq!(Value::Double(3.0).convert(Tag::Int), Some(Value::Int(3)));
        assert_eq!(Value::Double(3.5).convert(Tag::Int), None);
        // 2^53 + 1 is not representable as f64.
        assert_eq!(Value::Long((1 << 53) + 1).convert(Tag::Double), None);
    }

    #[test]
    fn test_string_round_trips() {
        assert_eq!(Value::from("123").convert(Tag::Int), Some(Value::Int(123)));
        assert_eq!(Value::from("true").convert(Tag::Bool), Some(Value::Bool(true)));
        assert_eq!(Value::from("not a number").convert(Tag::Int), None);
        assert_eq!(
            Value::Decimal(Decimal::new(-1250, 2)).convert(Tag::String),
            Some(Value::from("-12.50"))
        );
        assert_eq!(
            Value::from("-12.50").convert(Tag::Decimal),
            Some(Value::Decimal(Decimal::new(-1250, 2)))
        );
    }

    #[test]
    fn test_datetime_epoch_millis() {
        let epoch = 1_500_000_000_000i64;
        let as_datetime = Value::Long(epoch).convert(Tag::DateTime).unwrap();
        assert_eq!(as_datetime.convert(Tag::Long), Some(Value::Long(epoch)));

        let as_string = as_datetime.convert(Tag::String).unwrap();
        assert_eq!(as_string.convert(Tag::DateTime), Some(as_datetime));
    }

    #[test]
    fn test_bytes_is_opaque() {
        let bytes = Value::Bytes(vec![1, 2, 3]);
        assert_eq!(bytes.convert(Tag::String), None);
        assert_eq!(bytes.convert(Tag::Bytes), Some(bytes.clone()));
        assert_eq!(Value::from("abc").convert(Tag::Bytes), None);
    }

    #[test]
    fn test_null_and_list_have_no_coercions() {
        assert_eq!(Value::Null.convert(Tag::String), None);
        assert_eq!(Value::List(vec![]).convert(Tag::String), None);
    }

    #[test]
    fn test_decimal_ordering_across_scales() {
        let a = Decimal::new(1250, 2); // 12.50
        let b = Decimal::new(125, 1); // 12.5
        let c = Decimal::new(13, 0);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a.cmp(&c), Ordering::Less);
    }

    #[test]
    fn test_value_order_within_and_across_tags() {
        assert_eq!(Value::Int(1).cmp_order(&Value::Int(2)), Ordering::Less);
        assert_eq!(Value::from("a").cmp_order(&Value::from("b")), Ordering::Less);
        // Cross-tag comparisons fall back to variant rank and stay total.
        assert_eq!(Value::Int(9).cmp_order(&Value::from("0")), Ordering::Less);
    }

    #[test]
    fn test_double_hash_and_eq_by_bits() {
        use std::collections::hash_map::DefaultHasher;

        let a = Value::Double(1.5);
        let b = Value::Double(1.5);
        assert_eq!(a, b);

        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());

        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
    }
}
