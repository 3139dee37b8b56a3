//! Values held by variables.
//!
//! A `Variant` is a dynamically typed scalar; a `DataValue` adds the status and the
//! timestamps that travel with every sampled or read value.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::StatusCode;

/// Declared data type of a variable.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    UInt32,
    Float,
    Double,
    String,
    ByteString,
    DateTime,
    Empty,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A scalar value.
///
/// # Examples
///
/// ```
/// use uasub::{DataType, Variant};
///
/// let v = Variant::Int32(7);
/// assert_eq!(v.data_type(), DataType::Int32);
/// assert_eq!(v.coerce_to(DataType::Double), Some(Variant::Double(7.0)));
/// assert_eq!(Variant::from("x").coerce_to(DataType::Double), None);
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Variant {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    Float(f32),
    Double(f64),
    String(String),
    ByteString(Vec<u8>),
    DateTime(DateTime<Utc>),
    #[default]
    Empty,
}

impl Variant {
    /// Type of the held value.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Boolean(_) => DataType::Boolean,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::UInt32(_) => DataType::UInt32,
            Self::Float(_) => DataType::Float,
            Self::Double(_) => DataType::Double,
            Self::String(_) => DataType::String,
            Self::ByteString(_) => DataType::ByteString,
            Self::DateTime(_) => DataType::DateTime,
            Self::Empty => DataType::Empty,
        }
    }

    /// True for `Empty`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Numeric value as `f64`, if numeric.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(*v as f64),
            Self::Int64(v) => Some(*v as f64),
            Self::UInt32(v) => Some(*v as f64),
            Self::Float(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts the value to `target` if that can be done without loss.
    ///
    /// Integers widen to larger integers and to floating point, `Float` widens to
    /// `Double`. Narrowing conversions, string parsing and boolean/number mixing
    /// are not performed.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn coerce_to(&self, target: DataType) -> Option<Self> {
        if self.data_type() == target {
            return Some(self.clone());
        }
        match (self, target) {
            (Self::Int32(v), DataType::Int64) => Some(Self::Int64(i64::from(*v))),
            (Self::Int32(v), DataType::Double) => Some(Self::Double(f64::from(*v))),
            (Self::UInt32(v), DataType::Int64) => Some(Self::Int64(i64::from(*v))),
            (Self::UInt32(v), DataType::Double) => Some(Self::Double(f64::from(*v))),
            (Self::Float(v), DataType::Double) => Some(Self::Double(f64::from(*v))),
            (Self::Int32(v), DataType::UInt32) => u32::try_from(*v).ok().map(Self::UInt32),
            (Self::Int64(v), DataType::Int32) => i32::try_from(*v).ok().map(Self::Int32),
            (Self::Int64(v), DataType::UInt32) => u32::try_from(*v).ok().map(Self::UInt32),
            (Self::UInt32(v), DataType::Int32) => i32::try_from(*v).ok().map(Self::Int32),
            (Self::Int64(v), DataType::Double) => {
                // Compare in i128: an f64 -> i64 cast saturates at the edges.
                let d = *v as f64;
                (d as i128 == i128::from(*v)).then_some(Self::Double(d))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::ByteString(v) => write!(f, "bytes[{}]", v.len()),
            Self::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Empty => write!(f, "empty"),
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<u32> for Variant {
    fn from(v: u32) -> Self {
        Self::UInt32(v)
    }
}

impl From<f32> for Variant {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<DateTime<Utc>> for Variant {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

/// Which timestamps a monitored item reports with its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampsToReturn {
    /// Source timestamp only.
    Source,
    /// Server timestamp only.
    Server,
    /// Both timestamps.
    #[default]
    Both,
    /// No timestamps.
    Neither,
}

/// A value with its status and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue {
    /// The value itself.
    pub value: Variant,
    /// Quality of the value.
    pub status: StatusCode,
    /// When the source produced the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,
    /// When the server read the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// A good value with both timestamps set to `at`.
    #[must_use]
    pub fn new_at(value: Variant, at: DateTime<Utc>) -> Self {
        Self {
            value,
            status: StatusCode::Good,
            source_timestamp: Some(at),
            server_timestamp: Some(at),
        }
    }

    /// An empty value carrying a bad or uncertain status.
    #[must_use]
    pub const fn with_status(status: StatusCode, at: DateTime<Utc>) -> Self {
        Self {
            value: Variant::Empty,
            status,
            source_timestamp: None,
            server_timestamp: Some(at),
        }
    }

    /// Drops the timestamps the client did not ask for.
    #[must_use]
    pub fn filter_timestamps(mut self, timestamps: TimestampsToReturn) -> Self {
        match timestamps {
            TimestampsToReturn::Both => {}
            TimestampsToReturn::Source => self.server_timestamp = None,
            TimestampsToReturn::Server => self.source_timestamp = None,
            TimestampsToReturn::Neither => {
                self.source_timestamp = None;
                self.server_timestamp = None;
            }
        }
        self
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.value, self.status)?;
        if let Some(ts) = self.source_timestamp {
            write!(f, " source={}", ts.to_rfc3339())?;
        }
        if let Some(ts) = self.server_timestamp {
            write!(f, " server={}", ts.to_rfc3339())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_coercions_succeed() {
        assert_eq!(Variant::Int32(-3).coerce_to(DataType::Int64), Some(Variant::Int64(-3)));
        assert_eq!(Variant::UInt32(3).coerce_to(DataType::Double), Some(Variant::Double(3.0)));
        assert_eq!(Variant::Float(1.5).coerce_to(DataType::Double), Some(Variant::Double(1.5)));
        assert_eq!(Variant::Int64(12).coerce_to(DataType::Int32), Some(Variant::Int32(12)));
    }

    #[test]
    fn lossy_or_cross_kind_coercions_fail() {
        assert_eq!(Variant::Double(1.5).coerce_to(DataType::Int32), None);
        assert_eq!(Variant::Int32(-1).coerce_to(DataType::UInt32), None);
        assert_eq!(Variant::Int64(i64::MAX).coerce_to(DataType::Int32), None);
        assert_eq!(Variant::Boolean(true).coerce_to(DataType::Int32), None);
        assert_eq!(Variant::from("10.5").coerce_to(DataType::Double), None);
        assert_eq!(Variant::Empty.coerce_to(DataType::Double), None);
    }

    #[test]
    fn int64_to_double_only_when_exact() {
        assert_eq!(Variant::Int64(i64::MAX).coerce_to(DataType::Double), None);
        assert_eq!(Variant::Int64((1 << 53) + 1).coerce_to(DataType::Double), None);
        assert_eq!(
            Variant::Int64(1 << 53).coerce_to(DataType::Double),
            Some(Variant::Double(9_007_199_254_740_992.0))
        );
        assert_eq!(
            Variant::Int64(i64::MIN).coerce_to(DataType::Double),
            Some(Variant::Double(-9_223_372_036_854_775_808.0))
        );
    }

    #[test]
    fn filter_timestamps_keeps_requested_only() {
        let now = Utc::now();
        let dv = DataValue::new_at(Variant::Double(1.0), now);

        let source = dv.clone().filter_timestamps(TimestampsToReturn::Source);
        assert_eq!(source.source_timestamp, Some(now));
        assert_eq!(source.server_timestamp, None);

        let neither = dv.clone().filter_timestamps(TimestampsToReturn::Neither);
        assert!(neither.source_timestamp.is_none() && neither.server_timestamp.is_none());

        assert_eq!(dv.clone().filter_timestamps(TimestampsToReturn::Both), dv);
    }
}
