use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};

use crate::error::DbError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeUtc(DateTime<Utc>),
    Decimal(Decimal),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    /// 驱动扩展参数类型
    /// Driver-specific payload outside the core kind set.
    Driver(DriverValue),
}

impl Value {
    /// Kind name used in type errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::F64(_) => "f64",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::DateTime(_) => "datetime",
            Value::DateTimeUtc(_) => "datetime_utc",
            Value::Decimal(_) => "decimal",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Driver(_) => "driver",
        }
    }
}

/// Column type descriptor reported by a driver result set. Drivers name
/// their own types through `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Null,
    Bool,
    SmallInt,
    Int,
    BigInt,
    Float,
    Text,
    Bytes,
    Date,
    Time,
    DateTime,
    Decimal,
    Other(String),
}

/// A named opaque payload a driver accepts as a parameter.
///
/// The framework carries it through the argument list untouched; the driver
/// downcasts and fails with `UnsupportedParamType` when the payload is not
/// one of its own.
#[derive(Clone)]
pub struct DriverValue {
    type_name: &'static str,
    payload: Arc<dyn Any + Send + Sync>,
}

impl DriverValue {
    pub fn new<T: Any + Send + Sync>(type_name: &'static str, payload: T) -> Self {
        Self {
            type_name,
            payload: Arc::new(payload),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }
}

impl fmt::Debug for DriverValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriverValue({})", self.type_name)
    }
}

impl PartialEq for DriverValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && Arc::ptr_eq(&self.payload, &other.payload)
    }
}

impl Serialize for DriverValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.type_name)
    }
}

/// 构造位置参数列表
/// Builds the positional argument list for a statement; every element goes
/// through `Value::from`, so anything with a `From` impl (including
/// `Value::Null` itself and `Option`s) binds directly.
///
/// ```ignore
/// db.exec("UPDATE app SET name = ? WHERE id = ?", &params!["jason", 42i64]).await?;
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::value::Value>::new()
    };
    ($($v:expr),+ $(,)?) => {
        vec![$($crate::value::Value::from($v)),+]
    };
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::I16(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}
impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::U8(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
impl From<DriverValue> for Value {
    fn from(v: DriverValue) -> Self {
        Value::Driver(v)
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

/// Conversion from a column [`Value`] into a caller-facing type.
///
/// Integer conversions widen but never narrow: an `I16` column reads fine as
/// `i64`, an `I64` column does not read as `i32`.
pub trait FromValue: Sized {
    fn from_value(v: &Value) -> Result<Self, DbError>;
}

fn mismatch(requested: &'static str, v: &Value) -> DbError {
    DbError::TypeMismatch {
        requested,
        found: v.kind(),
    }
}

impl FromValue for Value {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        Ok(v.clone())
    }
}

impl FromValue for bool {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::Bool(b) => Ok(*b),
            // Drivers without a native boolean report tinyint columns.
            Value::U8(n) => Ok(*n != 0),
            Value::I16(n) => Ok(*n != 0),
            Value::I32(n) => Ok(*n != 0),
            Value::I64(n) => Ok(*n != 0),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl FromValue for i16 {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::I16(n) => Ok(*n),
            Value::U8(n) => Ok(*n as i16),
            other => Err(mismatch("i16", other)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::I16(n) => Ok(*n as i32),
            Value::I32(n) => Ok(*n),
            Value::U8(n) => Ok(*n as i32),
            other => Err(mismatch("i32", other)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::I16(n) => Ok(*n as i64),
            Value::I32(n) => Ok(*n as i64),
            Value::I64(n) => Ok(*n),
            Value::U8(n) => Ok(*n as i64),
            other => Err(mismatch("i64", other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::F64(n) => Ok(*n),
            Value::I16(n) => Ok(*n as f64),
            Value::I32(n) => Ok(*n as f64),
            other => Err(mismatch("f64", other)),
        }
    }
}

impl FromValue for String {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::Str(s) => Ok(s.clone()),
            other => Err(mismatch("string", other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Str(s) => Ok(s.clone().into_bytes()),
            other => Err(mismatch("bytes", other)),
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::Date(d) => Ok(*d),
            Value::DateTime(dt) => Ok(dt.date()),
            other => Err(mismatch("date", other)),
        }
    }
}

impl FromValue for NaiveTime {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::Time(t) => Ok(*t),
            Value::DateTime(dt) => Ok(dt.time()),
            other => Err(mismatch("time", other)),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::DateTime(dt) => Ok(*dt),
            Value::DateTimeUtc(dt) => Ok(dt.naive_utc()),
            other => Err(mismatch("datetime", other)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::DateTimeUtc(dt) => Ok(*dt),
            Value::DateTime(dt) => Ok(dt.and_utc()),
            other => Err(mismatch("datetime_utc", other)),
        }
    }
}

impl FromValue for Decimal {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::Decimal(d) => Ok(*d),
            Value::I16(n) => Ok(Decimal::from(*n)),
            Value::I32(n) => Ok(Decimal::from(*n)),
            Value::I64(n) => Ok(Decimal::from(*n)),
            other => Err(mismatch("decimal", other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(v: &Value) -> Result<Self, DbError> {
        match v {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}
