//! 值转换器
//!
//! 允许字段的内存类型与线上类型不同，通过 `TypeMapBuilder::converted` 挂到字段上。

use crate::convert::{FromBson, ToBson};
use crate::{BsonError, BsonResult};
use rust_decimal::Decimal;
use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;
use std::time::Duration;

/// 单个字段的值转换
pub trait ValueConverter: Send + Sync + 'static {
    /// 内存中的类型
    type Value;
    /// 线上写出的类型
    type Wire: ToBson + FromBson;

    fn to_wire(&self, value: &Self::Value) -> BsonResult<Self::Wire>;

    fn from_wire(&self, wire: Self::Wire) -> BsonResult<Self::Value>;
}

/// 十进制数以字符串保存，避免 double 精度损失
#[derive(Debug, Clone, Copy, Default)]
pub struct DecimalAsString;

impl ValueConverter for DecimalAsString {
    type Value = Decimal;
    type Wire = String;

    fn to_wire(&self, value: &Decimal) -> BsonResult<String> {
        Ok(value.to_string())
    }

    fn from_wire(&self, wire: String) -> BsonResult<Decimal> {
        wire.parse()
            .map_err(|e| BsonError::Conversion(format!("Invalid decimal '{}': {}", wire, e)))
    }
}

/// 通过 `Display` / `FromStr` 以字符串保存
pub struct DisplayFromStr<T>(PhantomData<fn() -> T>);

impl<T> DisplayFromStr<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for DisplayFromStr<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ValueConverter for DisplayFromStr<T>
where
    T: Display + FromStr + 'static,
    T::Err: Display,
{
    type Value = T;
    type Wire = String;

    fn to_wire(&self, value: &T) -> BsonResult<String> {
        Ok(value.to_string())
    }

    fn from_wire(&self, wire: String) -> BsonResult<T> {
        wire.parse().map_err(|e: T::Err| {
            BsonError::Conversion(format!(
                "Cannot parse '{}' as {}: {}",
                wire,
                std::any::type_name::<T>(),
                e
            ))
        })
    }
}

/// 时长以毫秒 int64 保存
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationAsMillis;

impl ValueConverter for DurationAsMillis {
    type Value = Duration;
    type Wire = i64;

    fn to_wire(&self, value: &Duration) -> BsonResult<i64> {
        i64::try_from(value.as_millis())
            .map_err(|_| BsonError::ValueOutOfRange(format!("{:?} in milliseconds", value)))
    }

    fn from_wire(&self, wire: i64) -> BsonResult<Duration> {
        u64::try_from(wire)
            .map(Duration::from_millis)
            .map_err(|_| BsonError::ValueOutOfRange(format!("Negative duration {} ms", wire)))
    }
}
