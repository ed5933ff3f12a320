//! BSON 与 JSON 互转模块
//!
//! JSON 的类型系统比 BSON 简单，特殊类型转换为扩展 JSON 格式。
//! 对象键顺序与 `Expando` 的插入顺序一致。

use crate::expando::Expando;
use crate::value::{Binary, BsonValue, DbPointer, RegexOptions, RegexValue, ScopedCode};
use crate::{BsonError, BsonResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::TimeZone;
use norm_common::ObjectId;
use serde_json::{json, Map, Number, Value as JsonValue};

/// 将 BsonValue 转换为 JSON
///
/// # Brief
/// 标量直接对应，复杂类型使用扩展 JSON 格式
///
/// # 扩展 JSON 格式
/// - ObjectId: `{"$oid": "507f1f77bcf86cd799439011"}`
/// - DateTime: `{"$date": 1234567890000}`
/// - Regex: `{"$regex": "pattern", "$options": "i"}`
/// - Binary: `{"$binary": "base64_string", "$type": "00"}`
/// - Uuid: `{"$uuid": "..."}`
/// - Code: `{"$code": "..."}`，带作用域时附加 `"$scope": {...}`
/// - Symbol: `{"$symbol": "..."}`
/// - Timestamp: `{"$timestamp": {"t": 秒, "i": 序号}}`
/// - DbPointer: `{"$dbPointer": {"$ref": "db.coll", "$id": {"$oid": "..."}}}`
pub fn to_json(value: &BsonValue) -> JsonValue {
    match value {
        BsonValue::Null => JsonValue::Null,
        BsonValue::Boolean(b) => JsonValue::Bool(*b),
        BsonValue::Int32(n) => json!(*n),
        BsonValue::Int64(n) => json!(*n),
        BsonValue::Double(f) => match Number::from_f64(*f) {
            Some(n) => JsonValue::Number(n),
            // NaN 与无穷大没有 JSON 数字表示
            None => json!(f.to_string()),
        },
        BsonValue::String(s) => JsonValue::String(s.clone()),
        BsonValue::Binary(b) => json!({
            "$binary": STANDARD.encode(&b.bytes),
            "$type": format!("{:02x}", b.subtype),
        }),
        BsonValue::Uuid(uuid) => json!({ "$uuid": uuid.to_string() }),
        BsonValue::ObjectId(oid) => json!({ "$oid": oid.to_hex() }),
        BsonValue::DateTime(dt) => json!({ "$date": dt.timestamp_millis() }),
        BsonValue::Regex(r) => json!({
            "$regex": r.pattern.as_str(),
            "$options": r.options.to_option_string(),
        }),
        BsonValue::Code(code) => json!({ "$code": code.as_str() }),
        BsonValue::Symbol(s) => json!({ "$symbol": s.as_str() }),
        BsonValue::ScopedCode(c) => json!({
            "$code": c.code.as_str(),
            "$scope": expando_to_json(&c.scope),
        }),
        BsonValue::Pointer(p) => json!({
            "$dbPointer": {
                "$ref": p.namespace.as_str(),
                "$id": { "$oid": p.id.to_hex() },
            }
        }),
        BsonValue::Timestamp(ts) => {
            let (time, increment) = (*ts >> 32, *ts & 0xFFFF_FFFF);
            json!({ "$timestamp": { "t": time, "i": increment } })
        }
        BsonValue::Array(items) => JsonValue::Array(items.iter().map(to_json).collect()),
        BsonValue::Document(doc) => expando_to_json(doc),
    }
}

pub fn expando_to_json(doc: &Expando) -> JsonValue {
    let mut obj = Map::with_capacity(doc.len());
    for (key, value) in doc.iter() {
        obj.insert(key.to_string(), to_json(value));
    }
    JsonValue::Object(obj)
}

fn invalid(what: &str, detail: impl std::fmt::Display) -> BsonError {
    BsonError::Conversion(format!("Invalid {}: {}", what, detail))
}

/// 从 JSON 转换为 BsonValue
///
/// # Brief
/// 识别扩展 JSON 格式；整数优先落在 int32，超出范围时为 int64
///
/// # Returns
/// 扩展格式的字段内容不合法时返回 `Conversion` 错误
pub fn from_json(value: &JsonValue) -> BsonResult<BsonValue> {
    match value {
        JsonValue::Null => Ok(BsonValue::Null),
        JsonValue::Bool(b) => Ok(BsonValue::Boolean(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i32::try_from(i).map_or(BsonValue::Int64(i), BsonValue::Int32))
            } else if let Some(f) = n.as_f64() {
                Ok(BsonValue::Double(f))
            } else {
                Err(invalid("number", n))
            }
        }
        JsonValue::String(s) => Ok(BsonValue::String(s.clone())),
        JsonValue::Array(items) => items
            .iter()
            .map(from_json)
            .collect::<BsonResult<Vec<_>>>()
            .map(BsonValue::Array),
        JsonValue::Object(obj) => from_json_object(obj),
    }
}

fn from_json_object(obj: &Map<String, JsonValue>) -> BsonResult<BsonValue> {
    if let Some(JsonValue::String(hex)) = obj.get("$oid") {
        return Ok(BsonValue::ObjectId(ObjectId::from_hex(hex)?));
    }

    if let Some(JsonValue::String(s)) = obj.get("$uuid") {
        let uuid = s.parse::<uuid::Uuid>().map_err(|e| invalid("$uuid", e))?;
        return Ok(BsonValue::Uuid(uuid));
    }

    if let Some(date) = obj.get("$date") {
        let millis = date.as_i64().ok_or_else(|| invalid("$date", date))?;
        let dt = chrono::Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| BsonError::ValueOutOfRange(format!("{} ms since epoch", millis)))?;
        return Ok(BsonValue::DateTime(dt));
    }

    if let Some(ts) = obj.get("$timestamp") {
        let part = |key: &str| {
            ts.get(key)
                .and_then(JsonValue::as_u64)
                .filter(|n| *n <= u64::from(u32::MAX))
                .ok_or_else(|| invalid("$timestamp", ts))
        };
        return Ok(BsonValue::Timestamp((part("t")? << 32) | part("i")?));
    }

    if let Some(JsonValue::String(encoded)) = obj.get("$binary") {
        let bytes = STANDARD.decode(encoded).map_err(|e| invalid("$binary", e))?;
        let subtype = match obj.get("$type").and_then(JsonValue::as_str) {
            Some(hex) => u8::from_str_radix(hex, 16).map_err(|e| invalid("$type", e))?,
            None => 0,
        };
        return Ok(BsonValue::from_binary(Binary::with_subtype(subtype, bytes)));
    }

    if let Some(JsonValue::String(pattern)) = obj.get("$regex") {
        let options = obj.get("$options").and_then(JsonValue::as_str).unwrap_or("");
        return Ok(BsonValue::Regex(RegexValue::new(
            pattern.as_str(),
            RegexOptions::from_option_str(options),
        )));
    }

    if let Some(JsonValue::String(code)) = obj.get("$code") {
        return match obj.get("$scope") {
            Some(scope) => Ok(BsonValue::ScopedCode(ScopedCode::new(
                code.as_str(),
                expando_from_json(scope)?,
            ))),
            None => Ok(BsonValue::Code(code.clone())),
        };
    }

    if let Some(JsonValue::String(symbol)) = obj.get("$symbol") {
        return Ok(BsonValue::Symbol(symbol.clone()));
    }

    if let Some(pointer) = obj.get("$dbPointer") {
        let namespace = pointer
            .get("$ref")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid("$dbPointer", pointer))?;
        let id = match pointer.get("$id").map(from_json).transpose()? {
            Some(BsonValue::ObjectId(id)) => id,
            _ => return Err(invalid("$dbPointer", pointer)),
        };
        return Ok(BsonValue::Pointer(DbPointer {
            namespace: namespace.to_string(),
            id,
        }));
    }

    let mut doc = Expando::with_capacity(obj.len());
    for (key, value) in obj {
        doc.set(key, from_json(value)?);
    }
    Ok(BsonValue::Document(doc))
}

/// JSON 对象转换为动态属性容器
pub fn expando_from_json(value: &JsonValue) -> BsonResult<Expando> {
    match from_json(value)? {
        BsonValue::Document(doc) => Ok(doc),
        other => Err(BsonError::Conversion(format!(
            "Expected a JSON object, got {}",
            other.type_name()
        ))),
    }
}

/// 将 BSON 值序列化为美化的 JSON 字符串
pub fn to_json_string(value: &BsonValue) -> BsonResult<String> {
    serde_json::to_string_pretty(&to_json(value))
        .map_err(|e| BsonError::Conversion(format!("JSON serialization failed: {}", e)))
}

/// 解析 JSON 字符串并转换为 BSON 值
pub fn from_json_string(json_str: &str) -> BsonResult<BsonValue> {
    let json_value: JsonValue = serde_json::from_str(json_str)
        .map_err(|e| BsonError::Conversion(format!("JSON parsing failed: {}", e)))?;
    from_json(&json_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expando;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_basic_types() {
        assert_eq!(to_json(&BsonValue::Null), JsonValue::Null);
        assert_eq!(to_json(&BsonValue::Boolean(true)), JsonValue::Bool(true));
        assert_eq!(to_json(&BsonValue::Int32(42)), json!(42));
        assert_eq!(to_json(&BsonValue::from("hello")), json!("hello"));
        assert_eq!(to_json(&BsonValue::Double(f64::NAN)), json!("NaN"));
    }

    #[test]
    fn test_document_keeps_order() {
        let doc = expando! { "zeta" => 1, "alpha" => "a" };
        let text = serde_json::to_string(&doc.to_json()).unwrap();
        assert_eq!(text, r#"{"zeta":1,"alpha":"a"}"#);
    }

    #[test]
    fn test_extended_types_round_trip() {
        let original = BsonValue::Document(expando! {
            "oid" => ObjectId::new(),
            "uuid" => Uuid::new_v4(),
            "when" => Utc.timestamp_millis_opt(1_600_000_000_000).unwrap(),
            "bin" => Binary::with_subtype(0x80, vec![1u8, 2, 3]),
            "re" => RegexValue::new("^a", RegexOptions::IGNORE_CASE | RegexOptions::MULTILINE),
            "code" => BsonValue::Code("f()".to_string()),
            "scoped" => ScopedCode::new("x", expando! { "x" => 1 }),
            "sym" => BsonValue::Symbol("s".to_string()),
            "ts" => BsonValue::Timestamp((5u64 << 32) | 6),
            "big" => i64::MAX,
            "list" => vec![1.5, 2.5],
        });
        let text = to_json_string(&original).unwrap();
        assert_eq!(from_json_string(&text).unwrap(), original);
    }

    #[test]
    fn test_invalid_extended_values() {
        assert!(from_json(&json!({ "$oid": "nope" })).is_err());
        assert!(from_json(&json!({ "$binary": "!!!" })).is_err());
        assert!(from_json(&json!({ "$date": "yesterday" })).is_err());
        assert!(expando_from_json(&json!([1, 2])).is_err());
        assert!(from_json_string("{").is_err());
    }
}
