//! 动态属性容器模块
//!
//! `Expando` 是大小写不敏感、保持插入顺序的字符串键字典。
//! 既可以单独作为无模式文档使用，也作为实体的溢出容器，
//! 保存线上存在但没有静态字段对应的属性。

use crate::value::{BsonValue, FromBsonValue};
use crate::{BsonError, BsonResult};
use compact_str::CompactString;
use indexmap::{Equivalent, IndexMap};
use std::fmt;
use std::hash::{Hash, Hasher};

/// 按小写折叠后的字符序列计算哈希
fn hash_folded<H: Hasher>(key: &str, state: &mut H) {
    for c in key.chars().flat_map(char::to_lowercase) {
        state.write_u32(c as u32);
    }
    state.write_u8(0xFF);
}

/// 与 `Expando` 相同规则的大小写折叠，供编码器与类型映射比较字段名
pub(crate) fn fold_key(key: &str) -> String {
    key.chars().flat_map(char::to_lowercase).collect()
}

pub(crate) fn eq_folded(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

/// 保存原始拼写，比较与哈希时忽略大小写
#[derive(Debug, Clone)]
struct FieldKey(CompactString);

impl Hash for FieldKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_folded(&self.0, state);
    }
}

impl PartialEq for FieldKey {
    fn eq(&self, other: &Self) -> bool {
        eq_folded(&self.0, &other.0)
    }
}

impl Eq for FieldKey {}

/// 查询用的借用键，避免为每次查找分配 `FieldKey`
struct FoldedStr<'a>(&'a str);

impl Hash for FoldedStr<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_folded(self.0, state);
    }
}

impl Equivalent<FieldKey> for FoldedStr<'_> {
    fn equivalent(&self, key: &FieldKey) -> bool {
        eq_folded(self.0, &key.0)
    }
}

/// 动态属性容器
///
/// # 语义
///
/// - `set` 总是替换已有值：大小写不敏感匹配，保留原来的拼写与位置
/// - `delete` 删除不存在的键是空操作
/// - 枚举顺序为插入顺序，调用 `reverse` 后反转
#[derive(Debug, Clone, Default)]
pub struct Expando {
    entries: IndexMap<FieldKey, BsonValue>,
}

impl Expando {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
        }
    }

    /// 设置属性
    ///
    /// # Brief
    /// 存在同名(忽略大小写)属性时原位替换值，否则追加到末尾
    ///
    /// # Arguments
    /// * `key` - 属性名
    /// * `value` - 属性值
    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<BsonValue>) {
        let key = key.as_ref();
        let value = value.into();
        match self.entries.get_mut(&FoldedStr(key)) {
            Some(slot) => *slot = value,
            None => {
                self.entries.insert(FieldKey(CompactString::new(key)), value);
            }
        }
    }

    /// 按类型取值
    ///
    /// # Brief
    /// 属性不存在或类型不匹配时返回错误
    ///
    /// # Returns
    /// `KeyNotFound` 或 `TypeMismatch`
    pub fn get<T: FromBsonValue>(&self, key: &str) -> BsonResult<T> {
        let value = self
            .get_value(key)
            .ok_or_else(|| BsonError::KeyNotFound(key.to_string()))?;
        T::from_bson_value(value).ok_or_else(|| BsonError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
            found: value.type_name(),
        })
    }

    /// 与 `get` 相同，但以 `None` 代替错误
    pub fn try_get<T: FromBsonValue>(&self, key: &str) -> Option<T> {
        self.get_value(key).and_then(T::from_bson_value)
    }

    pub fn get_value(&self, key: &str) -> Option<&BsonValue> {
        self.entries.get(&FoldedStr(key))
    }

    pub fn get_value_mut(&mut self, key: &str) -> Option<&mut BsonValue> {
        self.entries.get_mut(&FoldedStr(key))
    }

    /// 删除属性并返回旧值，后续属性保持相对顺序
    pub fn delete(&mut self, key: &str) -> Option<BsonValue> {
        self.entries.shift_remove(&FoldedStr(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&FoldedStr(key))
    }

    /// 就地反转枚举顺序
    pub fn reverse(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        self.entries = entries.into_iter().rev().collect();
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.0.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &BsonValue> {
        self.entries.values()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&str, &BsonValue)> {
        self.entries.iter().map(|(k, v)| (k.0.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 合并另一个容器，同名属性以 `other` 为准
    pub fn merge(&mut self, other: Expando) {
        for (key, value) in other.entries {
            self.set(key.0.as_str(), value);
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get_value(key).and_then(|v| v.as_str())
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get_value(key).and_then(|v| v.as_i32())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get_value(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get_value(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_value(key).and_then(|v| v.as_bool())
    }

    pub fn get_array(&self, key: &str) -> Option<&Vec<BsonValue>> {
        self.get_value(key).and_then(|v| v.as_array())
    }

    pub fn get_document(&self, key: &str) -> Option<&Expando> {
        self.get_value(key).and_then(|v| v.as_document())
    }

    /// 按点分隔路径获取嵌套值
    pub fn get_path(&self, path: &str) -> Option<&BsonValue> {
        let (first, rest) = match path.split_once('.') {
            Some((first, rest)) => (first, Some(rest)),
            None => (path, None),
        };
        let value = self.get_value(first)?;
        match rest {
            Some(rest) => value.get_path(rest),
            None => Some(value),
        }
    }

    /// 转换为扩展 JSON
    pub fn to_json(&self) -> serde_json::Value {
        crate::json::expando_to_json(self)
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.to_json()).unwrap_or_default()
    }
}

/// 顺序敏感的比较，键按忽略大小写比较
impl PartialEq for Expando {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
    }
}

impl fmt::Display for Expando {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " \"{}\": {}", key, value)?;
        }
        if self.is_empty() {
            write!(f, "}}")
        } else {
            write!(f, " }}")
        }
    }
}

impl<K: AsRef<str>, V: Into<BsonValue>> FromIterator<(K, V)> for Expando {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut expando = Expando::new();
        for (key, value) in iter {
            expando.set(key, value);
        }
        expando
    }
}

impl IntoIterator for Expando {
    type Item = (String, BsonValue);
    type IntoIter = std::vec::IntoIter<(String, BsonValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries
            .into_iter()
            .map(|(k, v)| (k.0.into_string(), v))
            .collect::<Vec<_>>()
            .into_iter()
    }
}

/// 构造 `Expando` 的便捷宏
///
/// ```rust,ignore
/// use norm_bson::expando;
///
/// let props = expando! {
///     "name" => "test",
///     "value" => 123,
/// };
/// ```
#[macro_export]
macro_rules! expando {
    () => {
        $crate::Expando::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut expando = $crate::Expando::new();
        $(
            expando.set($key, $value);
        )+
        expando
    }};
}
