//! 外部映射配置
//!
//! 字段别名与标识符字段可以在类型声明之外配置。类型映射缓存在构建时
//! 通过 `AliasResolver` 查询这些设置；修改配置后需要让缓存失效。

use parking_lot::RwLock;
use std::collections::HashMap;

/// 字段别名解析
///
/// `type_key` 为实体的类型键(`BsonEntity::type_key`)，`field` 为字段的内存名。
pub trait AliasResolver: Send + Sync {
    /// 线上字段名；`None` 表示沿用声明时的名字
    fn wire_name(&self, type_key: &str, field: &str) -> Option<String>;

    /// 被指定为标识符的字段内存名
    fn identifier_field(&self, type_key: &str) -> Option<String>;
}

/// 单个类型的映射设置
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeMapping {
    aliases: HashMap<String, String>,
    identifier: Option<String>,
}

impl TypeMapping {
    /// 把字段 `field` 写成线上名 `wire_name`
    pub fn alias(&mut self, field: impl Into<String>, wire_name: impl Into<String>) -> &mut Self {
        self.aliases.insert(field.into(), wire_name.into());
        self
    }

    pub fn remove_alias(&mut self, field: &str) -> &mut Self {
        self.aliases.remove(field);
        self
    }

    /// 指定标识符字段，优先级高于字段上的标记与按名约定
    pub fn identifier(&mut self, field: impl Into<String>) -> &mut Self {
        self.identifier = Some(field.into());
        self
    }
}

/// 默认的别名解析实现
#[derive(Debug, Default)]
pub struct MappingConfig {
    types: RwLock<HashMap<String, TypeMapping>>,
}

impl MappingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 修改某个类型的映射，不存在时先创建空映射
    pub fn update(&self, type_key: &str, f: impl FnOnce(&mut TypeMapping)) {
        let mut types = self.types.write();
        f(types.entry(type_key.to_string()).or_default());
    }

    pub fn remove(&self, type_key: &str) -> Option<TypeMapping> {
        self.types.write().remove(type_key)
    }

    pub fn get(&self, type_key: &str) -> Option<TypeMapping> {
        self.types.read().get(type_key).cloned()
    }
}

impl AliasResolver for MappingConfig {
    fn wire_name(&self, type_key: &str, field: &str) -> Option<String> {
        self.types
            .read()
            .get(type_key)
            .and_then(|mapping| mapping.aliases.get(field).cloned())
    }

    fn identifier_field(&self, type_key: &str) -> Option<String> {
        self.types
            .read()
            .get(type_key)
            .and_then(|mapping| mapping.identifier.clone())
    }
}
