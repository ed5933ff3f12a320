//! 多态注册表
//!
//! 多态槽位(`Box<dyn AnyEntity>`)在解码时依据首字段 `__type` 选择具体类型。
//! 判别字符串到解码工厂的映射在启动时通过 `BsonCodec::register` 显式填充。

use crate::decoder::BsonDecoder;
use crate::encoder::BsonEncoder;
use crate::reflect::BsonEntity;
use crate::{BsonError, BsonResult};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// 类型擦除后的实体
pub trait AnyEntity: Any + fmt::Debug + Send + Sync {
    fn type_key(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    /// 以多态形式写出：具体类型必须带判别字段
    fn write_discriminated(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()>;
}

impl<T: BsonEntity> AnyEntity for T {
    fn type_key(&self) -> &'static str {
        T::type_key()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn write_discriminated(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        let map = enc.codec().type_map::<T>()?;
        if map.discriminator().is_none() {
            return Err(BsonError::unsupported::<T>("polymorphic document without discriminator"));
        }
        enc.write_entity(self)
    }
}

impl dyn AnyEntity {
    pub fn is<T: 'static>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast<T: 'static>(self: Box<Self>) -> Option<Box<T>> {
        self.into_any().downcast::<T>().ok()
    }
}

/// 解码工厂：文档已经开始且 `__type` 已读取
pub type EntityFactory = fn(&mut BsonDecoder<'_>) -> BsonResult<Box<dyn AnyEntity>>;

fn decode_registered<T: BsonEntity>(dec: &mut BsonDecoder<'_>) -> BsonResult<Box<dyn AnyEntity>> {
    let mut entity = T::default();
    dec.read_entity_body(&mut entity, 1)?;
    Ok(Box::new(entity))
}

#[derive(Clone, Copy)]
struct Registration {
    type_id: TypeId,
    type_name: &'static str,
    factory: EntityFactory,
}

/// 判别字符串到具体类型的注册表
#[derive(Default)]
pub struct TypeRegistry {
    entries: RwLock<HashMap<String, Registration>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册类型
    ///
    /// # Arguments
    /// * `key` - 判别字符串，与类型映射中的 `discriminated(..)` 一致
    ///
    /// # Returns
    /// 同一判别字符串已注册为其他类型时返回 `ConfigurationConflict`；重复注册同一类型是空操作
    pub fn insert<T: BsonEntity>(&self, key: &str) -> BsonResult<()> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(key) {
            if existing.type_id == TypeId::of::<T>() {
                return Ok(());
            }
            return Err(BsonError::conflict(
                std::any::type_name::<T>(),
                format!("discriminator '{}' is already registered to {}", key, existing.type_name),
            ));
        }
        entries.insert(
            key.to_string(),
            Registration {
                type_id: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
                factory: decode_registered::<T>,
            },
        );
        Ok(())
    }

    pub fn factory(&self, key: &str) -> Option<EntityFactory> {
        self.entries.read().get(key).map(|r| r.factory)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        let keys: Vec<_> = entries.keys().collect();
        f.debug_struct("TypeRegistry").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::TypeMapBuilder;

    #[derive(Debug, Default)]
    struct Cat {
        lives: i32,
    }

    impl BsonEntity for Cat {
        fn describe(map: &mut TypeMapBuilder<Self>) {
            map.discriminated("zoo.Cat");
            map.field("Lives", |c| &c.lives, |c, v| c.lives = v);
        }
    }

    #[derive(Debug, Default)]
    struct Dog;

    impl BsonEntity for Dog {
        fn describe(map: &mut TypeMapBuilder<Self>) {
            map.discriminated("zoo.Cat");
        }
    }

    #[test]
    fn test_insert_conflicts() {
        let registry = TypeRegistry::new();
        registry.insert::<Cat>("zoo.Cat").unwrap();
        registry.insert::<Cat>("zoo.Cat").unwrap();
        assert_eq!(registry.len(), 1);

        let err = registry.insert::<Dog>("zoo.Cat").unwrap_err();
        assert!(matches!(err, BsonError::ConfigurationConflict { .. }));
        assert!(registry.factory("zoo.Dog").is_none());
        assert!(registry.contains("zoo.Cat"));
    }

    #[test]
    fn test_downcast() {
        let boxed: Box<dyn AnyEntity> = Box::new(Cat { lives: 9 });
        assert!(boxed.is::<Cat>());
        assert!(boxed.downcast_ref::<Dog>().is_none());
        assert_eq!(boxed.downcast_ref::<Cat>().unwrap().lives, 9);
        assert_eq!(boxed.type_key(), std::any::type_name::<Cat>());
        let cat = boxed.downcast::<Cat>().unwrap();
        assert_eq!(cat.lives, 9);
    }
}
