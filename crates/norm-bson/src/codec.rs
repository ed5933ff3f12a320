//! 编解码入口
//!
//! `BsonCodec` 持有类型映射缓存、多态注册表与映射配置。克隆共享同一份状态，
//! 可以在线程间自由传递。

use crate::convert::{FromBson, ToBson};
use crate::decoder::{BsonDecoder, Decoded, DocumentReader};
use crate::encoder::{BsonEncoder, EncodeMode};
use crate::mapping::{AliasResolver, MappingConfig, TypeMapping};
use crate::reflect::{BsonEntity, TypeMap, TypeMapCache};
use crate::registry::{AnyEntity, TypeRegistry};
use crate::spec::ElementType;
use crate::{BsonError, BsonResult};
use bytes::BytesMut;
use norm_common::CodecConfig;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::debug;

static GLOBAL: Lazy<BsonCodec> = Lazy::new(BsonCodec::new);

/// BSON 编解码器
#[derive(Debug, Clone)]
pub struct BsonCodec {
    maps: Arc<TypeMapCache>,
    registry: Arc<TypeRegistry>,
    mapping: Option<Arc<MappingConfig>>,
    config: CodecConfig,
}

impl BsonCodec {
    pub fn new() -> Self {
        Self::with_config(CodecConfig::default())
    }

    pub fn with_config(config: CodecConfig) -> Self {
        let mapping = Arc::new(MappingConfig::new());
        Self {
            maps: Arc::new(TypeMapCache::new(mapping.clone())),
            registry: Arc::new(TypeRegistry::new()),
            mapping: Some(mapping),
            config,
        }
    }

    /// 使用外部别名解析器；此时 `configure` 不可用
    pub fn with_resolver(config: CodecConfig, resolver: Arc<dyn AliasResolver>) -> Self {
        Self {
            maps: Arc::new(TypeMapCache::new(resolver)),
            registry: Arc::new(TypeRegistry::new()),
            mapping: None,
            config,
        }
    }

    /// 进程级共享实例，使用默认配置
    pub fn global() -> &'static BsonCodec {
        &GLOBAL
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &TypeMapCache {
        &self.maps
    }

    pub fn type_map<T: BsonEntity>(&self) -> BsonResult<Arc<TypeMap<T>>> {
        self.maps.get_or_build::<T>()
    }

    /// 注册多态类型，判别字符串取自类型映射
    ///
    /// # Returns
    /// 类型没有声明判别字段，或判别字符串已属于其他类型时返回 `ConfigurationConflict`
    pub fn register<T: BsonEntity>(&self) -> BsonResult<()> {
        let map = self.type_map::<T>()?;
        let key = map.discriminator().ok_or_else(|| {
            BsonError::conflict(map.type_name(), "registered type has no discriminator")
        })?;
        self.registry.insert::<T>(key)?;
        debug!("Registered {} as '{}'", map.type_name(), key);
        Ok(())
    }

    /// 修改 `T` 的外部映射并使其缓存失效
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// codec.configure::<Post>(|m| {
    ///     m.alias("title", "t");
    /// })?;
    /// ```
    pub fn configure<T: BsonEntity>(&self, f: impl FnOnce(&mut TypeMapping)) -> BsonResult<()> {
        let mapping = self.mapping.as_ref().ok_or_else(|| {
            BsonError::conflict(
                std::any::type_name::<T>(),
                "codec was built with an external alias resolver",
            )
        })?;
        mapping.update(T::type_key(), f);
        self.maps.invalidate::<T>();
        Ok(())
    }

    // ========================================================================
    // 编码
    // ========================================================================

    pub fn encode<V: ToBson + ?Sized>(&self, value: &V) -> BsonResult<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode_into(value, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// 追加到已有缓冲区；失败时缓冲区恢复原长度
    pub fn encode_into<V: ToBson + ?Sized>(&self, value: &V, buf: &mut BytesMut) -> BsonResult<()> {
        self.encode_with(value, buf, EncodeMode::Insert)
    }

    /// 更新载荷：不可变字段不写出
    pub fn encode_update<V: ToBson + ?Sized>(&self, value: &V) -> BsonResult<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode_with(value, &mut buf, EncodeMode::Update)?;
        Ok(buf.to_vec())
    }

    fn encode_with<V: ToBson + ?Sized>(
        &self,
        value: &V,
        buf: &mut BytesMut,
        mode: EncodeMode,
    ) -> BsonResult<()> {
        let element = value.element_type();
        if element != ElementType::Document {
            return Err(BsonError::unsupported::<V>(element.name()));
        }
        let start = buf.len();
        let mut enc = BsonEncoder::new(buf, self, mode);
        let result = value.write_payload(&mut enc);
        if result.is_err() {
            buf.truncate(start);
        }
        result
    }

    // ========================================================================
    // 解码
    // ========================================================================

    /// 解码第一个文档，之后的字节被忽略
    pub fn decode<T: FromBson>(&self, bytes: &[u8]) -> BsonResult<T> {
        BsonDecoder::new(bytes, self).decode_root()
    }

    /// 解码并收集顶层实体上没有映射的字段
    pub fn decode_with_overflow<T: FromBson>(&self, bytes: &[u8]) -> BsonResult<Decoded<T>> {
        let mut dec = BsonDecoder::new(bytes, self).capture_unmapped(true);
        let value = dec.decode_root()?;
        Ok(Decoded {
            value,
            overflow: dec.take_overflow(),
        })
    }

    /// 按首字段 `__type` 从注册表选择具体类型
    pub fn decode_polymorphic(&self, bytes: &[u8]) -> BsonResult<Box<dyn AnyEntity>> {
        self.decode(bytes)
    }

    /// 逐个读取首尾相接的文档
    pub fn reader<'a, T: FromBson>(&'a self, bytes: &'a [u8]) -> DocumentReader<'a, T> {
        DocumentReader::new(bytes, self)
    }
}

impl Default for BsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expando::Expando;
    use crate::reflect::TypeMapBuilder;
    use crate::{bson_entity, expando, ErrorKind};

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Post {
        title: String,
        views: i32,
    }

    impl BsonEntity for Post {
        fn describe(map: &mut TypeMapBuilder<Self>) {
            map.field("Title", |p| &p.title, |p, v| p.title = v);
            map.field("Views", |p| &p.views, |p, v| p.views = v);
        }

        fn type_key() -> &'static str {
            "blog.Post"
        }
    }

    bson_entity!(Post);

    #[derive(Debug, Default)]
    struct Plain;

    impl BsonEntity for Plain {
        fn describe(_map: &mut TypeMapBuilder<Self>) {}
    }

    struct UpperCase;

    impl AliasResolver for UpperCase {
        fn wire_name(&self, _type_key: &str, field: &str) -> Option<String> {
            Some(field.to_uppercase())
        }

        fn identifier_field(&self, _type_key: &str) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_configure_invalidates_cache() {
        let codec = BsonCodec::new();
        let post = Post {
            title: "Hi".to_string(),
            views: 1,
        };
        let before = codec.encode(&post).unwrap();

        codec
            .configure::<Post>(|m| {
                m.alias("Title", "t");
            })
            .unwrap();
        let after = codec.encode(&post).unwrap();
        assert_ne!(before, after);

        let props: Expando = codec.decode(&after).unwrap();
        assert_eq!(props.get_str("t"), Some("Hi"));
        let decoded: Post = codec.decode(&after).unwrap();
        assert_eq!(decoded, post);
    }

    #[test]
    fn test_external_resolver() {
        let codec = BsonCodec::with_resolver(CodecConfig::default(), Arc::new(UpperCase));
        let bytes = codec
            .encode(&Post {
                title: "x".to_string(),
                views: 2,
            })
            .unwrap();
        let props: Expando = codec.decode(&bytes).unwrap();
        assert_eq!(props.keys().collect::<Vec<_>>(), vec!["TITLE", "VIEWS"]);

        let err = codec.configure::<Post>(|_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationConflict);
    }

    #[test]
    fn test_register_requires_discriminator() {
        let codec = BsonCodec::new();
        let err = codec.register::<Plain>().unwrap_err();
        assert!(matches!(err, BsonError::ConfigurationConflict { .. }));
    }

    #[test]
    fn test_clones_share_state() {
        let codec = BsonCodec::new();
        let clone = codec.clone();
        codec.type_map::<Post>().unwrap();
        assert_eq!(clone.cache().len(), 1);
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let codec = BsonCodec::global();
        let mut bytes = codec.encode(&expando! { "a" => 1 }).unwrap();
        bytes.extend_from_slice(&[1, 2, 3]);
        let props: Expando = codec.decode(&bytes).unwrap();
        assert_eq!(props.get_i32("a"), Some(1));
    }

    #[test]
    fn test_encode_into_appends() {
        let codec = BsonCodec::new();
        let mut buf = BytesMut::new();
        codec.encode_into(&expando! { "a" => 1 }, &mut buf).unwrap();
        let first = buf.len();
        codec.encode_into(&expando! { "b" => 2 }, &mut buf).unwrap();
        let values: Vec<Expando> = codec.reader(&buf).collect::<BsonResult<_>>().unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1].get_i32("b"), Some(2));
        assert_eq!(first * 2, buf.len());
    }
}
