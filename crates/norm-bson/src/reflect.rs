//! 类型映射与缓存
//!
//! 每个实体类型通过 `BsonEntity::describe` 声明字段表。首次编解码时构建
//! `TypeMap<T>`：解析别名、确定标识符字段、检查冲突，然后缓存到进程结束
//! 或配置变更使其失效为止。

use crate::converter::ValueConverter;
use crate::decoder::BsonDecoder;
use crate::encoder::{BsonEncoder, EncodeMode};
use crate::expando::{eq_folded, Expando};
use crate::mapping::AliasResolver;
use crate::spec::{ElementType, DISCRIMINATOR_FIELD, ID_FIELD, REFERENCE_ID_FIELD};
use crate::{BsonError, BsonResult, FromBson, ToBson};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 可映射为文档的实体
///
/// 实现方还需要用 `bson_entity!` 生成 `ToBson` / `FromBson`。
pub trait BsonEntity: Default + fmt::Debug + Send + Sync + 'static {
    /// 声明字段表；没有声明的字段不参与编解码
    fn describe(map: &mut TypeMapBuilder<Self>);

    /// 映射配置与缓存日志使用的类型键
    fn type_key() -> &'static str {
        std::any::type_name::<Self>()
    }
}

type Writer<T> = Box<dyn Fn(&T, &mut BsonEncoder<'_>, &str) -> BsonResult<()> + Send + Sync>;
type Reader<T> = Box<dyn Fn(&mut T, ElementType, &mut BsonDecoder<'_>) -> BsonResult<()> + Send + Sync>;
type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type ExpandoAccess<T> = (fn(&T) -> &Expando, fn(&mut T) -> &mut Expando);

/// 单个映射字段
///
/// 读写访问器都可能缺失：只读的派生字段没有 reader，只写的字段没有 writer。
pub struct PropertyMap<T> {
    name: &'static str,
    wire_name: String,
    declared_type: &'static str,
    identifier_marker: bool,
    is_identifier: bool,
    ignore_if_null: bool,
    immutable: bool,
    is_null: Option<Predicate<T>>,
    is_default: Option<Predicate<T>>,
    writer: Option<Writer<T>>,
    reader: Option<Reader<T>>,
}

impl<T> PropertyMap<T> {
    fn new(name: &'static str, declared_type: &'static str) -> Self {
        Self {
            name,
            wire_name: name.to_string(),
            declared_type,
            identifier_marker: false,
            is_identifier: false,
            ignore_if_null: false,
            immutable: false,
            is_null: None,
            is_default: None,
            writer: None,
            reader: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn wire_name(&self) -> &str {
        &self.wire_name
    }

    pub fn declared_type(&self) -> &'static str {
        self.declared_type
    }

    pub fn is_identifier(&self) -> bool {
        self.is_identifier
    }

    pub fn ignores_null(&self) -> bool {
        self.ignore_if_null
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub fn has_default(&self) -> bool {
        self.is_default.is_some()
    }

    /// 是否会被编码(有读取实体的访问器)
    pub fn is_readable(&self) -> bool {
        self.writer.is_some()
    }

    /// 是否会被解码(有写入实体的访问器)
    pub fn is_writable(&self) -> bool {
        self.reader.is_some()
    }

    /// 按跳过规则写出字段，返回是否真正写出
    pub(crate) fn write(&self, entity: &T, enc: &mut BsonEncoder<'_>) -> BsonResult<bool> {
        let Some(writer) = &self.writer else {
            return Ok(false);
        };
        if self.ignore_if_null && self.is_null.as_ref().map_or(false, |is_null| is_null(entity)) {
            return Ok(false);
        }
        if self.is_default.as_ref().map_or(false, |is_default| is_default(entity)) {
            return Ok(false);
        }
        if self.immutable && enc.mode() == EncodeMode::Update {
            return Ok(false);
        }
        writer(entity, enc, &self.wire_name)?;
        Ok(true)
    }

    /// 解码到实体上；没有 setter 的字段读出后丢弃
    pub(crate) fn read(
        &self,
        entity: &mut T,
        element: ElementType,
        dec: &mut BsonDecoder<'_>,
    ) -> BsonResult<()> {
        match &self.reader {
            Some(reader) => reader(entity, element, dec),
            None => dec.skip_value(element),
        }
    }
}

impl<T> fmt::Debug for PropertyMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyMap")
            .field("name", &self.name)
            .field("wire_name", &self.wire_name)
            .field("declared_type", &self.declared_type)
            .field("is_identifier", &self.is_identifier)
            .field("ignore_if_null", &self.ignore_if_null)
            .field("immutable", &self.immutable)
            .field("has_default", &self.is_default.is_some())
            .finish()
    }
}

/// 取值方式：借用字段或计算派生值
enum Getter<T, F> {
    Ref(fn(&T) -> &F),
    Owned(fn(&T) -> F),
}

impl<T, F> Clone for Getter<T, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, F> Copy for Getter<T, F> {}

impl<T, F: PartialEq> Getter<T, F> {
    fn equals(&self, entity: &T, other: &F) -> bool {
        match self {
            Getter::Ref(get) => get(entity) == other,
            Getter::Owned(get) => &get(entity) == other,
        }
    }
}

/// 字段选项
///
/// 由 `TypeMapBuilder` 的字段方法返回，链式设置。
pub struct PropertyOptions<'b, T, F> {
    property: &'b mut PropertyMap<T>,
    getter: Option<Getter<T, F>>,
    _value: PhantomData<fn() -> F>,
}

impl<'b, T: 'static, F: 'static> PropertyOptions<'b, T, F> {
    /// 声明线上字段名；外部配置的别名优先
    pub fn alias(self, wire_name: &str) -> Self {
        self.property.wire_name = wire_name.to_string();
        self
    }

    /// 值为 null 时不写出
    pub fn ignore_if_null(self) -> Self {
        self.property.ignore_if_null = true;
        self
    }

    /// 写更新载荷时跳过
    pub fn immutable(self) -> Self {
        self.property.immutable = true;
        self
    }

    /// 标记为标识符字段
    pub fn identifier(self) -> Self {
        self.property.identifier_marker = true;
        self
    }

    /// 值等于 `default` 时不写出
    pub fn default_value(self, default: F) -> Self
    where
        F: PartialEq + Send + Sync,
    {
        if let Some(getter) = self.getter {
            self.property.is_default = Some(Box::new(move |entity: &T| getter.equals(entity, &default)));
        }
        self
    }
}

/// 字段表构建器
pub struct TypeMapBuilder<T> {
    properties: Vec<PropertyMap<T>>,
    expando: Option<ExpandoAccess<T>>,
    discriminator: Option<&'static str>,
    reference_wrapper: bool,
}

impl<T: 'static> TypeMapBuilder<T> {
    fn new() -> Self {
        Self {
            properties: Vec::new(),
            expando: None,
            discriminator: None,
            reference_wrapper: false,
        }
    }

    fn push<F: 'static>(
        &mut self,
        property: PropertyMap<T>,
        getter: Option<Getter<T, F>>,
    ) -> PropertyOptions<'_, T, F> {
        let index = self.properties.len();
        self.properties.push(property);
        PropertyOptions {
            property: &mut self.properties[index],
            getter,
            _value: PhantomData,
        }
    }

    /// 普通读写字段
    ///
    /// # Arguments
    /// * `name` - 字段名，默认也是线上名
    /// * `get` - 借用字段值
    /// * `set` - 写入解码出的值；遇到 null 且类型不可空时不会调用
    pub fn field<F>(
        &mut self,
        name: &'static str,
        get: fn(&T) -> &F,
        set: fn(&mut T, F),
    ) -> PropertyOptions<'_, T, F>
    where
        F: ToBson + FromBson + 'static,
    {
        let mut property = PropertyMap::new(name, std::any::type_name::<F>());
        property.is_null = Some(Box::new(move |entity: &T| get(entity).element_type().is_null()));
        property.writer = Some(Box::new(move |entity: &T, enc: &mut BsonEncoder<'_>, wire: &str| {
            enc.write_element(wire, get(entity))
        }));
        property.reader = Some(Box::new(move |entity: &mut T, element: ElementType, dec: &mut BsonDecoder<'_>| {
            if element.is_null() && !F::NULLABLE {
                return Ok(());
            }
            set(entity, F::read_payload(element, dec)?);
            Ok(())
        }));
        self.push(property, Some(Getter::Ref(get)))
    }

    /// 没有 setter 的集合字段：解码时追加/插入到已有集合
    pub fn collection<F>(
        &mut self,
        name: &'static str,
        get: fn(&T) -> &F,
        get_mut: fn(&mut T) -> &mut F,
    ) -> PropertyOptions<'_, T, F>
    where
        F: ToBson + FromBson + 'static,
    {
        let mut property = PropertyMap::new(name, std::any::type_name::<F>());
        property.is_null = Some(Box::new(move |entity: &T| get(entity).element_type().is_null()));
        property.writer = Some(Box::new(move |entity: &T, enc: &mut BsonEncoder<'_>, wire: &str| {
            enc.write_element(wire, get(entity))
        }));
        property.reader = Some(Box::new(move |entity: &mut T, element: ElementType, dec: &mut BsonDecoder<'_>| {
            if element.is_null() && !F::NULLABLE {
                return Ok(());
            }
            get_mut(entity).read_into(element, dec)
        }));
        self.push(property, Some(Getter::Ref(get)))
    }

    /// 只读的派生字段：编码时写出，解码时读出后丢弃
    pub fn derived<F>(&mut self, name: &'static str, get: fn(&T) -> F) -> PropertyOptions<'_, T, F>
    where
        F: ToBson + 'static,
    {
        let mut property = PropertyMap::new(name, std::any::type_name::<F>());
        property.is_null = Some(Box::new(move |entity: &T| get(entity).element_type().is_null()));
        property.writer = Some(Box::new(move |entity: &T, enc: &mut BsonEncoder<'_>, wire: &str| {
            enc.write_element(wire, &get(entity))
        }));
        self.push(property, Some(Getter::Owned(get)))
    }

    /// 只写字段：只参与解码
    pub fn ingest<F>(&mut self, name: &'static str, set: fn(&mut T, F)) -> PropertyOptions<'_, T, F>
    where
        F: FromBson + 'static,
    {
        let mut property = PropertyMap::new(name, std::any::type_name::<F>());
        property.reader = Some(Box::new(move |entity: &mut T, element: ElementType, dec: &mut BsonDecoder<'_>| {
            if element.is_null() && !F::NULLABLE {
                return Ok(());
            }
            set(entity, F::read_payload(element, dec)?);
            Ok(())
        }));
        self.push(property, None)
    }

    /// 经过值转换器读写的字段，内存类型与线上类型不同
    pub fn converted<C>(
        &mut self,
        name: &'static str,
        get: fn(&T) -> &C::Value,
        set: fn(&mut T, C::Value),
        converter: C,
    ) -> PropertyOptions<'_, T, C::Value>
    where
        C: ValueConverter,
        C::Value: 'static,
    {
        let converter = Arc::new(converter);
        let mut property = PropertyMap::new(name, std::any::type_name::<C::Value>());

        let conv = Arc::clone(&converter);
        property.is_null = Some(Box::new(move |entity: &T| {
            conv.to_wire(get(entity))
                .map_or(false, |wire| wire.element_type().is_null())
        }));
        let conv = Arc::clone(&converter);
        property.writer = Some(Box::new(move |entity: &T, enc: &mut BsonEncoder<'_>, wire: &str| {
            let value = conv.to_wire(get(entity))?;
            enc.write_element(wire, &value)
        }));
        property.reader = Some(Box::new(move |entity: &mut T, element: ElementType, dec: &mut BsonDecoder<'_>| {
            if element.is_null() && !<C::Wire as FromBson>::NULLABLE {
                return Ok(());
            }
            let wire = <C::Wire as FromBson>::read_payload(element, dec)?;
            set(entity, converter.from_wire(wire)?);
            Ok(())
        }));
        self.push(property, Some(Getter::Ref(get)))
    }

    /// 声明动态属性容器；未映射的线上字段存入其中
    pub fn expando(&mut self, get: fn(&T) -> &Expando, get_mut: fn(&mut T) -> &mut Expando) -> &mut Self {
        self.expando = Some((get, get_mut));
        self
    }

    /// 写出 `__type` 判别字段，并允许出现在多态槽位中
    pub fn discriminated(&mut self, key: &'static str) -> &mut Self {
        self.discriminator = Some(key);
        self
    }

    /// 引用包装类型：标识符写成 `$id`
    pub fn reference_wrapper(&mut self) -> &mut Self {
        self.reference_wrapper = true;
        self
    }
}

/// 已构建的类型映射
pub struct TypeMap<T> {
    type_key: &'static str,
    type_name: &'static str,
    properties: Vec<PropertyMap<T>>,
    by_wire: HashMap<String, usize>,
    identifier: Option<usize>,
    expando: Option<ExpandoAccess<T>>,
    discriminator: Option<&'static str>,
    reference_wrapper: bool,
}

impl<T: BsonEntity> TypeMap<T> {
    /// 构建映射
    ///
    /// # Brief
    /// 执行字段声明、应用外部别名、按优先级确定标识符并检查冲突
    ///
    /// # 标识符优先级
    /// 1. 外部配置指定的字段
    /// 2. 带标识符标记的字段
    /// 3. 名为 `_id` 的字段(忽略大小写)
    /// 4. 名为 `Id` 的字段(忽略大小写)
    ///
    /// # Returns
    /// 规则互相矛盾时返回 `ConfigurationConflict`
    pub fn build(resolver: &dyn AliasResolver) -> BsonResult<Self> {
        let type_key = T::type_key();
        let type_name = std::any::type_name::<T>();
        let mut builder = TypeMapBuilder::<T>::new();
        T::describe(&mut builder);

        let TypeMapBuilder {
            mut properties,
            expando,
            discriminator,
            reference_wrapper,
        } = builder;

        for property in properties.iter_mut() {
            if let Some(wire) = resolver.wire_name(type_key, property.name) {
                property.wire_name = wire;
            }
        }

        let identifier = Self::resolve_identifier(&properties, resolver, type_key, type_name)?;
        if let Some(index) = identifier {
            let property = &mut properties[index];
            property.is_identifier = true;
            property.wire_name = if reference_wrapper {
                REFERENCE_ID_FIELD.to_string()
            } else {
                ID_FIELD.to_string()
            };
        }

        let mut by_wire = HashMap::with_capacity(properties.len());
        for (index, property) in properties.iter().enumerate() {
            let wire = property.wire_name.as_str();
            if wire.is_empty() || wire.contains('\0') {
                return Err(BsonError::conflict(
                    type_name,
                    format!("field '{}' has an invalid wire name {:?}", property.name, wire),
                ));
            }
            if eq_folded(wire, DISCRIMINATOR_FIELD) {
                return Err(BsonError::conflict(
                    type_name,
                    format!("field '{}' uses the reserved name {}", property.name, DISCRIMINATOR_FIELD),
                ));
            }
            if let Some(other) = properties[..index]
                .iter()
                .find(|other| eq_folded(&other.wire_name, wire))
            {
                return Err(BsonError::conflict(
                    type_name,
                    format!(
                        "fields '{}' and '{}' both map to wire name '{}'",
                        other.name, property.name, wire
                    ),
                ));
            }
            by_wire.insert(wire.to_string(), index);
        }

        Ok(Self {
            type_key,
            type_name,
            properties,
            by_wire,
            identifier,
            expando,
            discriminator,
            reference_wrapper,
        })
    }

    fn resolve_identifier(
        properties: &[PropertyMap<T>],
        resolver: &dyn AliasResolver,
        type_key: &str,
        type_name: &str,
    ) -> BsonResult<Option<usize>> {
        let find = |name: &str| properties.iter().position(|p| eq_folded(p.name, name));

        let configured = match resolver.identifier_field(type_key) {
            Some(field) => Some(find(&field).ok_or_else(|| {
                BsonError::conflict(type_name, format!("configured identifier '{}' is not a mapped field", field))
            })?),
            None => None,
        };

        let marked: Vec<usize> = properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.identifier_marker)
            .map(|(i, _)| i)
            .collect();
        if marked.len() > 1 {
            return Err(BsonError::conflict(type_name, "more than one field is marked as identifier"));
        }

        let named = find(ID_FIELD);
        let designated = configured.or_else(|| marked.first().copied());
        if let (Some(named), Some(designated)) = (named, designated) {
            if named != designated {
                return Err(BsonError::conflict(
                    type_name,
                    format!(
                        "field '{}' and designated identifier '{}' both claim {}",
                        properties[named].name, properties[designated].name, ID_FIELD
                    ),
                ));
            }
        }

        Ok(designated.or(named).or_else(|| find("Id")))
    }
}

impl<T> TypeMap<T> {
    pub fn type_key(&self) -> &'static str {
        self.type_key
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// 按声明顺序排列的字段
    pub fn properties(&self) -> &[PropertyMap<T>] {
        &self.properties
    }

    /// 按线上名查找字段，先精确匹配再忽略大小写
    pub fn property(&self, wire_name: &str) -> Option<&PropertyMap<T>> {
        match self.by_wire.get(wire_name) {
            Some(&index) => Some(&self.properties[index]),
            None => self
                .properties
                .iter()
                .find(|p| eq_folded(&p.wire_name, wire_name)),
        }
    }

    pub fn identifier(&self) -> Option<&PropertyMap<T>> {
        self.identifier.map(|index| &self.properties[index])
    }

    pub fn discriminator(&self) -> Option<&'static str> {
        self.discriminator
    }

    pub fn is_dynamic(&self) -> bool {
        self.expando.is_some()
    }

    pub fn is_reference_wrapper(&self) -> bool {
        self.reference_wrapper
    }

    pub fn expando_of<'e>(&self, entity: &'e T) -> Option<&'e Expando> {
        self.expando.map(|(get, _)| get(entity))
    }

    pub fn expando_mut<'e>(&self, entity: &'e mut T) -> Option<&'e mut Expando> {
        self.expando.map(|(_, get_mut)| get_mut(entity))
    }
}

impl<T> fmt::Debug for TypeMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMap")
            .field("type_key", &self.type_key)
            .field("properties", &self.properties)
            .field("discriminator", &self.discriminator)
            .field("dynamic", &self.expando.is_some())
            .field("reference_wrapper", &self.reference_wrapper)
            .finish()
    }
}

/// 类型映射缓存
///
/// 按 `TypeId` 记忆化。稳态读取无锁；构建在锁外进行，并发构建时先插入者生效。
/// 失效操作推进代数，构建期间代数变化的结果不会入缓存。
pub struct TypeMapCache {
    resolver: Arc<dyn AliasResolver>,
    maps: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    generation: AtomicU64,
}

impl TypeMapCache {
    pub fn new(resolver: Arc<dyn AliasResolver>) -> Self {
        Self {
            resolver,
            maps: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// 获取或构建 `T` 的映射
    ///
    /// 构建失败(配置冲突)不会被缓存，每次获取都会重新报告。
    pub fn get_or_build<T: BsonEntity>(&self) -> BsonResult<Arc<TypeMap<T>>> {
        let id = TypeId::of::<T>();
        loop {
            if let Some(entry) = self.maps.get(&id) {
                return Self::downcast(Arc::clone(entry.value()));
            }

            let generation = self.generation.load(Ordering::Acquire);
            let built: Arc<dyn Any + Send + Sync> = Arc::new(TypeMap::<T>::build(self.resolver.as_ref())?);

            // 代数检查与插入都在分片锁内完成
            let stored = match self.maps.entry(id) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    if self.generation.load(Ordering::Acquire) != generation {
                        debug!("Type map for {} invalidated during build, rebuilding", T::type_key());
                        continue;
                    }
                    debug!("Built type map for {}", T::type_key());
                    Arc::clone(entry.insert(built).value())
                }
            };
            return Self::downcast(stored);
        }
    }

    fn downcast<T: BsonEntity>(entry: Arc<dyn Any + Send + Sync>) -> BsonResult<Arc<TypeMap<T>>> {
        entry.downcast::<TypeMap<T>>().map_err(|_| {
            BsonError::conflict(std::any::type_name::<T>(), "cached type map has a different type")
        })
    }

    /// 使 `T` 的映射失效，下次使用时重新构建
    pub fn invalidate<T: 'static>(&self) -> bool {
        self.invalidate_type(TypeId::of::<T>())
    }

    pub fn invalidate_type(&self, id: TypeId) -> bool {
        // 先推进代数再移除，进行中的构建要么重建，要么其结果被这里移除
        self.generation.fetch_add(1, Ordering::AcqRel);
        let removed = self.maps.remove(&id).is_some();
        if removed {
            debug!("Invalidated type map {:?}", id);
        }
        removed
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.maps.clear();
        debug!("Cleared type map cache");
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

impl fmt::Debug for TypeMapCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMapCache").field("entries", &self.maps.len()).finish()
    }
}
