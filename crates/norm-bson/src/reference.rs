//! 文档引用
//!
//! `{ "$ref": 集合, "$id": 标识, "$db": 数据库 }` 形式的引用。
//! 作为引用包装类型，它的标识符字段写成 `$id` 而不是 `_id`。

use crate::reflect::{BsonEntity, TypeMapBuilder};
use crate::value::BsonValue;
use norm_common::Namespace;

/// 指向另一集合中文档的引用
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbReference {
    pub collection: String,
    pub id: BsonValue,
    pub database: Option<String>,
}

impl DbReference {
    pub fn new(collection: impl Into<String>, id: impl Into<BsonValue>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// 完整命名空间；没有数据库名时使用 `default_database`
    pub fn namespace(&self, default_database: &str) -> norm_common::NormResult<Namespace> {
        let database = self.database.as_deref().unwrap_or(default_database);
        Namespace::new(database, self.collection.as_str())
    }
}

impl BsonEntity for DbReference {
    fn describe(map: &mut TypeMapBuilder<Self>) {
        map.reference_wrapper();
        map.field("Collection", |r| &r.collection, |r, v| r.collection = v)
            .alias("$ref");
        map.field("Id", |r| &r.id, |r, v| r.id = v);
        map.field("Database", |r| &r.database, |r, v| r.database = v)
            .alias("$db")
            .ignore_if_null();
    }

    fn type_key() -> &'static str {
        "norm.DbReference"
    }
}

crate::bson_entity!(DbReference);
