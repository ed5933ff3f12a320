//! 配置模块
//!
//! 编解码与线协议层的可调参数。所有结构体都带 `Default`，
//! 可以直接从 TOML 文件加载，缺省字段回落到默认值。

use crate::error::{NormError, NormResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 服务端对单个文档的体积上限
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// 文档/数组的最大嵌套层级
    pub max_nesting_depth: usize,
    /// 为 true 时，静态类型上找不到映射的顶层字段进入溢出容器而不是报错
    pub capture_unmapped: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: 100,
            capture_unmapped: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    pub max_document_size: usize,
    /// 单条插入消息中文档字节总和的上限
    pub max_batch_size: usize,
    pub max_batch_count: usize,
    pub max_message_size: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_batch_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_batch_count: 1000,
            max_message_size: 48 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormConfig {
    pub codec: CodecConfig,
    pub wire: WireConfig,
}

impl NormConfig {
    /// 从 TOML 文本解析配置
    ///
    /// # Arguments
    /// * `text` - TOML 格式的配置内容
    ///
    /// # Returns
    /// 成功返回配置，语法或类型错误返回 `NormError::Config`
    pub fn from_toml_str(text: &str) -> NormResult<Self> {
        toml::from_str(text).map_err(|e| NormError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> NormResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!("Loaded configuration from {:?}", path.as_ref());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NormConfig::default();
        assert_eq!(config.wire.max_document_size, 4 * 1024 * 1024);
        assert_eq!(config.codec.max_nesting_depth, 100);
        assert!(!config.codec.capture_unmapped);
    }

    #[test]
    fn test_partial_toml() {
        let config = NormConfig::from_toml_str(
            r#"
            [codec]
            capture_unmapped = true

            [wire]
            max_batch_count = 10
            "#,
        )
        .unwrap();
        assert!(config.codec.capture_unmapped);
        assert_eq!(config.codec.max_nesting_depth, 100);
        assert_eq!(config.wire.max_batch_count, 10);
        assert_eq!(config.wire.max_batch_size, DEFAULT_MAX_DOCUMENT_SIZE);
    }

    #[test]
    fn test_invalid_toml() {
        let err = NormConfig::from_toml_str("[codec]\nmax_nesting_depth = \"deep\"").unwrap_err();
        assert!(matches!(err, NormError::Config(_)));
    }

    #[test]
    fn test_json_round_trip() {
        let config = NormConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let parsed: NormConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(config, parsed);
    }
}
