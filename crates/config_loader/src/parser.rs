//! 中继配置解析
//!
//! TOML 为主，JSON 可选；所有字段都有默认值。

use contracts::{ContractError, RelayConfig};

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML 格式 (推荐)
    Toml,
    /// JSON 格式
    Json,
}

impl ConfigFormat {
    /// 从文件扩展名推断格式
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

fn parse_error<E>(format: &str, e: E) -> ContractError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ContractError::ConfigParse {
        message: format!("{format} parse error: {e}"),
        source: Some(Box::new(e)),
    }
}

/// 解析 TOML 格式中继配置
pub fn parse_toml(content: &str) -> Result<RelayConfig, ContractError> {
    toml::from_str(content).map_err(|e| parse_error("TOML", e))
}

/// 解析 JSON 格式中继配置
pub fn parse_json(content: &str) -> Result<RelayConfig, ContractError> {
    serde_json::from_str(content).map_err(|e| parse_error("JSON", e))
}

/// 根据格式解析配置；缺省字段取默认值
pub fn parse(content: &str, format: ConfigFormat) -> Result<RelayConfig, ContractError> {
    match format {
        ConfigFormat::Toml => parse_toml(content),
        ConfigFormat::Json => parse_json(content),
    }
}
