//! 配置校验模块
//!
//! 校验规则：
//! - 字段范围 (validator derive: sample_rate, 超时, 队列容量)
//! - backends 非空且地址不为空
//! - targets_enabled 数量不超过 backends
//! - single 模式下 primary_index 在范围内
//! - 地址 scheme 为 ws / wss / log

use contracts::{ContractError, DeliveryMode, RelayConfig};
use validator::{Validate, ValidationErrors};

const SUPPORTED_SCHEMES: [&str; 3] = ["ws", "wss", "log"];

/// 校验 RelayConfig 配置
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(config: &RelayConfig) -> Result<(), ContractError> {
    config.validate().map_err(first_field_error)?;
    validate_backends(config)?;
    validate_enabled_flags(config)?;
    validate_primary_index(config)?;
    Ok(())
}

/// derive 规则的错误转换为带路径的校验错误
fn first_field_error(errors: ValidationErrors) -> ContractError {
    fn walk(prefix: &str, errors: &ValidationErrors) -> Option<ContractError> {
        for (field, kind) in errors.errors() {
            let path = if prefix.is_empty() {
                field.to_string()
            } else {
                format!("{prefix}.{field}")
            };
            match kind {
                validator::ValidationErrorsKind::Field(list) => {
                    if let Some(e) = list.first() {
                        return Some(ContractError::config_validation(path, e.to_string()));
                    }
                }
                validator::ValidationErrorsKind::Struct(nested) => {
                    if let Some(e) = walk(&path, nested) {
                        return Some(e);
                    }
                }
                validator::ValidationErrorsKind::List(items) => {
                    for (idx, nested) in items {
                        if let Some(e) = walk(&format!("{path}[{idx}]"), nested) {
                            return Some(e);
                        }
                    }
                }
            }
        }
        None
    }

    walk("", &errors).unwrap_or_else(|| ContractError::config_validation("config", errors.to_string()))
}

/// 校验目标地址
fn validate_backends(config: &RelayConfig) -> Result<(), ContractError> {
    if config.backends.is_empty() {
        return Err(ContractError::config_validation(
            "backends",
            "at least one backend address is required",
        ));
    }
    for (idx, address) in config.backends.iter().enumerate() {
        let address = address.trim();
        if address.is_empty() {
            return Err(ContractError::config_validation(
                format!("backends[{idx}]"),
                "backend address cannot be empty",
            ));
        }
        let scheme = address
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase());
        if !scheme.is_some_and(|s| SUPPORTED_SCHEMES.contains(&s.as_str())) {
            return Err(ContractError::config_validation(
                format!("backends[{idx}]"),
                "address must start with ws://, wss:// or log://",
            ));
        }
    }
    Ok(())
}

/// 校验 enabled 标志数量
fn validate_enabled_flags(config: &RelayConfig) -> Result<(), ContractError> {
    if config.targets_enabled.len() > config.backends.len() {
        return Err(ContractError::config_validation(
            "targets_enabled",
            format!(
                "{} flags given for {} backend(s)",
                config.targets_enabled.len(),
                config.backends.len()
            ),
        ));
    }
    Ok(())
}

/// 校验 single 模式的主目标
fn validate_primary_index(config: &RelayConfig) -> Result<(), ContractError> {
    if config.mode == DeliveryMode::Single && config.primary_index >= config.backends.len() {
        return Err(ContractError::config_validation(
            "primary_index",
            format!(
                "primary_index {} out of range for {} backend(s)",
                config.primary_index,
                config.backends.len()
            ),
        ));
    }
    Ok(())
}
