//! 错误类型
//!
//! 只有"配置错误"以 `Result` 形式返回：它们应该在构建模型时暴露出来。
//! 形状不匹配等调用方缺陷直接 `assert!` 失败，不做任何恢复。

use thiserror::Error;

/// 构建或配置模型时可能出现的错误
#[derive(Debug, Error)]
pub enum ModelError {
    /// 非法的配置项
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// 某个解码器不支持请求的功能
    #[error("{decoder} decoder does not support {feature}")]
    Unsupported {
        decoder: &'static str,
        feature: &'static str,
    },

    /// 编码器输出与解码器不兼容
    #[error("Incompatible decoder state: {0}")]
    IncompatibleState(String),

    /// 读取配置文件失败
    #[error("Failed to read options: {0}")]
    Io(#[from] std::io::Error),

    /// 配置文件格式错误
    #[error("Failed to parse options: {0}")]
    Json(#[from] serde_json::Error),
}

/// 本 crate 的 Result 类型
pub type Result<T> = std::result::Result<T, ModelError>;
