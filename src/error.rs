//! 错误类型
//! Error types shared by the gate pipeline

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    /// 配置参数非法
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// 采集源无法打开或已失效
    #[error("capture error: {0}")]
    Capture(String),

    /// 授权库读写失败
    #[error("store error: {0}")]
    Store(String),

    /// 检测模型加载失败
    #[error("model error: {0}")]
    Model(String),
}

pub type Result<T> = std::result::Result<T, GateError>;
