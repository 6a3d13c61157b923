//! 统一错误处理

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PosterramaError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("设备错误: {0}")]
    Device(String),

    #[error("未知错误: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, PosterramaError>;
