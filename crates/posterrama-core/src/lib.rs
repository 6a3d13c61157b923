//! Posterrama Core - 核心类型和抽象
//!
//! 提供配置模型、配置加载与统一错误类型。

pub mod config;
pub mod error;

pub use config::*;
pub use error::*;
