//! 工具模块
//!
//! 包含错误类型、日志系统与重试工具。

pub mod error;
pub mod logger;
pub mod retry;

// 重导出常用类型
pub use error::{error_code, status_code, CoreError, ErrorKind, Result};
pub use logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, ModuleLogger, RotationStrategy};
pub use retry::{retry_with_backoff, with_timeout, RetryPolicy};
