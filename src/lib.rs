//! # Module Runtime - 模块运行时
//!
//! 管理可插拔功能模块的运行时内核，提供以下核心功能：
//!
//! - **模块注册表**: 注册、依赖解析、按依赖顺序加载与卸载
//! - **模块加载器**: 按路径实例化模块，带超时、重试与 LRU 缓存
//! - **健康检查**: 定时检查模块健康状态并聚合
//! - **事件总线**: 模块间的松耦合通信机制
//! - **配置管理**: 点分键配置树与变更监听
//! - **日志系统**: 结构化日志记录
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use module_runtime::{ConfigManager, ModuleRegistry, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = RuntimeConfig::default();
//!     let config = Arc::new(ConfigManager::new());
//!
//!     let registry = ModuleRegistry::from_runtime_config(&runtime, config);
//!     registry.start_config_watch().await;
//!
//!     let report = registry.load_enabled_modules().await?;
//!     println!("已加载 {} 个模块", report.loaded.len());
//!
//!     registry.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 模块契约、加载器、健康检查与注册表
//! - `event` - 事件与事件总线
//! - `core` - 运行时配置和配置服务
//! - `utils` - 错误类型、日志与重试工具

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod core;
pub mod event;
pub mod module;
pub mod utils;

// 重导出常用类型，方便使用
pub use event::{system_events, Event, EventBus, EventFilter, ModuleEventBus};

pub use module::{
    HealthChecker, HealthState, HealthStatus, LifecycleDriver, Module, ModuleBase, ModuleContext,
    ModuleDependency, ModuleLoader, ModuleMetadata, ModuleRegistry, ModuleStatus,
};

pub use utils::{error_code, status_code, CoreError, ErrorKind, Result};
pub use utils::logger::{Logger, LoggerConfig, LoggerConfigBuilder, LogGuard, ModuleLogger, RotationStrategy};

pub use core::config::{
    HealthCheckConfig, LoaderConfig, LogConfig, RegistryConfig, RuntimeConfig, RuntimeConfigBuilder,
};
pub use core::config_manager::{ConfigChange, ConfigManager, ConfigProvider};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
