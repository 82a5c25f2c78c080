//! 核心模块
//!
//! 包含运行时配置和配置服务。

pub mod config;
pub mod config_manager;

pub use config::{
    HealthCheckConfig, LoaderConfig, LogConfig, RegistryConfig, RuntimeConfig,
    RuntimeConfigBuilder,
};
pub use config_manager::{ConfigChange, ConfigManager, ConfigProvider, ConfigWatchCallback};
