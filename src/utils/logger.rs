//! 日志系统模块
//!
//! 基于 tracing 生态的日志初始化，以及交给模块使用的层级日志句柄：
//!
//! - 多级别日志（TRACE, DEBUG, INFO, WARN, ERROR）
//! - 结构化日志（JSON 格式输出）
//! - 文件日志输出（异步非阻塞，按时间轮转）
//! - [`ModuleLogger`]：带层级名称的日志句柄，通过 `create_child` 派生
//!
//! # 示例
//!
//! ```rust,no_run
//! use module_runtime::utils::logger::{Logger, LoggerConfig, ModuleLogger};
//!
//! let _guard = Logger::init(LoggerConfig::builder().level("debug").build()).unwrap();
//!
//! let logger = ModuleLogger::new("runtime").create_child("chat");
//! logger.info("模块已就绪");
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::core::config::LogConfig;
use crate::utils::{CoreError, Result};

// ============================================================================
// 日志轮转策略
// ============================================================================

/// 日志轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 不轮转
    Never,
    /// 每小时轮转
    Hourly,
    /// 每天轮转（默认）
    #[default]
    Daily,
}

impl RotationStrategy {
    fn to_rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }

    /// 从字符串解析轮转策略，无法识别时使用每天轮转
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "never" | "none" => RotationStrategy::Never,
            "hourly" | "hour" => RotationStrategy::Hourly,
            _ => RotationStrategy::Daily,
        }
    }
}

// ============================================================================
// 日志配置
// ============================================================================

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认日志级别（"trace", "debug", "info", "warn", "error"）
    pub level: String,

    /// 是否使用 JSON 格式输出
    pub json_format: bool,

    /// 是否输出到控制台
    pub console_output: bool,

    /// 文件输出目录（None 表示不输出到文件）
    pub file_output: Option<PathBuf>,

    /// 日志文件名前缀
    pub file_prefix: String,

    /// 日志轮转策略
    pub rotation: RotationStrategy,

    /// 是否显示目标模块
    pub show_target: bool,

    /// 自定义过滤指令（EnvFilter 格式），例如 "module_runtime::module=debug"
    pub filter_directives: Option<String>,

    /// 是否启用 ANSI 颜色（仅控制台）
    pub ansi_colors: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: None,
            file_prefix: "module-runtime".to_string(),
            rotation: RotationStrategy::Daily,
            show_target: true,
            filter_directives: None,
            ansi_colors: true,
        }
    }
}

impl LoggerConfig {
    /// 创建配置构建器
    pub fn builder() -> LoggerConfigBuilder {
        LoggerConfigBuilder::default()
    }

    /// 从运行时的 [`LogConfig`] 转换
    pub fn from_log_config(log_config: &LogConfig) -> Self {
        let mut config = Self {
            level: log_config.level.clone(),
            json_format: log_config.json_format,
            rotation: RotationStrategy::parse(&log_config.rotation),
            ..Default::default()
        };
        if log_config.file_output {
            config.file_output = Some(
                log_config
                    .log_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("./logs")),
            );
        }
        config
    }
}

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    /// 设置日志级别
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    /// 启用或禁用 JSON 格式
    pub fn json_format(mut self, enable: bool) -> Self {
        self.config.json_format = enable;
        self
    }

    /// 启用或禁用控制台输出
    pub fn console_output(mut self, enable: bool) -> Self {
        self.config.console_output = enable;
        self
    }

    /// 设置文件输出目录
    pub fn file_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file_output = Some(dir.into());
        self
    }

    /// 设置轮转策略
    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation = strategy;
        self
    }

    /// 设置过滤指令
    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    /// 构建配置
    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

// ============================================================================
// 日志守卫
// ============================================================================

/// 日志系统守卫
///
/// 持有非阻塞写入器的 WorkerGuard，丢弃时刷新挂起的日志。
#[derive(Default)]
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

// ============================================================================
// 日志系统
// ============================================================================

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 日志系统
pub struct Logger;

impl Logger {
    /// 初始化全局日志订阅者
    ///
    /// # Returns
    ///
    /// 返回 `LogGuard`，必须保持存活直到程序退出
    ///
    /// # Errors
    ///
    /// 重复初始化或全局订阅者已被其他代码设置时返回 `CoreError::InitFailed`
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if LOGGER_INITIALIZED.get().is_some() {
            return Err(CoreError::InitFailed(
                "日志系统已初始化，不能重复初始化".to_string(),
            ));
        }

        let env_filter = Self::create_env_filter(&config);
        let mut guard = LogGuard::default();
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if config.console_output {
            let (writer, worker) = tracing_appender::non_blocking(io::stdout());
            guard._guards.push(worker);
            layers.push(Self::fmt_layer(&config, writer, config.ansi_colors));
        }

        if let Some(ref log_dir) = config.file_output {
            let appender = RollingFileAppender::new(
                config.rotation.to_rotation(),
                log_dir,
                format!("{}.log", config.file_prefix),
            );
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard._guards.push(worker);
            // 文件不使用 ANSI
            layers.push(Self::fmt_layer(&config, writer, false));
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(env_filter)
            .try_init()
            .map_err(|e| CoreError::InitFailed(format!("日志系统初始化失败: {}", e)))?;

        let _ = LOGGER_INITIALIZED.set(());
        Ok(guard)
    }

    /// 尝试初始化日志系统，已初始化时返回空守卫
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_default()
    }

    fn fmt_layer<W>(config: &LoggerConfig, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(config.show_target)
            .with_ansi(ansi && !config.json_format);
        if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    }

    /// 优先使用环境变量 RUST_LOG，其次是配置级别和附加指令
    fn create_env_filter(config: &LoggerConfig) -> EnvFilter {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

        match config.filter_directives {
            Some(ref directives) => directives
                .split(',')
                .filter_map(|d| d.trim().parse().ok())
                .fold(filter, |f, directive| f.add_directive(directive)),
            None => filter,
        }
    }
}

// ============================================================================
// 模块日志句柄
// ============================================================================

/// 交给模块使用的层级日志句柄
///
/// 句柄本身不格式化输出，只把消息连同 `logger` 字段转发给 tracing。
#[derive(Debug, Clone)]
pub struct ModuleLogger {
    name: Arc<str>,
}

impl ModuleLogger {
    /// 创建日志句柄
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
        }
    }

    /// 日志句柄名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 派生子句柄，名称为 `父名称.子名称`
    pub fn create_child(&self, name: impl AsRef<str>) -> Self {
        Self::new(format!("{}.{}", self.name, name.as_ref()))
    }

    /// DEBUG 级别日志
    pub fn debug(&self, message: impl AsRef<str>) {
        tracing::debug!(logger = %self.name, "{}", message.as_ref());
    }

    /// INFO 级别日志
    pub fn info(&self, message: impl AsRef<str>) {
        tracing::info!(logger = %self.name, "{}", message.as_ref());
    }

    /// WARN 级别日志
    pub fn warn(&self, message: impl AsRef<str>) {
        tracing::warn!(logger = %self.name, "{}", message.as_ref());
    }

    /// ERROR 级别日志
    pub fn error(&self, message: impl AsRef<str>) {
        tracing::error!(logger = %self.name, "{}", message.as_ref());
    }
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_parse() {
        assert_eq!(RotationStrategy::parse("hourly"), RotationStrategy::Hourly);
        assert_eq!(RotationStrategy::parse("NONE"), RotationStrategy::Never);
        assert_eq!(RotationStrategy::parse("unknown"), RotationStrategy::Daily);
    }

    #[test]
    fn test_config_builder() {
        let config = LoggerConfig::builder()
            .level("debug")
            .json_format(true)
            .file_output("/tmp/logs")
            .rotation(RotationStrategy::Hourly)
            .build();

        assert_eq!(config.level, "debug");
        assert!(config.json_format);
        assert_eq!(config.file_output, Some(PathBuf::from("/tmp/logs")));
        assert_eq!(config.rotation, RotationStrategy::Hourly);
    }

    #[test]
    fn test_from_log_config() {
        let log_config = LogConfig {
            level: "warn".to_string(),
            file_output: true,
            log_dir: None,
            json_format: true,
            rotation: "never".to_string(),
        };
        let config = LoggerConfig::from_log_config(&log_config);

        assert_eq!(config.level, "warn");
        assert!(config.json_format);
        assert_eq!(config.rotation, RotationStrategy::Never);
        assert_eq!(config.file_output, Some(PathBuf::from("./logs")));
    }

    #[test]
    fn test_try_init_is_idempotent() {
        let _first = Logger::try_init(LoggerConfig::builder().console_output(false).build());
        let _second = Logger::try_init(LoggerConfig::default());
        assert!(Logger::init(LoggerConfig::default()).is_err());
    }

    #[test]
    fn test_module_logger_child() {
        let root = ModuleLogger::new("runtime");
        let child = root.create_child("chat");
        let grandchild = child.create_child("history");

        assert_eq!(child.name(), "runtime.chat");
        assert_eq!(grandchild.name(), "runtime.chat.history");
        // 父句柄不受影响
        assert_eq!(root.name(), "runtime");
        grandchild.info("不会 panic");
    }
}
