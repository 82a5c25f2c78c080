//! 运行时配置
//!
//! 定义运行时各组件的配置结构和加载逻辑。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::retry::RetryPolicy;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
        }
    }
}

/// 模块加载器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// 默认路径约定的根目录，模块路径为 `{base_path}/{module_id}`
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// 是否启用实例缓存
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// 缓存容量
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// 单次实例化超时（毫秒）
    #[serde(default = "default_load_timeout_ms")]
    pub timeout_ms: u64,

    /// 失败后的重试次数
    #[serde(default = "default_load_retries")]
    pub retries: u32,

    /// 退避基数（毫秒），第 n 次失败后等待 `base * 2^n`
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// 显式路径映射：模块 ID -> 路径，优先于默认约定
    #[serde(default)]
    pub path_mappings: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_base_path() -> String {
    "modules".to_string()
}

fn default_max_cache_size() -> usize {
    50
}

fn default_load_timeout_ms() -> u64 {
    30_000
}

fn default_load_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            cache_enabled: true,
            max_cache_size: default_max_cache_size(),
            timeout_ms: default_load_timeout_ms(),
            retries: default_load_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            path_mappings: HashMap::new(),
        }
    }
}

impl LoaderConfig {
    /// 单次实例化超时
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// 对应的重试策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.backoff_base_ms))
    }
}

/// 健康检查配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// 检查间隔（毫秒）
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    /// 单次检查超时（毫秒）
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,

    /// 连续失败多少次后判定为不健康
    #[serde(default = "default_health_retries")]
    pub retries: u32,

    /// 是否启用
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

fn default_health_retries() -> u32 {
    3
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            retries: default_health_retries(),
            enabled: true,
        }
    }
}

impl HealthCheckConfig {
    /// 检查间隔
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// 单次检查超时
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 注册表配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 模块配置所在的命名空间，模块配置键为 `{namespace}.{module_id}`
    #[serde(default = "default_config_namespace")]
    pub config_namespace: String,

    /// 客户级模块列表所在的配置键
    #[serde(default = "default_customer_modules_key")]
    pub customer_modules_key: String,

    /// 批量加载时每批的并发数
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    /// 模块进入运行状态后是否自动开始健康监控
    #[serde(default = "default_true")]
    pub monitor_health: bool,
}

fn default_config_namespace() -> String {
    "modules".to_string()
}

fn default_customer_modules_key() -> String {
    "customer.modules".to_string()
}

fn default_batch_concurrency() -> usize {
    4
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            config_namespace: default_config_namespace(),
            customer_modules_key: default_customer_modules_key(),
            batch_concurrency: default_batch_concurrency(),
            monitor_health: true,
        }
    }
}

/// 运行时配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 加载器配置
    #[serde(default)]
    pub loader: LoaderConfig,

    /// 健康检查配置
    #[serde(default)]
    pub health: HealthCheckConfig,

    /// 注册表配置
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl RuntimeConfig {
    /// 创建配置构建器
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// 从文件加载配置，`.json` 按 JSON 解析，其余按 YAML 解析
    pub async fn from_file(path: impl Into<PathBuf>) -> crate::utils::Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await?;

        let mut config: RuntimeConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.config_path = Some(path);
        Ok(config)
    }

    /// 合并另一个配置，只覆盖与默认值不同的项
    pub fn merge(&mut self, other: RuntimeConfig) {
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.loader.max_cache_size != default_max_cache_size() {
            self.loader.max_cache_size = other.loader.max_cache_size;
        }
        if other.loader.timeout_ms != default_load_timeout_ms() {
            self.loader.timeout_ms = other.loader.timeout_ms;
        }
        self.loader.path_mappings.extend(other.loader.path_mappings);
        if other.health != HealthCheckConfig::default() {
            self.health = other.health;
        }
        if other.registry.batch_concurrency != default_batch_concurrency() {
            self.registry.batch_concurrency = other.registry.batch_concurrency;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 设置缓存容量
    pub fn max_cache_size(mut self, size: usize) -> Self {
        self.config.loader.max_cache_size = size;
        self
    }

    /// 添加显式路径映射
    pub fn path_mapping(mut self, module_id: impl Into<String>, path: impl Into<String>) -> Self {
        self.config
            .loader
            .path_mappings
            .insert(module_id.into(), path.into());
        self
    }

    /// 设置健康检查配置
    pub fn health(mut self, health: HealthCheckConfig) -> Self {
        self.config.health = health;
        self
    }

    /// 设置批量加载并发数
    pub fn batch_concurrency(mut self, concurrency: usize) -> Self {
        self.config.registry.batch_concurrency = concurrency;
        self
    }

    /// 构建配置
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}
