//! 模块运行时错误类型定义
//!
//! 本模块定义了运行时中使用的所有错误类型。
//!
//! 错误按 [`ErrorKind`] 分类，调用方应根据分类决定是否重试，
//! 而不是解析错误文本。`CoreError` 实现了 `Clone`，以便单飞加载的
//! 所有等待者都能拿到同一个结果。

use std::sync::Arc;

use thiserror::Error;

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 模块、依赖或订阅不存在
    NotFound,
    /// 重复注册
    AlreadyExists,
    /// 模块导出或配置不合法
    Validation,
    /// 循环依赖
    Cycle,
    /// 加载或健康检查超时
    Timeout,
    /// 缺少必需依赖
    DependencyUnsatisfied,
    /// 生命周期钩子失败
    HookFailure,
    /// 配置读取错误
    Config,
    /// 其他内部错误
    Internal,
}

/// 模块运行时核心错误类型
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    // ==================== 模块注册错误 ====================

    /// 模块未找到
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    /// 模块已注册
    #[error("模块已注册: '{0}'")]
    ModuleAlreadyExists(String),

    /// 无效的模块元数据
    #[error("无效的模块元数据: {0}")]
    InvalidMetadata(String),

    /// 模块校验失败
    #[error("模块校验失败: '{module_id}' - {reason}")]
    Validation {
        /// 模块 ID
        module_id: String,
        /// 失败原因
        reason: String,
    },

    /// 循环依赖
    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),

    /// 必需依赖未满足
    #[error("模块 '{module_id}' 的必需依赖未满足: '{dependency}'")]
    DependencyUnsatisfied {
        /// 模块 ID
        module_id: String,
        /// 缺失或未运行的依赖 ID
        dependency: String,
    },

    /// 版本不匹配
    #[error("版本不匹配: 模块 '{module}' 需要版本 {required}, 但找到版本 {found}")]
    VersionMismatch {
        /// 被依赖的模块 ID
        module: String,
        /// 版本约束
        required: String,
        /// 实际版本
        found: String,
    },

    /// 模块有依赖者，无法注销
    #[error("模块 '{module}' 被以下已加载模块依赖，无法注销: {dependents:?}")]
    ModuleHasDependents {
        /// 模块 ID
        module: String,
        /// 依赖者列表
        dependents: Vec<String>,
    },

    // ==================== 生命周期错误 ====================

    /// 生命周期钩子失败
    #[error("模块 '{module_id}' 的钩子 {hook} 执行失败: {reason}")]
    HookFailed {
        /// 模块 ID
        module_id: String,
        /// 钩子名称
        hook: String,
        /// 失败原因
        reason: String,
    },

    /// 操作超时
    #[error("操作超时: {0}")]
    Timeout(String),

    /// 模块加载失败
    #[error("模块加载失败: '{module_id}' - {reason}")]
    ModuleLoadFailed {
        /// 模块 ID
        module_id: String,
        /// 失败原因
        reason: String,
    },

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置项未找到
    #[error("配置项未找到: '{0}'")]
    ConfigNotFound(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        /// 配置键
        key: String,
        /// 原因
        reason: String,
    },

    // ==================== 事件系统错误 ====================

    /// 订阅未找到
    #[error("订阅未找到: '{0}'")]
    SubscriptionNotFound(String),

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[source] Arc<serde_json::Error>),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[source] Arc<serde_yaml::Error>),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[source] Arc<semver::Error>),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(Arc<anyhow::Error>),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Json(Arc::new(err))
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::Yaml(Arc::new(err))
    }
}

impl From<semver::Error> for CoreError {
    fn from(err: semver::Error) -> Self {
        CoreError::VersionParse(Arc::new(err))
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Other(Arc::new(err))
    }
}

/// 状态码常量
pub mod status_code {
    /// 成功
    pub const OK: u16 = 200;

    /// 请求格式错误
    pub const BAD_REQUEST: u16 = 400;

    /// 未找到
    pub const NOT_FOUND: u16 = 404;

    /// 请求超时
    pub const TIMEOUT: u16 = 408;

    /// 冲突
    pub const CONFLICT: u16 = 409;

    /// 前置条件不满足
    pub const PRECONDITION_FAILED: u16 = 412;

    /// 内部错误
    pub const INTERNAL_ERROR: u16 = 500;

    /// 服务不可用
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// 错误码常量
#[allow(missing_docs)]
pub mod error_code {
    // 核心错误 (CORE-xxx)
    pub const CORE_INIT_FAILED: &str = "CORE-003";
    pub const CORE_INTERNAL: &str = "CORE-004";

    // 模块错误 (MODULE-xxx)
    pub const MODULE_NOT_FOUND: &str = "MODULE-001";
    pub const MODULE_HOOK_FAILED: &str = "MODULE-002";
    pub const MODULE_LOAD_FAILED: &str = "MODULE-003";
    pub const MODULE_HAS_DEPENDENTS: &str = "MODULE-004";
    pub const MODULE_CIRCULAR_DEPENDENCY: &str = "MODULE-005";
    pub const MODULE_ALREADY_EXISTS: &str = "MODULE-006";
    pub const MODULE_INVALID: &str = "MODULE-007";
    pub const MODULE_DEPENDENCY_UNSATISFIED: &str = "MODULE-008";
    pub const MODULE_VERSION_MISMATCH: &str = "MODULE-009";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_NOT_FOUND: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-003";

    // 超时错误 (TIMEOUT-xxx)
    pub const TIMEOUT: &str = "TIMEOUT-001";

    // 事件错误 (EVENT-xxx)
    pub const EVENT_SUBSCRIPTION_NOT_FOUND: &str = "EVENT-001";
}

impl CoreError {
    /// 获取错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ModuleNotFound(_) | CoreError::SubscriptionNotFound(_) => ErrorKind::NotFound,
            CoreError::ModuleAlreadyExists(_) => ErrorKind::AlreadyExists,
            CoreError::InvalidMetadata(_)
            | CoreError::Validation { .. }
            | CoreError::VersionMismatch { .. }
            | CoreError::VersionParse(_) => ErrorKind::Validation,
            CoreError::CircularDependency(_) => ErrorKind::Cycle,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::DependencyUnsatisfied { .. } | CoreError::ModuleHasDependents { .. } => {
                ErrorKind::DependencyUnsatisfied
            }
            CoreError::HookFailed { .. } => ErrorKind::HookFailure,
            CoreError::ConfigLoadFailed(_)
            | CoreError::ConfigNotFound(_)
            | CoreError::InvalidConfigValue { .. }
            | CoreError::Json(_)
            | CoreError::Yaml(_) => ErrorKind::Config,
            _ => ErrorKind::Internal,
        }
    }

    /// 是否允许重试
    ///
    /// 校验、未找到、循环依赖类错误永远不重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout(_)
                | CoreError::ModuleLoadFailed { .. }
                | CoreError::Io(_)
                | CoreError::Other(_)
        )
    }

    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            CoreError::ModuleAlreadyExists(_) => error_code::MODULE_ALREADY_EXISTS,
            CoreError::InvalidMetadata(_) | CoreError::Validation { .. } => {
                error_code::MODULE_INVALID
            }
            CoreError::CircularDependency(_) => error_code::MODULE_CIRCULAR_DEPENDENCY,
            CoreError::DependencyUnsatisfied { .. } => error_code::MODULE_DEPENDENCY_UNSATISFIED,
            CoreError::VersionMismatch { .. } => error_code::MODULE_VERSION_MISMATCH,
            CoreError::ModuleHasDependents { .. } => error_code::MODULE_HAS_DEPENDENTS,
            CoreError::HookFailed { .. } => error_code::MODULE_HOOK_FAILED,
            CoreError::ModuleLoadFailed { .. } => error_code::MODULE_LOAD_FAILED,
            CoreError::Timeout(_) => error_code::TIMEOUT,
            CoreError::ConfigNotFound(_) => error_code::CONFIG_NOT_FOUND,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            CoreError::ConfigLoadFailed(_) | CoreError::Json(_) | CoreError::Yaml(_) => {
                error_code::CONFIG_LOAD_FAILED
            }
            CoreError::SubscriptionNotFound(_) => error_code::EVENT_SUBSCRIPTION_NOT_FOUND,
            CoreError::InitFailed(_) => error_code::CORE_INIT_FAILED,
            _ => error_code::CORE_INTERNAL,
        }
    }

    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => status_code::NOT_FOUND,
            ErrorKind::AlreadyExists | ErrorKind::Cycle => status_code::CONFLICT,
            ErrorKind::Validation | ErrorKind::Config => status_code::BAD_REQUEST,
            ErrorKind::Timeout => status_code::TIMEOUT,
            ErrorKind::DependencyUnsatisfied => status_code::PRECONDITION_FAILED,
            ErrorKind::HookFailure => status_code::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => status_code::INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::ModuleNotFound("chat".to_string());
        assert!(err.to_string().contains("chat"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(
            CoreError::ModuleAlreadyExists("a".into()).kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            CoreError::CircularDependency("a -> b -> a".into()).kind(),
            ErrorKind::Cycle
        );
        let err = CoreError::DependencyUnsatisfied {
            module_id: "a".into(),
            dependency: "b".into(),
        };
        assert_eq!(err.kind(), ErrorKind::DependencyUnsatisfied);
    }

    #[test]
    fn test_error_code() {
        let err = CoreError::CircularDependency("a".to_string());
        assert_eq!(err.error_code(), error_code::MODULE_CIRCULAR_DEPENDENCY);
        assert_eq!(err.status_code(), status_code::CONFLICT);

        let err = CoreError::Timeout("load".to_string());
        assert_eq!(err.status_code(), status_code::TIMEOUT);
    }

    #[test]
    fn test_retryable() {
        assert!(CoreError::Timeout("x".into()).is_retryable());
        assert!(!CoreError::ModuleNotFound("x".into()).is_retryable());
        assert!(!CoreError::CircularDependency("x".into()).is_retryable());
        assert!(!CoreError::Validation {
            module_id: "x".into(),
            reason: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let core_err: CoreError = io_err.into();
        assert!(matches!(core_err, CoreError::Io(_)));
        // 克隆后仍保留原始信息
        assert!(core_err.clone().to_string().contains("file not found"));
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: CoreError = anyhow::anyhow!("boom").into();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
