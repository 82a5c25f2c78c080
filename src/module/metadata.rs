//! 模块元数据定义
//!
//! 定义模块的描述信息、生命周期状态和健康状态。

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

/// 模块元数据
///
/// 在模块编写时确定，注册后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// 模块唯一标识
    pub id: String,

    /// 模块名称
    pub name: String,

    /// 语义化版本号
    pub version: String,

    /// 依赖列表
    #[serde(default)]
    pub dependencies: Vec<ModuleDependency>,

    /// 权限声明
    #[serde(default)]
    pub permissions: Vec<ModulePermission>,

    /// 加载策略
    #[serde(default)]
    pub load_strategy: LoadStrategy,

    /// 界面布局位置提示
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,

    /// 优先级，数值越小越先批量加载
    #[serde(default)]
    pub priority: i32,

    /// 标签
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ModuleMetadata {
    /// 创建元数据
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            dependencies: Vec::new(),
            permissions: Vec::new(),
            load_strategy: LoadStrategy::default(),
            position: None,
            priority: 0,
            tags: BTreeSet::new(),
        }
    }

    /// 追加依赖
    pub fn with_dependency(mut self, dependency: ModuleDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// 追加权限声明
    pub fn with_permission(mut self, permission: ModulePermission) -> Self {
        self.permissions.push(permission);
        self
    }

    /// 设置加载策略
    pub fn with_load_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.load_strategy = strategy;
        self
    }

    /// 设置布局位置
    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    /// 设置优先级
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// 追加标签
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// 查找对某个模块的依赖声明
    pub fn dependency_on(&self, module_id: &str) -> Option<&ModuleDependency> {
        self.dependencies.iter().find(|d| d.module_id == module_id)
    }

    /// 必需依赖的 ID
    pub fn required_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| !d.optional)
            .map(|d| d.module_id.as_str())
    }

    /// 校验元数据
    ///
    /// # 返回
    ///
    /// 所有问题的列表；没有问题时返回 `Ok(())`
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = vec![];

        if self.id.is_empty() {
            errors.push("模块 ID 不能为空".to_string());
        }

        if self.name.is_empty() {
            errors.push("模块名称不能为空".to_string());
        }

        if Version::parse(&self.version).is_err() {
            errors.push(format!("无效的版本号格式: {}", self.version));
        }

        for dep in &self.dependencies {
            if dep.module_id == self.id {
                errors.push(format!("模块不能依赖自身: {}", dep.module_id));
            }
            if let Some(ref constraint) = dep.version_constraint {
                if VersionReq::parse(constraint).is_err() {
                    errors.push(format!(
                        "依赖 {} 的版本要求格式无效: {}",
                        dep.module_id, constraint
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// 模块依赖声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDependency {
    /// 依赖的模块 ID
    pub module_id: String,

    /// 版本约束（semver 表达式，如 "^1.2"）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_constraint: Option<String>,

    /// 是否为可选依赖
    #[serde(default)]
    pub optional: bool,
}

impl ModuleDependency {
    /// 创建必需依赖
    pub fn required(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            version_constraint: None,
            optional: false,
        }
    }

    /// 创建可选依赖
    pub fn optional(module_id: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::required(module_id)
        }
    }

    /// 设置版本约束
    pub fn with_version(mut self, constraint: impl Into<String>) -> Self {
        self.version_constraint = Some(constraint.into());
        self
    }

    /// 检查版本是否满足约束，没有约束时总是满足
    pub fn accepts(&self, version: &str) -> crate::utils::Result<bool> {
        match self.version_constraint {
            Some(ref constraint) => {
                let req = VersionReq::parse(constraint)?;
                let version = Version::parse(version)?;
                Ok(req.matches(&version))
            }
            None => Ok(true),
        }
    }
}

/// 权限声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulePermission {
    /// 权限名称
    pub name: String,

    /// 是否必需
    #[serde(default)]
    pub required: bool,
}

impl ModulePermission {
    /// 创建权限声明
    pub fn new(name: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            required,
        }
    }
}

/// 加载策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadStrategy {
    /// 启动时立即加载
    #[default]
    Eager,
    /// 首次需要时加载
    Lazy,
    /// 仅在显式请求时加载
    OnDemand,
}

/// 模块生命周期状态
///
/// 除 `Error` 外只能单向流转；任何活动状态下钩子失败都会进入 `Error`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleStatus {
    /// 未加载
    #[default]
    Unloaded,
    /// 加载中
    Loading,
    /// 已加载
    Loaded,
    /// 初始化中
    Initializing,
    /// 运行中
    Running,
    /// 出错
    Error,
    /// 已停止
    Stopped,
    /// 卸载中
    Unloading,
}

impl ModuleStatus {
    /// 是否持有运行时资源（即卸载前需要清理）
    pub fn is_loaded(&self) -> bool {
        !matches!(self, ModuleStatus::Unloaded)
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleStatus::Unloaded => "UNLOADED",
            ModuleStatus::Loading => "LOADING",
            ModuleStatus::Loaded => "LOADED",
            ModuleStatus::Initializing => "INITIALIZING",
            ModuleStatus::Running => "RUNNING",
            ModuleStatus::Error => "ERROR",
            ModuleStatus::Stopped => "STOPPED",
            ModuleStatus::Unloading => "UNLOADING",
        };
        f.write_str(s)
    }
}

/// 健康等级，按严重程度排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// 健康
    Healthy,
    /// 降级
    Degraded,
    /// 不健康
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => f.write_str("healthy"),
            HealthState::Degraded => f.write_str("degraded"),
            HealthState::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// 健康状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// 健康等级
    pub status: HealthState,

    /// 说明
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// 详细信息
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,

    /// 检查时间
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    fn with_state(status: HealthState, message: Option<String>) -> Self {
        Self {
            status,
            message,
            details: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// 健康
    pub fn healthy() -> Self {
        Self::with_state(HealthState::Healthy, None)
    }

    /// 降级
    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_state(HealthState::Degraded, Some(message.into()))
    }

    /// 不健康
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_state(HealthState::Unhealthy, Some(message.into()))
    }

    /// 追加详细信息
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// 是否健康
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}
