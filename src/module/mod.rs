//! 模块管理
//!
//! 包含模块运行时的全部核心组件：
//! - 模块契约、元数据与上下文
//! - 生命周期钩子调用与依赖图
//! - 模块加载器（工厂表、缓存、重试）
//! - 健康检查器
//! - 模块注册表

pub mod context;
pub mod contract;
pub mod dependency;
pub mod health;
pub mod lifecycle;
pub mod loader;
pub mod metadata;
pub mod registry;

// 重导出常用类型
pub use context::{ModuleContext, ServiceRegistry};
pub use contract::{Module, ModuleBase, METRIC_STARTED_AT, METRIC_START_COUNT};
pub use dependency::{DependencyGraph, DependencyNode};
pub use health::{
    AggregatedHealth, HealthChecker, HealthListener, HealthListenerHandle, MonitorInfo, ALL_MODULES,
};
pub use lifecycle::{Hook, LifecycleDriver};
pub use loader::{
    CacheEntryInfo, CacheStats, LoadOptions, LoadedModule, ModuleFactory, ModuleLoader,
};
pub use metadata::{
    HealthState, HealthStatus, LoadStrategy, ModuleDependency, ModuleMetadata, ModulePermission,
    ModuleStatus,
};
pub use registry::{BatchLoadReport, CustomerModuleEntry, ModuleRegistry, ModuleRegistryBuilder};
