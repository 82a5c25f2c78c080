//! 模块契约
//!
//! 每个可插拔模块都必须实现 [`Module`] trait：元数据、生命周期钩子、
//! 健康与指标访问、配置校验。
//!
//! trait 的默认方法委托给内嵌的 [`ModuleBase`]，具体模块只需提供
//! `base()` 并覆盖关心的钩子。默认行为：
//!
//! - `on_initialize`: `INITIALIZING -> LOADED`，绑定上下文，记录启动时间
//! - `on_start`: 进入 `RUNNING`，启动计数加一
//! - `on_stop`: 进入 `STOPPED`
//! - `on_destroy`: 清空上下文和指标，回到 `UNLOADED`
//! - `get_health`: 由当前状态推导（`RUNNING` 健康，`LOADING`/`INITIALIZING`
//!   降级，其余不健康）
//!
//! 钩子失败时状态由调用方（[`LifecycleDriver`](crate::module::LifecycleDriver)）
//! 强制设为 `ERROR`。
//!
//! # 示例
//!
//! ```rust
//! use async_trait::async_trait;
//! use module_runtime::module::{Module, ModuleBase, ModuleContext, ModuleMetadata};
//! use module_runtime::Result;
//!
//! struct ChatModule {
//!     base: ModuleBase,
//! }
//!
//! #[async_trait]
//! impl Module for ChatModule {
//!     fn base(&self) -> &ModuleBase {
//!         &self.base
//!     }
//!
//!     async fn on_start(&self, ctx: &ModuleContext) -> Result<()> {
//!         ctx.logger().info("聊天模块启动");
//!         self.base.start();
//!         Ok(())
//!     }
//! }
//!
//! let module = ChatModule {
//!     base: ModuleBase::new(ModuleMetadata::new("chat", "Chat", "1.0.0")),
//! };
//! assert_eq!(module.id(), "chat");
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::module::context::ModuleContext;
use crate::module::metadata::{HealthStatus, ModuleMetadata, ModuleStatus};
use crate::utils::Result;

/// 启动时间指标名
pub const METRIC_STARTED_AT: &str = "started_at";
/// 启动次数指标名
pub const METRIC_START_COUNT: &str = "start_count";

/// 模块契约
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// 内嵌的通用状态
    fn base(&self) -> &ModuleBase;

    /// 元数据
    fn metadata(&self) -> &ModuleMetadata {
        self.base().metadata()
    }

    /// 模块 ID
    fn id(&self) -> &str {
        &self.metadata().id
    }

    /// 当前状态
    fn status(&self) -> ModuleStatus {
        self.base().status()
    }

    /// 设置状态，由运行时在钩子前后调用
    fn set_status(&self, status: ModuleStatus) {
        self.base().set_status(status);
    }

    /// 当前绑定的上下文
    fn context(&self) -> Option<ModuleContext> {
        self.base().context()
    }

    /// 初始化钩子
    async fn on_initialize(&self, ctx: &ModuleContext) -> Result<()> {
        self.base().initialize(ctx);
        Ok(())
    }

    /// 启动钩子
    async fn on_start(&self, _ctx: &ModuleContext) -> Result<()> {
        self.base().start();
        Ok(())
    }

    /// 停止钩子
    async fn on_stop(&self, _ctx: &ModuleContext) -> Result<()> {
        self.base().stop();
        Ok(())
    }

    /// 销毁钩子
    async fn on_destroy(&self, _ctx: &ModuleContext) -> Result<()> {
        self.base().destroy();
        Ok(())
    }

    /// 配置变更钩子
    async fn on_config_change(
        &self,
        _new_config: &Value,
        _old_config: &Value,
        _ctx: &ModuleContext,
    ) -> Result<()> {
        Ok(())
    }

    /// 依赖状态变更钩子
    async fn on_dependency_change(
        &self,
        _dependency_id: &str,
        _dependency_status: ModuleStatus,
        _ctx: &ModuleContext,
    ) -> Result<()> {
        Ok(())
    }

    /// 健康检查
    async fn get_health(&self) -> Result<HealthStatus> {
        Ok(self.base().health_from_status())
    }

    /// 指标快照
    fn get_metrics(&self) -> HashMap<String, Value> {
        self.base().metrics()
    }

    /// 校验配置
    fn validate_config(&self, _config: &Value) -> Result<()> {
        Ok(())
    }
}

/// 模块通用状态与默认生命周期行为
#[derive(Debug)]
pub struct ModuleBase {
    metadata: ModuleMetadata,
    status: RwLock<ModuleStatus>,
    context: RwLock<Option<ModuleContext>>,
    metrics: Mutex<HashMap<String, Value>>,
}

impl ModuleBase {
    /// 创建通用状态，初始为 `UNLOADED`
    pub fn new(metadata: ModuleMetadata) -> Self {
        Self {
            metadata,
            status: RwLock::new(ModuleStatus::Unloaded),
            context: RwLock::new(None),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// 元数据
    pub fn metadata(&self) -> &ModuleMetadata {
        &self.metadata
    }

    /// 当前状态
    pub fn status(&self) -> ModuleStatus {
        *self.status.read().unwrap()
    }

    /// 设置状态
    pub fn set_status(&self, status: ModuleStatus) {
        *self.status.write().unwrap() = status;
    }

    /// 当前上下文
    pub fn context(&self) -> Option<ModuleContext> {
        self.context.read().unwrap().clone()
    }

    /// 记录指标
    pub fn record_metric(&self, key: impl Into<String>, value: Value) {
        self.metrics.lock().unwrap().insert(key.into(), value);
    }

    /// 计数类指标加一，返回新值
    pub fn increment_metric(&self, key: &str) -> u64 {
        let mut metrics = self.metrics.lock().unwrap();
        let next = metrics.get(key).and_then(Value::as_u64).unwrap_or(0) + 1;
        metrics.insert(key.to_string(), Value::from(next));
        next
    }

    /// 指标快照
    pub fn metrics(&self) -> HashMap<String, Value> {
        self.metrics.lock().unwrap().clone()
    }

    /// 默认初始化：`INITIALIZING -> LOADED`，绑定上下文并记录启动时间
    pub fn initialize(&self, ctx: &ModuleContext) {
        self.set_status(ModuleStatus::Initializing);
        *self.context.write().unwrap() = Some(ctx.clone());
        self.record_metric(METRIC_STARTED_AT, Value::from(Utc::now().to_rfc3339()));
        self.set_status(ModuleStatus::Loaded);
    }

    /// 默认启动：进入 `RUNNING`，启动计数加一
    pub fn start(&self) {
        self.set_status(ModuleStatus::Running);
        self.increment_metric(METRIC_START_COUNT);
    }

    /// 默认停止：进入 `STOPPED`
    pub fn stop(&self) {
        self.set_status(ModuleStatus::Stopped);
    }

    /// 默认销毁：清空上下文和指标，回到 `UNLOADED`
    pub fn destroy(&self) {
        self.context.write().unwrap().take();
        self.metrics.lock().unwrap().clear();
        self.set_status(ModuleStatus::Unloaded);
    }

    /// 重新绑定上下文（配置变更后使用）
    pub fn rebind(&self, ctx: &ModuleContext) {
        *self.context.write().unwrap() = Some(ctx.clone());
    }

    /// 由当前状态推导的健康状态
    pub fn health_from_status(&self) -> HealthStatus {
        match self.status() {
            ModuleStatus::Running => HealthStatus::healthy(),
            status @ (ModuleStatus::Loading | ModuleStatus::Initializing) => {
                HealthStatus::degraded(format!("模块状态: {}", status))
            }
            status => HealthStatus::unhealthy(format!("模块状态: {}", status)),
        }
    }
}
