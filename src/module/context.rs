//! 模块运行时上下文
//!
//! 模块进入 `INITIALIZING` 时由注册表创建，随生命周期钩子传入，
//! 模块卸载后释放。包含：
//!
//! - 日志句柄（名称为模块 ID）
//! - 解析后的模块配置
//! - 注册表的弱引用，用于查询兄弟模块
//! - 共享服务表（只读）
//! - 绑定到本模块的事件总线句柄

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::event::{EventBus, ModuleEventBus};
use crate::module::registry::ModuleRegistry;
use crate::utils::ModuleLogger;

type Service = Arc<dyn Any + Send + Sync>;

/// 共享服务表
///
/// 全局可见的服务映射。只有注册表可以增删，模块通过上下文只读访问。
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Service>>,
}

impl ServiceRegistry {
    /// 创建空的服务表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册服务，返回是否替换了同名服务
    pub(crate) fn register<T: Any + Send + Sync>(&self, name: impl Into<String>, service: Arc<T>) -> bool {
        let name = name.into();
        debug!(service = %name, "注册共享服务");
        self.services
            .write()
            .unwrap()
            .insert(name, service)
            .is_some()
    }

    /// 注销服务，返回服务是否存在
    pub(crate) fn unregister(&self, name: &str) -> bool {
        self.services.write().unwrap().remove(name).is_some()
    }

    /// 按类型获取服务，名称不存在或类型不符时返回 None
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let service = self.services.read().unwrap().get(name).cloned()?;
        service.downcast::<T>().ok()
    }

    /// 是否存在服务
    pub fn contains(&self, name: &str) -> bool {
        self.services.read().unwrap().contains_key(name)
    }

    /// 所有服务名称
    pub fn names(&self) -> Vec<String> {
        self.services.read().unwrap().keys().cloned().collect()
    }
}

/// 模块上下文
#[derive(Clone)]
pub struct ModuleContext {
    module_id: String,
    logger: ModuleLogger,
    config: Value,
    registry: Weak<ModuleRegistry>,
    services: Arc<ServiceRegistry>,
    event_bus: ModuleEventBus,
}

impl ModuleContext {
    /// 创建不关联注册表的上下文
    ///
    /// 主要用于在注册表之外单独驱动模块，例如模块自身的测试。
    pub fn new(
        module_id: impl Into<String>,
        config: Value,
        services: Arc<ServiceRegistry>,
        event_bus: &EventBus,
    ) -> Self {
        let module_id = module_id.into();
        Self {
            logger: ModuleLogger::new("module").create_child(&module_id),
            event_bus: event_bus.scoped(module_id.clone()),
            module_id,
            config,
            registry: Weak::new(),
            services,
        }
    }

    pub(crate) fn with_registry(mut self, registry: Weak<ModuleRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// 替换配置，其余字段保持不变
    pub(crate) fn with_config(&self, config: Value) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }

    /// 模块 ID
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// 日志句柄
    pub fn logger(&self) -> &ModuleLogger {
        &self.logger
    }

    /// 完整的模块配置
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// 按点分键读取配置项
    pub fn setting<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = key
            .split('.')
            .try_fold(&self.config, |node, part| node.get(part))?;
        serde_json::from_value(value.clone()).ok()
    }

    /// 注册表，注册表已释放或上下文未关联注册表时返回 None
    pub fn registry(&self) -> Option<Arc<ModuleRegistry>> {
        self.registry.upgrade()
    }

    /// 获取共享服务
    pub fn service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services.get(name)
    }

    /// 共享服务表
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// 本模块的事件总线句柄
    pub fn event_bus(&self) -> &ModuleEventBus {
        &self.event_bus
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module_id", &self.module_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
