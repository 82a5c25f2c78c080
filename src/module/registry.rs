//! 模块注册表
//!
//! 运行时的核心，负责：
//!
//! - 注册 / 注销模块，维护依赖图（拒绝缺失依赖、版本不符与循环依赖）
//! - 按依赖顺序加载模块并驱动生命周期钩子，同一模块同时只有一个加载在进行
//! - 卸载时先卸载依赖它的模块，钩子失败不阻塞清理
//! - 监听配置命名空间，`enabled` 切换时自动加载或卸载，其余变更转发给模块
//! - 按客户配置的优先级分批加载模块
//! - 模块进入运行状态后交给健康检查器监控
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use module_runtime::core::ConfigManager;
//! use module_runtime::module::ModuleRegistry;
//!
//! # async fn example() -> module_runtime::Result<()> {
//! let config = Arc::new(ConfigManager::new());
//! config.set("modules.chat", serde_json::json!({"enabled": true})).await?;
//!
//! let registry = ModuleRegistry::new(config);
//! registry.start_config_watch().await;
//! // registry.register(chat_module).await?;
//! registry.load_module("chat").await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::{HealthCheckConfig, RegistryConfig, RuntimeConfig};
use crate::core::config_manager::{ConfigChange, ConfigProvider};
use crate::event::{system_events, Event, EventBus};
use crate::module::context::{ModuleContext, ServiceRegistry};
use crate::module::contract::Module;
use crate::module::dependency::{DependencyGraph, DependencyNode};
use crate::module::health::HealthChecker;
use crate::module::lifecycle::LifecycleDriver;
use crate::module::loader::{LoadOptions, ModuleLoader};
use crate::module::metadata::ModuleStatus;
use crate::utils::{CoreError, Result};

type SharedLoad = Shared<BoxFuture<'static, Result<()>>>;

/// 客户配置中的模块条目
#[derive(Debug, Clone, Deserialize)]
pub struct CustomerModuleEntry {
    /// 模块 ID
    #[serde(alias = "moduleId")]
    pub module_id: String,

    /// 是否启用
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// 加载优先级，越小越先加载；缺省时使用模块元数据中的优先级
    #[serde(default)]
    pub priority: Option<i32>,
}

fn default_enabled() -> bool {
    true
}

/// 批量加载结果
#[derive(Debug, Clone, Default)]
pub struct BatchLoadReport {
    /// 进入运行状态的模块，按加载顺序排列
    pub loaded: Vec<String>,
    /// 加载成功但因配置未启用而跳过的模块
    pub skipped: Vec<String>,
    /// 加载失败的模块
    pub failed: Vec<(String, CoreError)>,
}

/// 注册表构建器
pub struct ModuleRegistryBuilder {
    config: Arc<dyn ConfigProvider>,
    event_bus: Option<EventBus>,
    services: Option<Arc<ServiceRegistry>>,
    loader: Option<ModuleLoader>,
    health: Option<(HealthChecker, HealthCheckConfig)>,
    settings: RegistryConfig,
}

impl ModuleRegistryBuilder {
    /// 使用外部事件总线
    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// 使用外部服务表
    pub fn services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = Some(services);
        self
    }

    /// 挂载模块加载器
    pub fn loader(mut self, loader: ModuleLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// 挂载健康检查器
    pub fn health_checker(mut self, checker: HealthChecker, config: HealthCheckConfig) -> Self {
        self.health = Some((checker, config));
        self
    }

    /// 注册表配置
    pub fn settings(mut self, settings: RegistryConfig) -> Self {
        self.settings = settings;
        self
    }

    /// 构建注册表
    pub fn build(self) -> Arc<ModuleRegistry> {
        info!(
            namespace = %self.settings.config_namespace,
            loader = self.loader.is_some(),
            health = self.health.is_some(),
            "创建模块注册表"
        );
        Arc::new_cyclic(|self_ref| ModuleRegistry {
            self_ref: self_ref.clone(),
            modules: RwLock::new(HashMap::new()),
            graph: RwLock::new(DependencyGraph::new()),
            contexts: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            config: self.config,
            event_bus: self.event_bus.unwrap_or_default(),
            services: self.services.unwrap_or_default(),
            loader: self.loader,
            health: self.health,
            settings: self.settings,
            watch: Mutex::new(None),
        })
    }
}

struct ConfigWatch {
    watch_id: String,
    task: JoinHandle<()>,
}

/// 模块注册表
pub struct ModuleRegistry {
    self_ref: Weak<ModuleRegistry>,
    modules: RwLock<HashMap<String, Arc<dyn Module>>>,
    graph: RwLock<DependencyGraph>,
    contexts: RwLock<HashMap<String, ModuleContext>>,
    in_flight: Mutex<HashMap<String, SharedLoad>>,
    config: Arc<dyn ConfigProvider>,
    event_bus: EventBus,
    services: Arc<ServiceRegistry>,
    loader: Option<ModuleLoader>,
    health: Option<(HealthChecker, HealthCheckConfig)>,
    settings: RegistryConfig,
    watch: Mutex<Option<ConfigWatch>>,
}

impl ModuleRegistry {
    /// 使用默认设置创建注册表
    pub fn new(config: Arc<dyn ConfigProvider>) -> Arc<Self> {
        Self::builder(config).build()
    }

    /// 构建器
    pub fn builder(config: Arc<dyn ConfigProvider>) -> ModuleRegistryBuilder {
        ModuleRegistryBuilder {
            config,
            event_bus: None,
            services: None,
            loader: None,
            health: None,
            settings: RegistryConfig::default(),
        }
    }

    /// 按运行时配置组装注册表、加载器与健康检查器
    pub fn from_runtime_config(runtime: &RuntimeConfig, config: Arc<dyn ConfigProvider>) -> Arc<Self> {
        Self::builder(config)
            .loader(ModuleLoader::new(runtime.loader.clone()))
            .health_checker(HealthChecker::new(), runtime.health)
            .settings(runtime.registry.clone())
            .build()
    }

    fn handle(&self) -> Result<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| CoreError::Internal("模块注册表已释放".to_string()))
    }

    // ==================== 注册 ====================

    /// 注册模块
    ///
    /// # 错误
    ///
    /// - `CoreError::InvalidMetadata`: 元数据不合法
    /// - `CoreError::ModuleAlreadyExists`: ID 已注册
    /// - `CoreError::DependencyUnsatisfied`: 必需依赖尚未注册
    /// - `CoreError::VersionMismatch`: 已注册依赖的版本不满足约束
    /// - `CoreError::CircularDependency`: 加入后依赖图出现环
    ///
    /// 任何失败都不会修改注册表状态。
    #[instrument(skip(self, module), fields(module_id = %module.id()))]
    pub async fn register(&self, module: Arc<dyn Module>) -> Result<()> {
        let metadata = module.metadata();
        let module_id = metadata.id.clone();

        metadata
            .validate()
            .map_err(|errors| CoreError::InvalidMetadata(format!("{}: {}", module_id, errors.join("; "))))?;

        {
            let mut modules = self.modules.write().await;
            if modules.contains_key(&module_id) {
                return Err(CoreError::ModuleAlreadyExists(module_id));
            }

            for dependency in &metadata.dependencies {
                let Some(existing) = modules.get(&dependency.module_id) else {
                    if dependency.optional {
                        debug!(dependency = %dependency.module_id, "可选依赖尚未注册");
                        continue;
                    }
                    return Err(CoreError::DependencyUnsatisfied {
                        module_id,
                        dependency: dependency.module_id.clone(),
                    });
                };

                let found = &existing.metadata().version;
                if !dependency.accepts(found)? {
                    return Err(CoreError::VersionMismatch {
                        module: dependency.module_id.clone(),
                        required: dependency.version_constraint.clone().unwrap_or_default(),
                        found: found.clone(),
                    });
                }
            }

            let graph = DependencyGraph::from_modules(
                modules
                    .values()
                    .map(|m| m.metadata())
                    .chain(std::iter::once(metadata)),
            );
            graph.ensure_acyclic()?;

            modules.insert(module_id.clone(), module.clone());
            *self.graph.write().await = graph;
        }

        info!(version = %metadata.version, "模块已注册");
        self.publish(
            system_events::MODULE_REGISTERED,
            json!({ "module_id": module_id, "version": metadata.version }),
        )
        .await;
        Ok(())
    }

    /// 通过加载器实例化并注册模块
    pub async fn register_from_loader(&self, module_id: &str) -> Result<Arc<dyn Module>> {
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| CoreError::Internal("未配置模块加载器".to_string()))?;

        let loaded = loader.load_module(module_id, LoadOptions::default()).await?;
        self.register(loaded.module.clone()).await?;
        Ok(loaded.module)
    }

    /// 注销模块
    ///
    /// 仍有处于加载状态、且必需依赖本模块的模块时拒绝注销；
    /// 否则先卸载（如已加载），再清理订阅并从依赖图移除。
    /// 移除前在写锁下重新核对，卸载期间并发加载的依赖方同样会阻止注销。
    #[instrument(skip(self))]
    pub async fn unregister(&self, module_id: &str) -> Result<()> {
        let module = self
            .get_module(module_id)
            .await
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;

        Self::ensure_no_loaded_dependents(&*self.modules.read().await, module_id)?;

        if module.status().is_loaded() {
            self.unload_module(module_id).await?;
        }

        {
            let mut modules = self.modules.write().await;
            Self::ensure_no_loaded_dependents(&modules, module_id)?;
            if module.status().is_loaded() {
                return Err(CoreError::Internal(format!(
                    "模块 '{}' 在注销期间被重新加载",
                    module_id
                )));
            }
            modules.remove(module_id);
            *self.graph.write().await = DependencyGraph::from_modules(modules.values().map(|m| m.metadata()));
        }
        self.event_bus.unsubscribe_all(module_id).await;

        info!("模块已注销");
        self.publish(
            system_events::MODULE_UNREGISTERED,
            json!({ "module_id": module_id }),
        )
        .await;
        Ok(())
    }

    fn ensure_no_loaded_dependents(modules: &HashMap<String, Arc<dyn Module>>, module_id: &str) -> Result<()> {
        let mut blocking: Vec<String> = modules
            .values()
            .filter(|m| m.id() != module_id && m.status().is_loaded())
            .filter(|m| m.metadata().dependency_on(module_id).is_some_and(|d| !d.optional))
            .map(|m| m.id().to_string())
            .collect();
        if blocking.is_empty() {
            return Ok(());
        }
        blocking.sort();
        Err(CoreError::ModuleHasDependents {
            module: module_id.to_string(),
            dependents: blocking,
        })
    }

    // ==================== 加载 ====================

    /// 加载并启动模块
    ///
    /// 同一模块的并发调用共享同一次加载。已在运行的模块直接返回；
    /// 配置缺失或 `enabled: false` 时成功返回且不调用任何钩子。
    #[instrument(skip(self))]
    pub async fn load_module(&self, module_id: &str) -> Result<()> {
        self.shared_load(module_id)?.await
    }

    fn shared_load(&self, module_id: &str) -> Result<SharedLoad> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(pending) = in_flight.get(module_id) {
            debug!(module_id = %module_id, "复用进行中的加载");
            return Ok(pending.clone());
        }

        let this = self.handle()?;
        let id = module_id.to_string();
        let pending = async move {
            let result = this.clone().perform_load(id.clone()).await;
            this.in_flight.lock().unwrap().remove(&id);
            result
        }
        .boxed()
        .shared();

        in_flight.insert(module_id.to_string(), pending.clone());
        Ok(pending)
    }

    fn perform_load(self: Arc<Self>, module_id: String) -> BoxFuture<'static, Result<()>> {
        async move {
            let module = self
                .get_module(&module_id)
                .await
                .ok_or_else(|| CoreError::ModuleNotFound(module_id.clone()))?;

            if module.status() == ModuleStatus::Running {
                debug!(module_id = %module_id, "模块已在运行");
                return Ok(());
            }

            let Some(config) = self.module_config(&module_id).await.filter(is_enabled) else {
                info!(module_id = %module_id, "模块未启用，跳过加载");
                return Ok(());
            };

            // 依赖必须先进入运行状态
            for dependency in module.metadata().dependencies.clone() {
                let Some(dep_module) = self.get_module(&dependency.module_id).await else {
                    if dependency.optional {
                        warn!(module_id = %module_id, dependency = %dependency.module_id, "可选依赖未注册，跳过");
                        continue;
                    }
                    return self
                        .fail(CoreError::DependencyUnsatisfied {
                            module_id: module_id.clone(),
                            dependency: dependency.module_id.clone(),
                        })
                        .await;
                };

                let result = self.shared_load(&dependency.module_id)?.await;
                if result.is_ok() && dep_module.status() == ModuleStatus::Running {
                    continue;
                }

                if dependency.optional {
                    warn!(module_id = %module_id, dependency = %dependency.module_id, "可选依赖未能启动");
                    continue;
                }
                if let Err(err) = result {
                    warn!(module_id = %module_id, dependency = %dependency.module_id, error = %err, "依赖加载失败");
                }
                return self
                    .fail(CoreError::DependencyUnsatisfied {
                        module_id: module_id.clone(),
                        dependency: dependency.module_id.clone(),
                    })
                    .await;
            }

            module.set_status(ModuleStatus::Loading);
            if let Err(err) = module.validate_config(&config) {
                module.set_status(ModuleStatus::Error);
                return self
                    .fail(CoreError::Validation {
                        module_id: module_id.clone(),
                        reason: err.to_string(),
                    })
                    .await;
            }

            let ctx = self.create_context(&module_id, config);
            module.set_status(ModuleStatus::Initializing);

            if let Err(err) = LifecycleDriver::initialize(module.as_ref(), &ctx).await {
                return self.fail(err).await;
            }
            if let Err(err) = LifecycleDriver::start(module.as_ref(), &ctx).await {
                return self.fail(err).await;
            }
            if module.status() != ModuleStatus::Running {
                module.set_status(ModuleStatus::Running);
            }

            self.contexts.write().await.insert(module_id.clone(), ctx);
            info!(module_id = %module_id, "模块已启动");

            self.publish(
                system_events::MODULE_LOADED,
                json!({ "module_id": module_id, "version": module.metadata().version }),
            )
            .await;
            self.notify_dependents(&module_id, ModuleStatus::Running).await;

            if let Some((checker, config)) = &self.health {
                if self.settings.monitor_health {
                    checker.start_monitoring(module.clone(), *config).await;
                }
            }

            Ok(())
        }
        .boxed()
    }

    fn create_context(&self, module_id: &str, config: Value) -> ModuleContext {
        ModuleContext::new(module_id, config, self.services.clone(), &self.event_bus)
            .with_registry(self.self_ref.clone())
    }

    async fn fail(&self, err: CoreError) -> Result<()> {
        error!(error = %err, code = err.error_code(), "模块加载失败");
        self.publish(
            system_events::MODULE_ERROR,
            json!({ "error": err.to_string(), "code": err.error_code() }),
        )
        .await;
        Err(err)
    }

    // ==================== 卸载 ====================

    /// 停止并销毁模块
    ///
    /// 必需依赖本模块且仍在加载状态的模块会先被卸载。钩子失败只记录警告。
    #[instrument(skip(self))]
    pub async fn unload_module(&self, module_id: &str) -> Result<()> {
        self.perform_unload(module_id).await
    }

    fn perform_unload<'a>(&'a self, module_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let module = self
                .get_module(module_id)
                .await
                .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;

            if !module.status().is_loaded() || module.status() == ModuleStatus::Unloading {
                debug!(module_id = %module_id, status = %module.status(), "模块未加载，无需卸载");
                return Ok(());
            }

            let dependents = self.graph.read().await.get_dependents(module_id);
            for dependent_id in dependents {
                let Some(dependent) = self.get_module(&dependent_id).await else {
                    continue;
                };
                let required = dependent
                    .metadata()
                    .dependency_on(module_id)
                    .is_some_and(|d| !d.optional);
                if required && dependent.status().is_loaded() {
                    debug!(module_id = %module_id, dependent = %dependent_id, "先卸载依赖方");
                    self.perform_unload(&dependent_id).await?;
                }
            }

            module.set_status(ModuleStatus::Unloading);
            if let Some((checker, _)) = &self.health {
                checker.stop_monitoring(module_id);
            }

            let ctx = self
                .contexts
                .read()
                .await
                .get(module_id)
                .cloned()
                .unwrap_or_else(|| self.create_context(module_id, Value::Null));

            if let Err(err) = LifecycleDriver::stop(module.as_ref(), &ctx).await {
                warn!(module_id = %module_id, error = %err, "停止钩子失败，继续清理");
            }
            if let Err(err) = LifecycleDriver::destroy(module.as_ref(), &ctx).await {
                warn!(module_id = %module_id, error = %err, "销毁钩子失败，继续清理");
            }
            if module.status() != ModuleStatus::Error {
                module.set_status(ModuleStatus::Unloaded);
            }

            self.event_bus.unsubscribe_all(module_id).await;
            self.contexts.write().await.remove(module_id);
            info!(module_id = %module_id, status = %module.status(), "模块已卸载");

            self.publish(
                system_events::MODULE_UNLOADED,
                json!({ "module_id": module_id }),
            )
            .await;
            self.notify_dependents(module_id, module.status()).await;
            Ok(())
        }
        .boxed()
    }

    async fn notify_dependents(&self, module_id: &str, status: ModuleStatus) {
        let dependents = self.graph.read().await.get_dependents(module_id);
        for dependent_id in dependents {
            let Some(dependent) = self.get_module(&dependent_id).await else {
                continue;
            };
            let Some(ctx) = self.contexts.read().await.get(&dependent_id).cloned() else {
                continue;
            };
            if let Err(err) =
                LifecycleDriver::dependency_change(dependent.as_ref(), module_id, status, &ctx).await
            {
                warn!(
                    module_id = %dependent_id,
                    dependency = %module_id,
                    error = %err,
                    "依赖变更通知失败"
                );
            }
        }
    }

    // ==================== 配置 ====================

    fn config_key(&self, module_id: &str) -> String {
        format!("{}.{}", self.settings.config_namespace, module_id)
    }

    async fn module_config(&self, module_id: &str) -> Option<Value> {
        self.config.get_value(&self.config_key(module_id)).await
    }

    /// 开始监听模块配置命名空间
    ///
    /// 变更经由通道交给后台任务按顺序处理，重复调用无效果。
    pub async fn start_config_watch(&self) {
        if self.watch.lock().unwrap().is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<ConfigChange>();
        let pattern = format!("{}.*", self.settings.config_namespace);
        let watch_id = self
            .config
            .watch(
                &pattern,
                Arc::new(move |change: &ConfigChange| {
                    let _ = tx.send(change.clone());
                }),
            )
            .await;

        let registry = self.self_ref.clone();
        let task = tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.handle_config_change(&change).await;
            }
        });

        info!(pattern = %pattern, "开始监听模块配置");
        let mut watch = self.watch.lock().unwrap();
        if let Some(previous) = watch.replace(ConfigWatch { watch_id, task }) {
            previous.task.abort();
        }
    }

    /// 停止监听模块配置
    pub async fn stop_config_watch(&self) {
        let Some(watch) = self.watch.lock().unwrap().take() else {
            return;
        };
        self.config.unwatch(&watch.watch_id).await;
        watch.task.abort();
        debug!("停止监听模块配置");
    }

    /// 处理一条配置变更
    ///
    /// `enabled` 由假变真时加载模块，由真变假时卸载；运行中的模块收到其余
    /// 变更时调用 `on_config_change`。整体替换命名空间（或其祖先键）时
    /// 逐个核对所有已注册模块。处理失败只记录日志。
    pub async fn handle_config_change(&self, change: &ConfigChange) {
        let namespace = self.settings.config_namespace.as_str();
        let replaces_namespace = change.key == namespace
            || (namespace.len() > change.key.len()
                && namespace.starts_with(change.key.as_str())
                && namespace.as_bytes()[change.key.len()] == b'.');

        if replaces_namespace {
            let mut ids: Vec<String> = self.modules.read().await.keys().cloned().collect();
            ids.sort();
            debug!(key = %change.key, modules = ids.len(), "配置命名空间被整体替换");
            for module_id in ids {
                self.reconcile_module(&module_id, &change.key).await;
            }
            return;
        }

        let prefix = format!("{}.", namespace);
        let Some(module_id) = change
            .key
            .strip_prefix(&prefix)
            .and_then(|rest| rest.split('.').next())
            .filter(|id| !id.is_empty())
        else {
            return;
        };
        self.reconcile_module(module_id, &change.key).await;
    }

    /// 按模块当前配置调整其运行状态
    async fn reconcile_module(&self, module_id: &str, key: &str) {
        let Some(module) = self.get_module(module_id).await else {
            debug!(module_id = %module_id, key = %key, "未注册模块的配置变更，忽略");
            return;
        };

        let new_config = self.module_config(module_id).await;
        let enabled = new_config.as_ref().is_some_and(is_enabled);

        let outcome = match (module.status(), new_config) {
            (ModuleStatus::Running, Some(config)) if enabled => {
                self.apply_config(module.as_ref(), config).await
            }
            (status, _) if !enabled && status.is_loaded() => {
                info!(module_id = %module_id, "模块已被禁用，开始卸载");
                self.unload_module(module_id).await
            }
            (ModuleStatus::Unloaded | ModuleStatus::Stopped, _) if enabled => {
                info!(module_id = %module_id, "模块已被启用，开始加载");
                self.load_module(module_id).await
            }
            (status, _) => {
                debug!(module_id = %module_id, status = %status, "当前状态下忽略配置变更");
                Ok(())
            }
        };

        if let Err(err) = outcome {
            warn!(module_id = %module_id, key = %key, error = %err, "处理配置变更失败");
        }
    }

    async fn apply_config(&self, module: &dyn Module, new_config: Value) -> Result<()> {
        let module_id = module.id();
        let Some(ctx) = self.contexts.read().await.get(module_id).cloned() else {
            return Ok(());
        };
        if ctx.config() == &new_config {
            return Ok(());
        }

        module
            .validate_config(&new_config)
            .map_err(|err| CoreError::Validation {
                module_id: module_id.to_string(),
                reason: err.to_string(),
            })?;

        LifecycleDriver::config_change(module, &new_config, ctx.config(), &ctx).await?;

        let updated = ctx.with_config(new_config);
        module.base().rebind(&updated);
        self.contexts.write().await.insert(module_id.to_string(), updated);
        debug!(module_id = %module_id, "模块配置已更新");
        Ok(())
    }

    // ==================== 批量加载 ====================

    /// 加载客户配置中启用的所有模块
    ///
    /// 未注册但加载器可以实例化的模块会先注册。按优先级升序排序后分批并发加载，
    /// 每批全部完成后才开始下一批，单个模块失败不影响同批其他模块。
    pub async fn load_enabled_modules(&self) -> Result<BatchLoadReport> {
        let entries: Vec<CustomerModuleEntry> =
            match self.config.get_value(&self.settings.customer_modules_key).await {
                Some(value) => serde_json::from_value(value)?,
                None => Vec::new(),
            };

        let mut report = BatchLoadReport::default();
        let mut queue: Vec<(i32, String)> = Vec::new();

        for entry in entries.into_iter().filter(|e| e.enabled) {
            let module = match self.get_module(&entry.module_id).await {
                Some(module) => module,
                None if self.loader.is_some() => match self.register_from_loader(&entry.module_id).await {
                    Ok(module) => module,
                    Err(err) => {
                        warn!(module_id = %entry.module_id, error = %err, "客户模块注册失败");
                        report.failed.push((entry.module_id, err));
                        continue;
                    }
                },
                None => {
                    report
                        .failed
                        .push((entry.module_id.clone(), CoreError::ModuleNotFound(entry.module_id)));
                    continue;
                }
            };
            let priority = entry.priority.unwrap_or(module.metadata().priority);
            queue.push((priority, entry.module_id));
        }

        queue.sort();
        let batch_size = self.settings.batch_concurrency.max(1);
        info!(total = queue.len(), batch_size, "开始批量加载模块");

        for (index, batch) in queue.chunks(batch_size).enumerate() {
            debug!(batch = index + 1, size = batch.len(), "加载批次");
            let results = join_all(batch.iter().map(|(_, id)| self.load_module(id))).await;

            for ((_, module_id), result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => {
                        let running = self
                            .get_module(module_id)
                            .await
                            .is_some_and(|m| m.status() == ModuleStatus::Running);
                        if running {
                            report.loaded.push(module_id.clone());
                        } else {
                            report.skipped.push(module_id.clone());
                        }
                    }
                    Err(err) => {
                        warn!(module_id = %module_id, error = %err, "批量加载中的模块失败");
                        report.failed.push((module_id.clone(), err));
                    }
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "批量加载完成"
        );
        Ok(report)
    }

    // ==================== 查询 ====================

    /// 获取模块
    pub async fn get_module(&self, module_id: &str) -> Option<Arc<dyn Module>> {
        self.modules.read().await.get(module_id).cloned()
    }

    /// 所有模块，按 ID 排序
    pub async fn get_all_modules(&self) -> Vec<Arc<dyn Module>> {
        let mut modules: Vec<Arc<dyn Module>> = self.modules.read().await.values().cloned().collect();
        modules.sort_by(|a, b| a.id().cmp(b.id()));
        modules
    }

    /// 处于指定状态的模块
    pub async fn get_modules_by_status(&self, status: ModuleStatus) -> Vec<Arc<dyn Module>> {
        self.get_all_modules()
            .await
            .into_iter()
            .filter(|m| m.status() == status)
            .collect()
    }

    /// 是否已注册
    pub async fn is_registered(&self, module_id: &str) -> bool {
        self.modules.read().await.contains_key(module_id)
    }

    /// 已注册模块数
    pub async fn module_count(&self) -> usize {
        self.modules.read().await.len()
    }

    /// 依赖图节点（含深度）
    pub async fn dependency_nodes(&self) -> Result<Vec<DependencyNode>> {
        self.graph.read().await.nodes()
    }

    /// 运行中模块的上下文
    pub async fn context(&self, module_id: &str) -> Option<ModuleContext> {
        self.contexts.read().await.get(module_id).cloned()
    }

    // ==================== 共享服务 ====================

    /// 注册共享服务，返回是否替换了同名服务
    pub fn register_service<T: std::any::Any + Send + Sync>(&self, name: impl Into<String>, service: Arc<T>) -> bool {
        self.services.register(name, service)
    }

    /// 注销共享服务
    pub fn unregister_service(&self, name: &str) -> bool {
        self.services.unregister(name)
    }

    /// 共享服务表
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    // ==================== 组件访问 ====================

    /// 事件总线
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// 模块加载器
    pub fn loader(&self) -> Option<&ModuleLoader> {
        self.loader.as_ref()
    }

    /// 健康检查器
    pub fn health_checker(&self) -> Option<&HealthChecker> {
        self.health.as_ref().map(|(checker, _)| checker)
    }

    async fn publish(&self, event_type: &str, data: Value) {
        self.event_bus
            .publish(Event::new(event_type, system_events::SENDER, data))
            .await;
    }

    // ==================== 关闭 ====================

    /// 关闭注册表
    ///
    /// 停止配置监听，按依赖方优先的顺序卸载所有模块，最后销毁健康检查器。
    pub async fn shutdown(&self) -> Result<()> {
        info!("开始关闭模块注册表");
        self.stop_config_watch().await;

        let order = self.graph.read().await.topological_order()?;
        for module_id in order.iter().rev() {
            if let Err(err) = self.unload_module(module_id).await {
                warn!(module_id = %module_id, error = %err, "关闭时卸载模块失败");
            }
        }

        if let Some((checker, _)) = &self.health {
            checker.destroy();
        }
        info!("模块注册表已关闭");
        Ok(())
    }
}

fn is_enabled(config: &Value) -> bool {
    match config {
        Value::Bool(enabled) => *enabled,
        other => other.get("enabled").and_then(Value::as_bool).unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config_manager::ConfigManager;
    use crate::module::contract::ModuleBase;
    use crate::module::metadata::{ModuleDependency, ModuleMetadata};
    use crate::utils::ErrorKind;

    struct PlainModule {
        base: ModuleBase,
    }

    impl Module for PlainModule {
        fn base(&self) -> &ModuleBase {
            &self.base
        }
    }

    fn plain(metadata: ModuleMetadata) -> Arc<dyn Module> {
        Arc::new(PlainModule {
            base: ModuleBase::new(metadata),
        })
    }

    async fn create_registry(enabled: &[&str]) -> Arc<ModuleRegistry> {
        let config = Arc::new(ConfigManager::new());
        for id in enabled {
            config
                .set(&format!("modules.{}", id), json!({"enabled": true}))
                .await
                .unwrap();
        }
        ModuleRegistry::new(config)
    }

    #[test]
    fn test_is_enabled() {
        assert!(is_enabled(&json!({})));
        assert!(is_enabled(&json!({"enabled": true, "x": 1})));
        assert!(!is_enabled(&json!({"enabled": false})));
        assert!(!is_enabled(&json!(false)));
    }

    #[tokio::test]
    async fn test_version_constraint_checked_on_register() {
        let registry = create_registry(&[]).await;
        registry
            .register(plain(ModuleMetadata::new("storage", "Storage", "1.4.0")))
            .await
            .unwrap();

        let err = registry
            .register(plain(
                ModuleMetadata::new("chat", "Chat", "1.0.0")
                    .with_dependency(ModuleDependency::required("storage").with_version("^2.0")),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::VersionMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!registry.is_registered("chat").await);

        registry
            .register(plain(
                ModuleMetadata::new("chat", "Chat", "1.0.0")
                    .with_dependency(ModuleDependency::required("storage").with_version("^1.2")),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dependency_nodes_depth() {
        let registry = create_registry(&[]).await;
        registry
            .register(plain(ModuleMetadata::new("a", "A", "1.0.0")))
            .await
            .unwrap();
        registry
            .register(plain(
                ModuleMetadata::new("b", "B", "1.0.0").with_dependency(ModuleDependency::required("a")),
            ))
            .await
            .unwrap();

        let nodes = registry.dependency_nodes().await.unwrap();
        let b = nodes.iter().find(|n| n.module_id == "b").unwrap();
        assert_eq!(b.depth, 1);
        assert!(b.dependencies.contains("a"));
    }

    #[tokio::test]
    async fn test_load_and_unload_publish_events() {
        let registry = create_registry(&["a"]).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        registry
            .event_bus()
            .subscribe(
                "observer",
                "system.module.*",
                None,
                Arc::new(move |event: Event| s.lock().unwrap().push(event.event_type)),
            )
            .await;

        registry
            .register(plain(ModuleMetadata::new("a", "A", "1.0.0")))
            .await
            .unwrap();
        registry.load_module("a").await.unwrap();
        registry.unload_module("a").await.unwrap();
        registry.unregister("a").await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                system_events::MODULE_REGISTERED,
                system_events::MODULE_LOADED,
                system_events::MODULE_UNLOADED,
                system_events::MODULE_UNREGISTERED,
            ]
        );
    }

    #[tokio::test]
    async fn test_context_links_back_to_registry() {
        let registry = create_registry(&["a"]).await;
        registry
            .register(plain(ModuleMetadata::new("a", "A", "1.0.0")))
            .await
            .unwrap();
        registry.register_service("answer", Arc::new(42u32));
        registry.load_module("a").await.unwrap();

        let ctx = registry.context("a").await.unwrap();
        assert!(ctx.registry().is_some());
        assert_eq!(ctx.service::<u32>("answer").as_deref(), Some(&42));
    }
}
