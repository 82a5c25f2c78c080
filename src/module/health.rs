//! 模块健康检查
//!
//! 每个被监控的模块拥有一个定时任务：
//!
//! - `start_monitoring` 时立即执行一次检查，之后按固定间隔检查
//! - 每次检查以 `get_health()` 与超时竞速，超时立即记为带超时说明的不健康状态
//! - 返回错误或 panic 累加重试计数，达到 `retries` 才标记为不健康
//! - 任意一次成功检查把重试计数清零
//! - 只有对外可见的健康等级发生变化时才通知监听器
//!
//! 聚合查询只读取状态表，不触发任何检查。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::config::HealthCheckConfig;
use crate::module::contract::Module;
use crate::module::metadata::{HealthState, HealthStatus};
use crate::utils::{CoreError, Result};

/// 监听所有模块的通配符
pub const ALL_MODULES: &str = "*";

/// 健康状态变化监听器，参数为模块 ID 与新状态
pub type HealthListener = Arc<dyn Fn(&str, &HealthStatus) + Send + Sync>;

struct HealthCheckTimer {
    generation: u64,
    module: Arc<dyn Module>,
    config: HealthCheckConfig,
    retry_count: u32,
    last_check: Option<DateTime<Utc>>,
    task: Option<JoinHandle<()>>,
}

/// 单个模块的监控快照
#[derive(Debug, Clone, Serialize)]
pub struct MonitorInfo {
    /// 模块 ID
    pub module_id: String,
    /// 当前连续失败次数
    pub retry_count: u32,
    /// 最后一次检查时间
    pub last_check: Option<DateTime<Utc>>,
    /// 最后记录的状态
    pub last_status: Option<HealthStatus>,
}

/// 聚合健康状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedHealth {
    /// 整体状态，取所有模块中最差者
    pub overall: HealthState,
    /// 健康模块数
    pub healthy: usize,
    /// 降级模块数
    pub degraded: usize,
    /// 不健康模块数
    pub unhealthy: usize,
    /// 有状态记录的模块总数
    pub total: usize,
}

struct CheckerInner {
    timers: Mutex<HashMap<String, HealthCheckTimer>>,
    statuses: RwLock<HashMap<String, HealthStatus>>,
    listeners: RwLock<HashMap<u64, (String, HealthListener)>>,
    next_listener_id: AtomicU64,
    next_generation: AtomicU64,
}

/// 健康检查器
#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<CheckerInner>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    /// 创建健康检查器
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CheckerInner {
                timers: Mutex::new(HashMap::new()),
                statuses: RwLock::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    // ==================== 监控管理 ====================

    /// 开始监控模块
    ///
    /// 已在监控中的模块会先停止旧的定时任务。初始检查在返回前完成。
    pub async fn start_monitoring(&self, module: Arc<dyn Module>, config: HealthCheckConfig) {
        let module_id = module.id().to_string();
        if !config.enabled {
            debug!(module_id = %module_id, "健康检查已禁用，跳过监控");
            return;
        }

        self.stop_monitoring(&module_id);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let replaced = self.inner.timers.lock().unwrap().insert(
            module_id.clone(),
            HealthCheckTimer {
                generation,
                module,
                config,
                retry_count: 0,
                last_check: None,
                task: None,
            },
        );
        if let Some(task) = replaced.and_then(|timer| timer.task) {
            task.abort();
        }
        info!(
            module_id = %module_id,
            interval_ms = config.interval_ms,
            timeout_ms = config.timeout_ms,
            retries = config.retries,
            "开始健康监控"
        );

        Self::check(&self.inner, &module_id).await;

        let weak = Arc::downgrade(&self.inner);
        let task_id = module_id.clone();
        let mut timers = self.inner.timers.lock().unwrap();
        // 初始检查期间可能已被停止或被新的监控取代
        if let Some(timer) = timers.get_mut(&module_id).filter(|t| t.generation == generation) {
            let task = tokio::spawn(Self::run_timer(weak, task_id, config));
            if let Some(previous) = timer.task.replace(task) {
                previous.abort();
            }
        }
    }

    async fn run_timer(inner: Weak<CheckerInner>, module_id: String, config: HealthCheckConfig) {
        let period = config.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            Self::check(&inner, &module_id).await;
        }
    }

    /// 停止监控模块，返回模块是否在监控中
    pub fn stop_monitoring(&self, module_id: &str) -> bool {
        let timer = self.inner.timers.lock().unwrap().remove(module_id);
        self.inner.statuses.write().unwrap().remove(module_id);

        match timer {
            Some(timer) => {
                if let Some(task) = timer.task {
                    task.abort();
                }
                debug!(module_id = %module_id, "停止健康监控");
                true
            }
            None => false,
        }
    }

    /// 是否正在监控
    pub fn is_monitoring(&self, module_id: &str) -> bool {
        self.inner.timers.lock().unwrap().contains_key(module_id)
    }

    /// 被监控的模块
    pub fn monitored_modules(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.timers.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 监控快照
    pub fn monitor_info(&self, module_id: &str) -> Option<MonitorInfo> {
        let timers = self.inner.timers.lock().unwrap();
        let timer = timers.get(module_id)?;
        Some(MonitorInfo {
            module_id: module_id.to_string(),
            retry_count: timer.retry_count,
            last_check: timer.last_check,
            last_status: self.get_module_health(module_id),
        })
    }

    // ==================== 检查 ====================

    /// 立即执行一次检查，返回检查后记录的状态
    ///
    /// 失败次数尚未达到阈值且之前没有记录时返回 `Ok(None)`。
    pub async fn perform_health_check(&self, module_id: &str) -> Result<Option<HealthStatus>> {
        if !self.is_monitoring(module_id) {
            return Err(CoreError::ModuleNotFound(module_id.to_string()));
        }
        Self::check(&self.inner, module_id).await;
        Ok(self.get_module_health(module_id))
    }

    async fn check(inner: &Arc<CheckerInner>, module_id: &str) {
        let entry = {
            let timers = inner.timers.lock().unwrap();
            timers.get(module_id).map(|t| (t.module.clone(), t.config))
        };
        let Some((module, config)) = entry else {
            return;
        };

        let health = AssertUnwindSafe(module.get_health()).catch_unwind();
        let outcome = match tokio::time::timeout(config.timeout(), health).await {
            Ok(Ok(Ok(status))) => Ok(status),
            Ok(Ok(Err(err))) => Err(err.to_string()),
            Ok(Err(_)) => Err("健康检查 panic".to_string()),
            Err(_) => {
                warn!(module_id = %module_id, timeout_ms = config.timeout_ms, "健康检查超时");
                Ok(
                    HealthStatus::unhealthy(format!("健康检查超时 (timeout {}ms)", config.timeout_ms))
                        .with_detail("timeout_ms", Value::from(config.timeout_ms)),
                )
            }
        };

        let recorded = {
            let mut timers = inner.timers.lock().unwrap();
            // 检查期间被停止
            let Some(timer) = timers.get_mut(module_id) else {
                return;
            };
            timer.last_check = Some(Utc::now());

            match outcome {
                Ok(status) => {
                    timer.retry_count = 0;
                    Some(status)
                }
                Err(reason) => {
                    timer.retry_count += 1;
                    warn!(
                        module_id = %module_id,
                        retry_count = timer.retry_count,
                        retries = config.retries,
                        error = %reason,
                        "健康检查失败"
                    );
                    (timer.retry_count >= config.retries).then(|| {
                        HealthStatus::unhealthy(reason)
                            .with_detail("retry_count", Value::from(timer.retry_count))
                    })
                }
            }
        };

        if let Some(status) = recorded {
            Self::record(inner, module_id, status);
        }
    }

    fn record(inner: &CheckerInner, module_id: &str, status: HealthStatus) {
        let previous = inner
            .statuses
            .write()
            .unwrap()
            .insert(module_id.to_string(), status.clone());

        let changed = previous.map_or(true, |p| p.status != status.status);
        if !changed {
            return;
        }

        info!(module_id = %module_id, status = %status.status, "模块健康状态变化");

        let listeners: Vec<HealthListener> = inner
            .listeners
            .read()
            .unwrap()
            .values()
            .filter(|(scope, _)| scope == ALL_MODULES || scope == module_id)
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener(module_id, &status)));
            if outcome.is_err() {
                warn!(module_id = %module_id, "健康状态监听器 panic，已忽略");
            }
        }
    }

    // ==================== 查询 ====================

    /// 模块最后记录的健康状态
    pub fn get_module_health(&self, module_id: &str) -> Option<HealthStatus> {
        self.inner.statuses.read().unwrap().get(module_id).cloned()
    }

    /// 所有模块的健康状态
    pub fn get_all_health(&self) -> HashMap<String, HealthStatus> {
        self.inner.statuses.read().unwrap().clone()
    }

    /// 聚合健康状态
    pub fn get_aggregated_health(&self) -> AggregatedHealth {
        let statuses = self.inner.statuses.read().unwrap();
        let mut aggregated = AggregatedHealth {
            overall: HealthState::Healthy,
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            total: statuses.len(),
        };

        for status in statuses.values() {
            match status.status {
                HealthState::Healthy => aggregated.healthy += 1,
                HealthState::Degraded => aggregated.degraded += 1,
                HealthState::Unhealthy => aggregated.unhealthy += 1,
            }
            aggregated.overall = aggregated.overall.max(status.status);
        }

        aggregated
    }

    // ==================== 监听 ====================

    /// 订阅健康状态变化，`module_id` 为 `"*"` 时接收所有模块
    pub fn on_health_change<F>(&self, module_id: impl Into<String>, listener: F) -> HealthListenerHandle
    where
        F: Fn(&str, &HealthStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .unwrap()
            .insert(id, (module_id.into(), Arc::new(listener)));

        HealthListenerHandle {
            id,
            checker: Arc::downgrade(&self.inner),
        }
    }

    /// 监听器数量
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().unwrap().len()
    }

    /// 停止所有监控并清空状态与监听器
    pub fn destroy(&self) {
        let timers: Vec<HealthCheckTimer> = self
            .inner
            .timers
            .lock()
            .unwrap()
            .drain()
            .map(|(_, timer)| timer)
            .collect();
        let count = timers.len();
        for task in timers.into_iter().filter_map(|t| t.task) {
            task.abort();
        }

        self.inner.statuses.write().unwrap().clear();
        self.inner.listeners.write().unwrap().clear();
        info!(stopped = count, "健康检查器已销毁");
    }
}

/// 监听器句柄
#[derive(Debug)]
pub struct HealthListenerHandle {
    id: u64,
    checker: Weak<CheckerInner>,
}

impl HealthListenerHandle {
    /// 取消订阅，返回监听器是否仍然存在
    pub fn unsubscribe(self) -> bool {
        match self.checker.upgrade() {
            Some(inner) => inner.listeners.write().unwrap().remove(&self.id).is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::contract::ModuleBase;
    use crate::module::metadata::ModuleMetadata;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FixedHealthModule {
        base: ModuleBase,
        state: HealthState,
    }

    #[async_trait]
    impl Module for FixedHealthModule {
        fn base(&self) -> &ModuleBase {
            &self.base
        }

        async fn get_health(&self) -> Result<HealthStatus> {
            Ok(match self.state {
                HealthState::Healthy => HealthStatus::healthy(),
                HealthState::Degraded => HealthStatus::degraded("负载偏高"),
                HealthState::Unhealthy => HealthStatus::unhealthy("磁盘已满"),
            })
        }
    }

    fn fixed(id: &str, state: HealthState) -> Arc<dyn Module> {
        Arc::new(FixedHealthModule {
            base: ModuleBase::new(ModuleMetadata::new(id, id, "1.0.0")),
            state,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_check_runs_immediately() {
        let checker = HealthChecker::new();
        checker
            .start_monitoring(fixed("a", HealthState::Healthy), HealthCheckConfig::default())
            .await;

        assert!(checker.is_monitoring("a"));
        assert!(checker.get_module_health("a").unwrap().is_healthy());
        assert!(checker.monitor_info("a").unwrap().last_check.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_config_skips_monitoring() {
        let checker = HealthChecker::new();
        let config = HealthCheckConfig {
            enabled: false,
            ..Default::default()
        };
        checker.start_monitoring(fixed("a", HealthState::Healthy), config).await;
        assert!(!checker.is_monitoring("a"));
        assert!(checker.get_module_health("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregated_health_worst_of() {
        let checker = HealthChecker::new();
        assert_eq!(checker.get_aggregated_health().overall, HealthState::Healthy);

        let config = HealthCheckConfig::default();
        checker.start_monitoring(fixed("a", HealthState::Healthy), config).await;
        checker.start_monitoring(fixed("b", HealthState::Degraded), config).await;

        let aggregated = checker.get_aggregated_health();
        assert_eq!(aggregated.overall, HealthState::Degraded);
        assert_eq!((aggregated.healthy, aggregated.degraded, aggregated.total), (1, 1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_scope_and_isolation() {
        let checker = HealthChecker::new();
        let scoped = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));

        checker.on_health_change(ALL_MODULES, |_, _| panic!("监听器崩溃"));
        let s = scoped.clone();
        checker.on_health_change("a", move |_, _| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let w = wildcard.clone();
        let handle = checker.on_health_change(ALL_MODULES, move |_, _| {
            w.fetch_add(1, Ordering::SeqCst);
        });

        let config = HealthCheckConfig::default();
        checker.start_monitoring(fixed("a", HealthState::Healthy), config).await;
        checker.start_monitoring(fixed("b", HealthState::Healthy), config).await;

        assert_eq!(scoped.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 2);

        assert!(handle.unsubscribe());
        assert_eq!(checker.listener_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_state_does_not_notify() {
        let checker = HealthChecker::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        checker.on_health_change("a", move |_, _| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        let config = HealthCheckConfig {
            interval_ms: 1_000,
            ..Default::default()
        };
        checker.start_monitoring(fixed("a", HealthState::Healthy), config).await;
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    struct SlowHealthModule {
        base: ModuleBase,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Module for SlowHealthModule {
        fn base(&self) -> &ModuleBase {
            &self.base
        }

        async fn get_health(&self) -> Result<HealthStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(HealthStatus::healthy())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_start_keeps_single_timer() {
        let checker = HealthChecker::new();
        let module = Arc::new(SlowHealthModule {
            base: ModuleBase::new(ModuleMetadata::new("a", "a", "1.0.0")),
            calls: AtomicUsize::new(0),
        });
        let config = HealthCheckConfig {
            interval_ms: 1_000,
            timeout_ms: 200,
            ..Default::default()
        };

        tokio::join!(
            checker.start_monitoring(module.clone(), config),
            checker.start_monitoring(module.clone(), config)
        );
        assert_eq!(module.calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert_eq!(module.calls.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(module.calls.load(Ordering::SeqCst), 4);
        assert!(checker.get_module_health("a").unwrap().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_destroy() {
        let checker = HealthChecker::new();
        let config = HealthCheckConfig::default();
        checker.start_monitoring(fixed("a", HealthState::Healthy), config).await;
        checker.start_monitoring(fixed("b", HealthState::Healthy), config).await;

        assert!(checker.stop_monitoring("a"));
        assert!(!checker.stop_monitoring("a"));
        assert!(checker.get_module_health("a").is_none());
        assert!(matches!(
            checker.perform_health_check("a").await,
            Err(CoreError::ModuleNotFound(_))
        ));

        checker.destroy();
        assert!(checker.monitored_modules().is_empty());
        assert_eq!(checker.get_aggregated_health().total, 0);
    }
}
