//! 模块加载器
//!
//! 把模块 ID 解析为可执行单元并实例化，负责：
//!
//! - 路径解析：显式路径 > 配置中的路径映射 > 默认约定 `{base_path}/{module_id}`
//! - 实例化：在编译期注册的工厂函数表中按路径查找，超时与重试受配置控制
//! - 结构校验：导出模块的 ID 必须与请求的 ID 一致，元数据必须合法
//! - 单飞：同一 ID 同时只有一个加载在进行，并发调用共享结果
//! - LRU 缓存：超出容量时淘汰最久未访问的实例
//!
//! 路径无法解析和校验失败都不会重试。

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use lru::LruCache;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::config::LoaderConfig;
use crate::module::contract::Module;
use crate::utils::retry::{retry_with_backoff, with_timeout, RetryPolicy};
use crate::utils::{CoreError, Result};

/// 模块工厂函数
pub type ModuleFactory = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Module>>> + Send + Sync>;

type SharedLoad = Shared<BoxFuture<'static, Result<LoadedModule>>>;

/// 加载结果
#[derive(Clone)]
pub struct LoadedModule {
    /// 模块实例
    pub module: Arc<dyn Module>,
    /// 加载耗时（毫秒），缓存命中时为 0
    pub load_time_ms: u64,
    /// 是否来自缓存
    pub from_cache: bool,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("module_id", &self.module.id())
            .field("load_time_ms", &self.load_time_ms)
            .field("from_cache", &self.from_cache)
            .finish()
    }
}

/// 单次加载的可选参数，未设置的项使用加载器配置
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// 显式路径
    pub path: Option<String>,
    /// 单次实例化超时
    pub timeout: Option<Duration>,
    /// 重试次数
    pub retries: Option<u32>,
}

impl LoadOptions {
    /// 指定显式路径
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// 指定超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 指定重试次数
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

struct CachedModule {
    module: Arc<dyn Module>,
    load_duration: Duration,
    last_accessed: DateTime<Utc>,
    access_count: u64,
}

/// 缓存条目信息
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    /// 首次加载耗时（毫秒）
    pub load_time_ms: u64,
    /// 最后访问时间
    pub last_accessed: DateTime<Utc>,
    /// 访问次数（含首次加载）
    pub access_count: u64,
}

/// 缓存统计信息
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// 命中次数
    pub hits: u64,
    /// 未命中次数
    pub misses: u64,
    /// 命中率（0.0 - 1.0）
    pub hit_rate: f64,
    /// 当前条目数
    pub size: usize,
    /// 容量
    pub capacity: usize,
}

struct LoaderInner {
    config: LoaderConfig,
    /// 路径 -> 工厂
    factories: RwLock<HashMap<String, ModuleFactory>>,
    cache: Mutex<LruCache<String, CachedModule>>,
    in_flight: Mutex<HashMap<String, SharedLoad>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// 模块加载器
///
/// 克隆开销很小，所有克隆共享工厂表与缓存。
#[derive(Clone)]
pub struct ModuleLoader {
    inner: Arc<LoaderInner>,
}

impl ModuleLoader {
    /// 创建加载器
    pub fn new(config: LoaderConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_cache_size).unwrap_or(NonZeroUsize::MIN);
        info!(
            capacity = capacity.get(),
            cache_enabled = config.cache_enabled,
            "创建模块加载器"
        );
        Self {
            inner: Arc::new(LoaderInner {
                config,
                factories: RwLock::new(HashMap::new()),
                cache: Mutex::new(LruCache::new(capacity)),
                in_flight: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// 加载器配置
    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    // ==================== 工厂注册 ====================

    /// 在指定路径注册工厂
    pub fn register_factory<F, Fut>(&self, path: impl Into<String>, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Module>>> + Send + 'static,
    {
        let path = path.into();
        let factory: ModuleFactory = Arc::new(move || factory().boxed());
        debug!(path = %path, "注册模块工厂");
        self.inner.factories.write().unwrap().insert(path, factory);
    }

    /// 按默认约定路径为模块 ID 注册工厂
    pub fn register_module<F, Fut>(&self, module_id: &str, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Module>>> + Send + 'static,
    {
        let path = self.default_path(module_id);
        self.register_factory(path, factory);
    }

    /// 已注册工厂的路径
    pub fn registered_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.factories.read().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// 是否能为模块 ID 解析出已注册的工厂
    pub fn can_load(&self, module_id: &str) -> bool {
        let path = self.resolve_path(module_id, None);
        self.inner.factories.read().unwrap().contains_key(&path)
    }

    /// 解析模块路径：显式路径 > 路径映射 > 默认约定
    pub fn resolve_path(&self, module_id: &str, explicit: Option<&str>) -> String {
        if let Some(path) = explicit {
            return path.to_string();
        }
        if let Some(path) = self.inner.config.path_mappings.get(module_id) {
            return path.clone();
        }
        self.default_path(module_id)
    }

    fn default_path(&self, module_id: &str) -> String {
        format!("{}/{}", self.inner.config.base_path, module_id)
    }

    // ==================== 加载 ====================

    /// 加载模块
    ///
    /// # 错误
    ///
    /// - `CoreError::ModuleNotFound`: 路径上没有注册工厂（不重试）
    /// - `CoreError::Timeout`: 每次尝试都超时
    /// - `CoreError::ModuleLoadFailed`: 实例化失败且重试耗尽
    /// - `CoreError::Validation`: 导出的模块不符合契约（不重试）
    pub async fn load_module(&self, module_id: &str, options: LoadOptions) -> Result<LoadedModule> {
        let pending = {
            let mut in_flight = self.inner.in_flight.lock().unwrap();

            // 1. 已有进行中的加载，共享其结果
            if let Some(pending) = in_flight.get(module_id) {
                debug!(module_id = %module_id, "复用进行中的加载");
                pending.clone()
            } else {
                // 2. 缓存命中
                if let Some(hit) = self.cache_lookup(module_id) {
                    return Ok(hit);
                }

                let this = self.clone();
                let id = module_id.to_string();
                let pending = async move {
                    let result = this.load_uncached(&id, options).await;
                    this.inner.in_flight.lock().unwrap().remove(&id);
                    result
                }
                .boxed()
                .shared();
                in_flight.insert(module_id.to_string(), pending.clone());
                pending
            }
        };

        pending.await
    }

    async fn load_uncached(&self, module_id: &str, options: LoadOptions) -> Result<LoadedModule> {
        // 3. 解析路径，失败即终止
        let path = self.resolve_path(module_id, options.path.as_deref());
        let factory = self
            .inner
            .factories
            .read()
            .unwrap()
            .get(&path)
            .cloned()
            .ok_or_else(|| CoreError::ModuleNotFound(format!("{} (路径: {})", module_id, path)))?;

        let timeout = options.timeout.unwrap_or_else(|| self.inner.config.timeout());
        let mut policy = self.inner.config.retry_policy();
        if let Some(retries) = options.retries {
            policy = RetryPolicy { max_retries: retries, ..policy };
        }

        info!(module_id = %module_id, path = %path, "开始加载模块");
        let started = Instant::now();

        // 4/5. 超时 + 指数退避重试
        let module = retry_with_backoff(&policy, |attempt| {
            let factory = factory.clone();
            async move {
                debug!(module_id = %module_id, attempt = attempt + 1, "实例化模块");
                with_timeout(timeout, &format!("实例化模块 '{}'", module_id), async move {
                    factory().await.map_err(|e| match e {
                        CoreError::Timeout(_) => e,
                        other => CoreError::ModuleLoadFailed {
                            module_id: module_id.to_string(),
                            reason: other.to_string(),
                        },
                    })
                })
                .await
            }
        })
        .await
        .map_err(|e| {
            warn!(module_id = %module_id, error = %e, "模块加载失败");
            e
        })?;

        // 6. 结构校验，不重试
        Self::validate(module_id, module.as_ref())?;

        let load_duration = started.elapsed();
        let load_time_ms = load_duration.as_millis() as u64;

        // 7. 写入缓存
        if self.inner.config.cache_enabled {
            let entry = CachedModule {
                module: module.clone(),
                load_duration,
                last_accessed: Utc::now(),
                access_count: 1,
            };
            let evicted = self
                .inner
                .cache
                .lock()
                .unwrap()
                .push(module_id.to_string(), entry);
            if let Some((evicted_id, _)) = evicted.filter(|(k, _)| k != module_id) {
                info!(evicted = %evicted_id, "缓存已满，淘汰最久未访问的模块");
            }
        }

        info!(module_id = %module_id, load_time_ms, "模块加载完成");
        Ok(LoadedModule {
            module,
            load_time_ms,
            from_cache: false,
        })
    }

    fn validate(module_id: &str, module: &dyn Module) -> Result<()> {
        if module.id() != module_id {
            return Err(CoreError::Validation {
                module_id: module_id.to_string(),
                reason: format!("导出的模块 ID 为 '{}'", module.id()),
            });
        }
        module
            .metadata()
            .validate()
            .map_err(|errors| CoreError::Validation {
                module_id: module_id.to_string(),
                reason: errors.join("; "),
            })
    }

    // ==================== 缓存 ====================

    fn cache_lookup(&self, module_id: &str) -> Option<LoadedModule> {
        if !self.inner.config.cache_enabled {
            return None;
        }

        let mut cache = self.inner.cache.lock().unwrap();
        match cache.get_mut(module_id) {
            Some(entry) => {
                entry.last_accessed = Utc::now();
                entry.access_count += 1;
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                debug!(module_id = %module_id, access_count = entry.access_count, "缓存命中");
                Some(LoadedModule {
                    module: entry.module.clone(),
                    load_time_ms: 0,
                    from_cache: true,
                })
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// 模块是否在缓存中（不影响访问顺序）
    pub fn is_cached(&self, module_id: &str) -> bool {
        self.inner.cache.lock().unwrap().contains(module_id)
    }

    /// 缓存条目信息（不影响访问顺序）
    pub fn cache_entry(&self, module_id: &str) -> Option<CacheEntryInfo> {
        self.inner
            .cache
            .lock()
            .unwrap()
            .peek(module_id)
            .map(|entry| CacheEntryInfo {
                load_time_ms: entry.load_duration.as_millis() as u64,
                last_accessed: entry.last_accessed,
                access_count: entry.access_count,
            })
    }

    /// 从缓存移除单个模块
    pub fn evict(&self, module_id: &str) -> bool {
        self.inner.cache.lock().unwrap().pop(module_id).is_some()
    }

    /// 清空缓存并重置统计
    pub fn clear_cache(&self) {
        self.inner.cache.lock().unwrap().clear();
        self.inner.hits.store(0, Ordering::Relaxed);
        self.inner.misses.store(0, Ordering::Relaxed);
        debug!("模块缓存已清空");
    }

    /// 缓存统计
    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.inner.cache.lock().unwrap();
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            size: cache.len(),
            capacity: cache.cap().get(),
        }
    }
}
