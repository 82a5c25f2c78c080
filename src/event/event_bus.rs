//! 事件总线
//!
//! 模块间的进程内发布/订阅通道。
//!
//! # 主要功能
//!
//! - **按模块归属订阅**: 每个订阅都记录订阅者模块 ID，模块卸载时可一次性清理
//! - **通配符匹配**: `*` 匹配所有事件，`prefix.*` 匹配前缀
//! - **订阅者隔离**: 单个回调 panic 或超时不影响其他订阅者
//! - **作用域句柄**: [`ModuleEventBus`] 把发布方和订阅者固定为某个模块
//!
//! # 使用示例
//!
//! ```ignore
//! let bus = EventBus::new();
//! let scoped = bus.scoped("chat");
//!
//! scoped.subscribe("queue.*", Arc::new(|event| {
//!     println!("收到事件: {}", event.event_type);
//! })).await;
//!
//! bus.scoped("queue").publish("queue.updated", json!({"size": 3})).await;
//!
//! // 模块卸载时
//! bus.unsubscribe_all("chat").await;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::event::event::{Event, EventFilter};
use crate::utils::{CoreError, Result};

/// 默认回调处理超时时间（秒）
const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 5;

/// 事件回调函数类型
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Clone)]
struct SubscriptionEntry {
    subscriber_id: String,
    pattern: String,
    filter: Option<EventFilter>,
    callback: EventCallback,
}

impl SubscriptionEntry {
    fn matches(&self, event: &Event) -> bool {
        matches_pattern(&self.pattern, &event.event_type)
            && self.filter.as_ref().map_or(true, |f| f.matches(event))
    }
}

/// 匹配事件类型模式
fn matches_pattern(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type.len() > prefix.len() + 1
            && event_type.starts_with(prefix)
            && event_type.as_bytes()[prefix.len()] == b'.';
    }
    pattern == event_type
}

/// 单次发布的分发结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// 成功处理的回调数
    pub delivered: usize,
    /// panic 的回调数
    pub failed: usize,
    /// 超时的回调数
    pub timeouts: usize,
}

/// 累计分发统计
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    /// 已发布事件数
    pub published: u64,
    /// 成功处理的回调数
    pub delivered: u64,
    /// 失败的回调数
    pub failed: u64,
    /// 超时的回调数
    pub timeouts: u64,
    /// 最后发布时间
    pub last_publish_at: Option<DateTime<Utc>>,
}

/// 事件总线配置
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// 单个回调处理超时时间
    pub handler_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(DEFAULT_HANDLER_TIMEOUT_SECS),
        }
    }
}

enum DispatchResult {
    Success,
    Failed(String),
    Timeout,
}

/// 事件总线
///
/// 克隆开销很小，所有克隆共享同一份订阅表。
#[derive(Clone)]
pub struct EventBus {
    /// 订阅 ID -> 订阅条目
    subscriptions: Arc<RwLock<HashMap<String, SubscriptionEntry>>>,
    stats: Arc<RwLock<DispatchStats>>,
    config: EventBusConfig,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// 使用自定义配置创建事件总线
    pub fn with_config(config: EventBusConfig) -> Self {
        debug!(timeout = ?config.handler_timeout, "创建事件总线");
        Self {
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(DispatchStats::default())),
            config,
        }
    }

    /// 获取绑定到某个模块的作用域句柄
    pub fn scoped(&self, module_id: impl Into<String>) -> ModuleEventBus {
        ModuleEventBus {
            bus: self.clone(),
            module_id: module_id.into(),
        }
    }

    /// 订阅事件
    ///
    /// # 参数
    ///
    /// * `subscriber_id` - 订阅者模块 ID
    /// * `pattern` - 事件类型模式（支持 `*` 和 `prefix.*`）
    /// * `filter` - 可选的事件过滤器
    /// * `callback` - 事件回调函数
    ///
    /// # 返回
    ///
    /// 订阅 ID，用于后续取消订阅
    pub async fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        pattern: impl Into<String>,
        filter: Option<EventFilter>,
        callback: EventCallback,
    ) -> String {
        let entry = SubscriptionEntry {
            subscriber_id: subscriber_id.into(),
            pattern: pattern.into(),
            filter,
            callback,
        };
        let subscription_id = uuid::Uuid::new_v4().to_string();

        debug!(
            subscription_id = %subscription_id,
            subscriber_id = %entry.subscriber_id,
            pattern = %entry.pattern,
            "事件订阅成功"
        );

        self.subscriptions
            .write()
            .await
            .insert(subscription_id.clone(), entry);
        subscription_id
    }

    /// 取消订阅
    ///
    /// # 错误
    ///
    /// 订阅不存在时返回 `CoreError::SubscriptionNotFound`
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.subscriptions
            .write()
            .await
            .remove(subscription_id)
            .map(|_| ())
            .ok_or_else(|| CoreError::SubscriptionNotFound(subscription_id.to_string()))
    }

    /// 取消模块的所有订阅，返回取消的数量
    pub async fn unsubscribe_all(&self, subscriber_id: &str) -> usize {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|_, entry| entry.subscriber_id != subscriber_id);
        let removed = before - subscriptions.len();

        if removed > 0 {
            debug!(subscriber_id = %subscriber_id, removed, "已清理模块的全部订阅");
        }
        removed
    }

    /// 发布事件并等待所有匹配的回调完成
    ///
    /// 回调在阻塞线程池中执行，panic 和超时只记录日志，不中断其他回调。
    pub async fn publish(&self, event: Event) -> DispatchSummary {
        let matching: Vec<(String, EventCallback)> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|(_, entry)| entry.matches(&event))
                .map(|(id, entry)| (id.clone(), entry.callback.clone()))
                .collect()
        };

        trace!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            sender = %event.sender,
            subscribers = matching.len(),
            "发布事件"
        );

        let handler_timeout = self.config.handler_timeout;
        let tasks = matching.into_iter().map(|(subscription_id, callback)| {
            let event = event.clone();
            async move {
                let result = Self::invoke_callback(callback, event, handler_timeout).await;
                match &result {
                    DispatchResult::Success => {}
                    DispatchResult::Failed(reason) => {
                        warn!(subscription_id = %subscription_id, error = %reason, "事件处理失败")
                    }
                    DispatchResult::Timeout => {
                        warn!(subscription_id = %subscription_id, "事件处理超时")
                    }
                }
                result
            }
        });
        let results = futures::future::join_all(tasks).await;

        let mut summary = DispatchSummary::default();
        for result in &results {
            match result {
                DispatchResult::Success => summary.delivered += 1,
                DispatchResult::Failed(_) => summary.failed += 1,
                DispatchResult::Timeout => summary.timeouts += 1,
            }
        }

        let mut stats = self.stats.write().await;
        stats.published += 1;
        stats.delivered += summary.delivered as u64;
        stats.failed += summary.failed as u64;
        stats.timeouts += summary.timeouts as u64;
        stats.last_publish_at = Some(Utc::now());

        summary
    }

    async fn invoke_callback(
        callback: EventCallback,
        event: Event,
        handler_timeout: Duration,
    ) -> DispatchResult {
        let task = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || callback(event)))
        });

        match timeout(handler_timeout, task).await {
            Ok(Ok(Ok(()))) => DispatchResult::Success,
            Ok(Ok(Err(_))) => DispatchResult::Failed("回调函数 panic".to_string()),
            Ok(Err(e)) => DispatchResult::Failed(format!("任务执行失败: {}", e)),
            Err(_) => DispatchResult::Timeout,
        }
    }

    /// 当前订阅总数
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// 某个模块持有的订阅 ID
    pub async fn subscriptions_for(&self, subscriber_id: &str) -> Vec<String> {
        self.subscriptions
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.subscriber_id == subscriber_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// 累计分发统计
    pub async fn stats(&self) -> DispatchStats {
        self.stats.read().await.clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// 绑定到单个模块的事件总线句柄
///
/// 订阅者和发送方都固定为该模块，只能取消自己的订阅。
#[derive(Clone)]
pub struct ModuleEventBus {
    bus: EventBus,
    module_id: String,
}

impl ModuleEventBus {
    /// 句柄所属模块
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// 订阅事件
    pub async fn subscribe(&self, pattern: impl Into<String>, callback: EventCallback) -> String {
        self.bus
            .subscribe(self.module_id.clone(), pattern, None, callback)
            .await
    }

    /// 带过滤器订阅事件
    pub async fn subscribe_filtered(
        &self,
        pattern: impl Into<String>,
        filter: EventFilter,
        callback: EventCallback,
    ) -> String {
        self.bus
            .subscribe(self.module_id.clone(), pattern, Some(filter), callback)
            .await
    }

    /// 取消本模块的一个订阅
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let owned = self
            .bus
            .subscriptions
            .read()
            .await
            .get(subscription_id)
            .map_or(false, |entry| entry.subscriber_id == self.module_id);
        if !owned {
            return Err(CoreError::SubscriptionNotFound(subscription_id.to_string()));
        }
        self.bus.unsubscribe(subscription_id).await
    }

    /// 以本模块身份发布事件
    pub async fn publish(&self, event_type: impl Into<String>, data: Value) -> DispatchSummary {
        self.bus
            .publish(Event::new(event_type, self.module_id.clone(), data))
            .await
    }

    /// 本模块当前的订阅数
    pub async fn subscription_count(&self) -> usize {
        self.bus.subscriptions_for(&self.module_id).await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_callback(counter: Arc<AtomicUsize>) -> EventCallback {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("queue.*", "queue.updated"));
        assert!(!matches_pattern("queue.*", "queue"));
        assert!(!matches_pattern("queue.*", "queues.updated"));
        assert!(matches_pattern("queue.updated", "queue.updated"));
        assert!(!matches_pattern("queue.updated", "queue.created"));
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let bus = EventBus::new();
        let id = bus
            .subscribe("chat", "chat.message", None, Arc::new(|_| {}))
            .await;
        assert_eq!(bus.subscription_count().await, 1);

        bus.unsubscribe(&id).await.unwrap();
        assert_eq!(bus.subscription_count().await, 0);
        assert!(matches!(
            bus.unsubscribe(&id).await,
            Err(CoreError::SubscriptionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let bus = EventBus::new();
        bus.subscribe("chat", "a", None, Arc::new(|_| {})).await;
        bus.subscribe("chat", "b", None, Arc::new(|_| {})).await;
        bus.subscribe("queue", "a", None, Arc::new(|_| {})).await;

        assert_eq!(bus.unsubscribe_all("chat").await, 2);
        assert_eq!(bus.subscription_count().await, 1);
        assert!(bus.subscriptions_for("chat").await.is_empty());
        assert_eq!(bus.unsubscribe_all("chat").await, 0);
    }

    #[tokio::test]
    async fn test_publish_delivers_to_matching() {
        let bus = EventBus::new();
        let exact = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));

        bus.subscribe("a", "queue.updated", None, counter_callback(exact.clone()))
            .await;
        bus.subscribe("b", "queue.*", None, counter_callback(wildcard.clone()))
            .await;
        bus.subscribe("c", "chat.*", None, counter_callback(other.clone()))
            .await;

        let summary = bus
            .publish(Event::new("queue.updated", "queue", json!({})))
            .await;

        assert_eq!(summary.delivered, 2);
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        bus.subscribe("bad", "*", None, Arc::new(|_| panic!("订阅者崩溃")))
            .await;
        bus.subscribe("good", "*", None, counter_callback(counter.clone()))
            .await;

        let summary = bus.publish(Event::new("x", "s", json!(null))).await;
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let stats = bus.stats().await;
        assert_eq!(stats.published, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_times_out() {
        let bus = EventBus::with_config(EventBusConfig {
            handler_timeout: Duration::from_millis(20),
        });
        bus.subscribe(
            "slow",
            "*",
            None,
            Arc::new(|_| std::thread::sleep(Duration::from_millis(200))),
        )
        .await;

        let summary = bus.publish(Event::new("x", "s", json!(null))).await;
        assert_eq!(summary.timeouts, 1);
    }

    #[tokio::test]
    async fn test_scoped_bus() {
        let bus = EventBus::new();
        let chat = bus.scoped("chat");
        let queue = bus.scoped("queue");
        let received = Arc::new(AtomicUsize::new(0));

        let r = received.clone();
        let sub = chat
            .subscribe_filtered(
                "queue.*",
                EventFilter::by_sender("queue"),
                Arc::new(move |event| {
                    assert_eq!(event.sender, "queue");
                    r.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        queue.publish("queue.updated", json!({"size": 1})).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(chat.subscription_count().await, 1);

        // 不能取消其他模块的订阅
        assert!(queue.unsubscribe(&sub).await.is_err());
        chat.unsubscribe(&sub).await.unwrap();
        assert_eq!(chat.subscription_count().await, 0);
    }
}
