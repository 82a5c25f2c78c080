//! 配置服务
//!
//! 以点分键（如 `modules.chat.enabled`）访问的内存配置树，支持：
//!
//! - 类型化读取 `get::<T>`
//! - 写入与删除，并向匹配的监听者推送 [`ConfigChange`]
//! - 从 YAML/JSON 文件或 JSON 值批量装载
//!
//! 注册表只通过 [`ConfigProvider`] 接口消费配置，宿主可以替换为自己的实现。
//!
//! 监听模式：`*` 匹配所有键；`prefix.*` 匹配以 `prefix.` 开头的键，
//! 以及整体替换了 `prefix` 子树的祖先键（如 `prefix` 本身）；
//! 其他模式按键名精确匹配。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::utils::{CoreError, Result};

/// 配置变更通知
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    /// 发生变更的键
    pub key: String,
    /// 旧值（之前不存在为 None）
    pub old_value: Option<Value>,
    /// 新值（被删除为 None）
    pub new_value: Option<Value>,
}

/// 配置变更回调
pub type ConfigWatchCallback = Arc<dyn Fn(&ConfigChange) + Send + Sync>;

/// 配置服务接口
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// 读取键对应的值
    async fn get_value(&self, key: &str) -> Option<Value>;

    /// 监听匹配 `pattern` 的键，返回监听 ID
    async fn watch(&self, pattern: &str, callback: ConfigWatchCallback) -> String;

    /// 取消监听，监听不存在时返回 false
    async fn unwatch(&self, watch_id: &str) -> bool;
}

struct Watcher {
    id: String,
    pattern: String,
    callback: ConfigWatchCallback,
}

/// 配置管理器
pub struct ConfigManager {
    root: RwLock<Value>,
    watchers: RwLock<Vec<Watcher>>,
}

impl ConfigManager {
    /// 创建空配置
    pub fn new() -> Self {
        Self::with_value(Value::Object(Map::new()))
    }

    /// 以给定的配置树创建
    pub fn with_value(root: Value) -> Self {
        Self {
            root: RwLock::new(root),
            watchers: RwLock::new(Vec::new()),
        }
    }

    /// 类型化读取，键不存在或类型不符时返回 None
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key).await?;
        serde_json::from_value(value).ok()
    }

    /// 写入配置并通知监听者
    ///
    /// 中间路径不存在时自动创建；值未变化时不通知。
    ///
    /// # Errors
    ///
    /// 值无法序列化，或路径穿过了非对象节点时返回错误
    pub async fn set<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let new_value = serde_json::to_value(value)?;

        let old_value = {
            let mut root = self.root.write().await;
            Self::slot_mut(&mut root, key)?.replace(new_value.clone())
        };

        if old_value.as_ref() == Some(&new_value) {
            return Ok(());
        }

        debug!(key = %key, "配置已更新");
        self.notify(ConfigChange {
            key: key.to_string(),
            old_value,
            new_value: Some(new_value),
        })
        .await;
        Ok(())
    }

    /// 删除配置项并通知监听者
    pub async fn remove(&self, key: &str) -> Option<Value> {
        let removed = {
            let mut root = self.root.write().await;
            let (parent, last) = match key.rsplit_once('.') {
                Some((parent, last)) => (Self::lookup_mut(&mut root, parent)?, last),
                None => (&mut *root, key),
            };
            parent.as_object_mut()?.remove(last)?
        };

        self.notify(ConfigChange {
            key: key.to_string(),
            old_value: Some(removed.clone()),
            new_value: None,
        })
        .await;
        Some(removed)
    }

    /// 注册监听（闭包形式）
    pub async fn on_change<F>(&self, pattern: &str, callback: F) -> String
    where
        F: Fn(&ConfigChange) + Send + Sync + 'static,
    {
        self.watch(pattern, Arc::new(callback)).await
    }

    /// 把一个 JSON 对象逐叶子写入配置树，每个变化的叶子都会触发通知
    pub async fn load_value(&self, value: Value) -> Result<()> {
        let mut leaves = Vec::new();
        Self::flatten(String::new(), value, &mut leaves);
        for (key, leaf) in leaves {
            if key.is_empty() {
                return Err(CoreError::ConfigLoadFailed(
                    "配置根节点必须是对象".to_string(),
                ));
            }
            self.set(&key, leaf).await?;
        }
        Ok(())
    }

    /// 从 YAML 或 JSON 文件装载配置
    pub async fn load_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let value: Value = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        self.load_value(value).await?;
        info!(path = %path.display(), "配置文件已装载");
        Ok(())
    }

    /// 当前监听数量
    pub async fn watcher_count(&self) -> usize {
        self.watchers.read().await.len()
    }

    // ==================== 内部实现 ====================

    fn lookup<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
        key.split('.').try_fold(root, |node, part| node.get(part))
    }

    fn lookup_mut<'a>(root: &'a mut Value, key: &str) -> Option<&'a mut Value> {
        key.split('.').try_fold(root, |node, part| node.get_mut(part))
    }

    /// 定位到键对应的槽位，沿途创建缺失的对象
    fn slot_mut<'a>(root: &'a mut Value, key: &str) -> Result<Slot<'a>> {
        let mut parts: Vec<&str> = key.split('.').collect();
        let last = parts.pop().filter(|p| !p.is_empty()).ok_or_else(|| {
            CoreError::InvalidConfigValue {
                key: key.to_string(),
                reason: "配置键不能为空".to_string(),
            }
        })?;

        let mut node = root;
        for part in parts {
            let map = node.as_object_mut().ok_or_else(|| CoreError::InvalidConfigValue {
                key: key.to_string(),
                reason: format!("路径节点 '{}' 不是对象", part),
            })?;
            node = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        let map = node.as_object_mut().ok_or_else(|| CoreError::InvalidConfigValue {
            key: key.to_string(),
            reason: "父节点不是对象".to_string(),
        })?;
        Ok(Slot {
            map,
            key: last.to_string(),
        })
    }

    fn flatten(prefix: String, value: Value, out: &mut Vec<(String, Value)>) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (k, v) in map {
                    let key = if prefix.is_empty() {
                        k
                    } else {
                        format!("{}.{}", prefix, k)
                    };
                    Self::flatten(key, v, out);
                }
            }
            other => out.push((prefix, other)),
        }
    }

    fn matches_pattern(pattern: &str, key: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(".*") {
            return Self::is_descendant(key, prefix) || prefix == key || Self::is_descendant(prefix, key);
        }
        pattern == key
    }

    /// `key` 是否位于 `ancestor` 子树之下
    fn is_descendant(key: &str, ancestor: &str) -> bool {
        key.len() > ancestor.len() && key.starts_with(ancestor) && key.as_bytes()[ancestor.len()] == b'.'
    }

    async fn notify(&self, change: ConfigChange) {
        let callbacks: Vec<(String, ConfigWatchCallback)> = {
            let watchers = self.watchers.read().await;
            watchers
                .iter()
                .filter(|w| Self::matches_pattern(&w.pattern, &change.key))
                .map(|w| (w.id.clone(), w.callback.clone()))
                .collect()
        };

        for (watch_id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&change))).is_err() {
                error!(watch_id = %watch_id, key = %change.key, "配置监听回调 panic");
            }
        }
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigProvider for ConfigManager {
    async fn get_value(&self, key: &str) -> Option<Value> {
        let root = self.root.read().await;
        Self::lookup(&root, key).cloned()
    }

    async fn watch(&self, pattern: &str, callback: ConfigWatchCallback) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.watchers.write().await.push(Watcher {
            id: id.clone(),
            pattern: pattern.to_string(),
            callback,
        });
        debug!(watch_id = %id, pattern = %pattern, "注册配置监听");
        id
    }

    async fn unwatch(&self, watch_id: &str) -> bool {
        let mut watchers = self.watchers.write().await;
        let before = watchers.len();
        watchers.retain(|w| w.id != watch_id);
        watchers.len() != before
    }
}

/// 父对象中的一个槽位
struct Slot<'a> {
    map: &'a mut Map<String, Value>,
    key: String,
}

impl Slot<'_> {
    fn replace(self, value: Value) -> Option<Value> {
        self.map.insert(self.key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_set_and_get() {
        let manager = ConfigManager::new();
        manager.set("modules.chat.enabled", true).await.unwrap();
        manager.set("modules.chat.max_history", 50).await.unwrap();

        assert_eq!(manager.get::<bool>("modules.chat.enabled").await, Some(true));
        assert_eq!(manager.get::<u32>("modules.chat.max_history").await, Some(50));
        assert_eq!(
            manager.get_value("modules.chat").await,
            Some(json!({"enabled": true, "max_history": 50}))
        );
        assert_eq!(manager.get::<bool>("modules.missing").await, None);
    }

    #[tokio::test]
    async fn test_set_through_scalar_fails() {
        let manager = ConfigManager::new();
        manager.set("a", 1).await.unwrap();
        assert!(manager.set("a.b", 2).await.is_err());
        assert!(manager.set("", 2).await.is_err());
    }

    #[tokio::test]
    async fn test_watch_pattern_matching() {
        let manager = ConfigManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        manager
            .on_change("modules.*", move |change| {
                s.lock().unwrap().push(change.key.clone());
            })
            .await;

        manager.set("modules.chat.enabled", true).await.unwrap();
        manager.set("other.key", 1).await.unwrap();
        manager.set("modulesx.key", 1).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["modules.chat.enabled".to_string()]);
    }

    #[tokio::test]
    async fn test_ancestor_write_reaches_subtree_watchers() {
        let manager = ConfigManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        manager
            .on_change("app.modules.*", move |change| {
                s.lock().unwrap().push(change.key.clone());
            })
            .await;

        manager.set("app.modules", json!({"chat": {"enabled": false}})).await.unwrap();
        manager.set("app", json!({"modules": {}})).await.unwrap();
        manager.set("app.other", 1).await.unwrap();
        manager.set("ap", 1).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["app.modules".to_string(), "app".to_string()]
        );
    }

    #[tokio::test]
    async fn test_change_carries_old_and_new() {
        let manager = ConfigManager::new();
        let changes = Arc::new(Mutex::new(Vec::new()));

        let c = changes.clone();
        manager
            .on_change("*", move |change| c.lock().unwrap().push(change.clone()))
            .await;

        manager.set("x", 1).await.unwrap();
        manager.set("x", 1).await.unwrap(); // 未变化，不通知
        manager.set("x", 2).await.unwrap();
        manager.remove("x").await;

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[1].old_value, Some(json!(1)));
        assert_eq!(changes[1].new_value, Some(json!(2)));
        assert_eq!(changes[2].new_value, None);
    }

    #[tokio::test]
    async fn test_unwatch() {
        let manager = ConfigManager::new();
        let id = manager.on_change("*", |_| {}).await;
        assert_eq!(manager.watcher_count().await, 1);
        assert!(manager.unwatch(&id).await);
        assert!(!manager.unwatch(&id).await);
        assert_eq!(manager.watcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_panicking_watcher_is_isolated() {
        let manager = ConfigManager::new();
        let hits = Arc::new(Mutex::new(0));

        manager.on_change("*", |_| panic!("坏的监听者")).await;
        let h = hits.clone();
        manager
            .on_change("*", move |_| *h.lock().unwrap() += 1)
            .await;

        manager.set("k", "v").await.unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_load_from_yaml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("modules.yaml");
        tokio::fs::write(
            &path,
            "modules:\n  chat:\n    enabled: true\n  queue:\n    enabled: false\n",
        )
        .await
        .unwrap();

        let manager = ConfigManager::new();
        manager.load_from_file(&path).await.unwrap();

        assert_eq!(manager.get::<bool>("modules.chat.enabled").await, Some(true));
        assert_eq!(manager.get::<bool>("modules.queue.enabled").await, Some(false));
    }
}
