//! 事件数据结构

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 事件唯一标识
    pub event_id: String,

    /// 事件类型（格式: category.name，如 system.module.loaded）
    pub event_type: String,

    /// 发送方模块 ID
    pub sender: String,

    /// 事件数据
    #[serde(default)]
    pub data: Value,

    /// 事件时间戳
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// 创建新事件
    pub fn new(event_type: impl Into<String>, sender: impl Into<String>, data: Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            sender: sender.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 发送方过滤
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// 数据字段过滤：顶层字段必须等于给定值
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data_filters: HashMap<String, Value>,
}

impl EventFilter {
    /// 按发送方过滤
    pub fn by_sender(sender: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.into()),
            ..Default::default()
        }
    }

    /// 追加数据字段过滤
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data_filters.insert(key.into(), value);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref sender) = self.sender {
            if sender != &event.sender {
                return false;
            }
        }

        self.data_filters
            .iter()
            .all(|(key, expected)| event.data.get(key) == Some(expected))
    }
}

/// 运行时发布的系统事件类型
pub mod system_events {
    /// 系统事件的发送方
    pub const SENDER: &str = "system";
    /// 模块已注册
    pub const MODULE_REGISTERED: &str = "system.module.registered";
    /// 模块已注销
    pub const MODULE_UNREGISTERED: &str = "system.module.unregistered";
    /// 模块进入运行状态
    pub const MODULE_LOADED: &str = "system.module.loaded";
    /// 模块已卸载
    pub const MODULE_UNLOADED: &str = "system.module.unloaded";
    /// 模块生命周期出错
    pub const MODULE_ERROR: &str = "system.module.error";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_new() {
        let event = Event::new("chat.message", "chat", json!({"text": "hi"}));
        assert_eq!(event.event_type, "chat.message");
        assert_eq!(event.sender, "chat");
        assert!(!event.event_id.is_empty());
    }

    #[test]
    fn test_filter_matches() {
        let event = Event::new("queue.updated", "queue", json!({"queue": "sales", "size": 3}));

        assert!(EventFilter::default().matches(&event));
        assert!(EventFilter::by_sender("queue").matches(&event));
        assert!(!EventFilter::by_sender("chat").matches(&event));
        assert!(EventFilter::by_sender("queue")
            .with_data("queue", json!("sales"))
            .matches(&event));
        assert!(!EventFilter::default()
            .with_data("queue", json!("support"))
            .matches(&event));
        assert!(!EventFilter::default()
            .with_data("missing", json!(1))
            .matches(&event));
    }
}
