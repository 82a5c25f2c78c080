//! 事件系统
//!
//! 模块间松耦合通知所用的事件结构与事件总线。

#[allow(clippy::module_inception)]
pub mod event;
pub mod event_bus;

pub use event::{system_events, Event, EventFilter};
pub use event_bus::{
    DispatchStats, DispatchSummary, EventBus, EventBusConfig, EventCallback, ModuleEventBus,
};
