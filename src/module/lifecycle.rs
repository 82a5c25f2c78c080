//! 生命周期钩子调用
//!
//! 所有钩子都经由 [`LifecycleDriver`] 调用：返回的错误和 panic 都在调用点
//! 被捕获，转换为 `CoreError::HookFailed`，并把模块状态强制设为 `ERROR`。

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error};

use crate::module::context::ModuleContext;
use crate::module::contract::Module;
use crate::module::metadata::ModuleStatus;
use crate::utils::{CoreError, Result};

/// 生命周期钩子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// on_initialize
    Initialize,
    /// on_start
    Start,
    /// on_stop
    Stop,
    /// on_destroy
    Destroy,
    /// on_config_change
    ConfigChange,
    /// on_dependency_change
    DependencyChange,
}

impl Hook {
    /// 钩子名称
    pub fn name(&self) -> &'static str {
        match self {
            Hook::Initialize => "on_initialize",
            Hook::Start => "on_start",
            Hook::Stop => "on_stop",
            Hook::Destroy => "on_destroy",
            Hook::ConfigChange => "on_config_change",
            Hook::DependencyChange => "on_dependency_change",
        }
    }
}

/// 生命周期钩子调用器
pub struct LifecycleDriver;

impl LifecycleDriver {
    /// 调用 on_initialize
    pub async fn initialize(module: &dyn Module, ctx: &ModuleContext) -> Result<()> {
        Self::guard(module, Hook::Initialize, module.on_initialize(ctx)).await
    }

    /// 调用 on_start
    pub async fn start(module: &dyn Module, ctx: &ModuleContext) -> Result<()> {
        Self::guard(module, Hook::Start, module.on_start(ctx)).await
    }

    /// 调用 on_stop
    pub async fn stop(module: &dyn Module, ctx: &ModuleContext) -> Result<()> {
        Self::guard(module, Hook::Stop, module.on_stop(ctx)).await
    }

    /// 调用 on_destroy
    pub async fn destroy(module: &dyn Module, ctx: &ModuleContext) -> Result<()> {
        Self::guard(module, Hook::Destroy, module.on_destroy(ctx)).await
    }

    /// 调用 on_config_change
    pub async fn config_change(
        module: &dyn Module,
        new_config: &Value,
        old_config: &Value,
        ctx: &ModuleContext,
    ) -> Result<()> {
        Self::guard(
            module,
            Hook::ConfigChange,
            module.on_config_change(new_config, old_config, ctx),
        )
        .await
    }

    /// 调用 on_dependency_change
    pub async fn dependency_change(
        module: &dyn Module,
        dependency_id: &str,
        dependency_status: ModuleStatus,
        ctx: &ModuleContext,
    ) -> Result<()> {
        Self::guard(
            module,
            Hook::DependencyChange,
            module.on_dependency_change(dependency_id, dependency_status, ctx),
        )
        .await
    }

    async fn guard<F>(module: &dyn Module, hook: Hook, future: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        debug!(module_id = %module.id(), hook = hook.name(), "调用生命周期钩子");

        let reason = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err.to_string(),
            Err(panic) => format!("钩子 panic: {}", panic_message(panic.as_ref())),
        };

        module.set_status(ModuleStatus::Error);
        error!(
            module_id = %module.id(),
            hook = hook.name(),
            error = %reason,
            "生命周期钩子失败，模块进入 ERROR 状态"
        );
        Err(CoreError::HookFailed {
            module_id: module.id().to_string(),
            hook: hook.name().to_string(),
            reason,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::module::context::ServiceRegistry;
    use crate::module::contract::ModuleBase;
    use crate::module::metadata::ModuleMetadata;
    use crate::utils::ErrorKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct FaultyModule {
        base: ModuleBase,
    }

    #[async_trait]
    impl Module for FaultyModule {
        fn base(&self) -> &ModuleBase {
            &self.base
        }

        async fn on_start(&self, _ctx: &ModuleContext) -> Result<()> {
            Err(anyhow::anyhow!("端口被占用").into())
        }

        async fn on_stop(&self, _ctx: &ModuleContext) -> Result<()> {
            panic!("停止时崩溃");
        }
    }

    fn setup() -> (FaultyModule, ModuleContext) {
        let module = FaultyModule {
            base: ModuleBase::new(ModuleMetadata::new("faulty", "Faulty", "1.0.0")),
        };
        let ctx = ModuleContext::new(
            "faulty",
            json!({}),
            Arc::new(ServiceRegistry::new()),
            &EventBus::new(),
        );
        (module, ctx)
    }

    #[tokio::test]
    async fn test_successful_hook() {
        let (module, ctx) = setup();
        LifecycleDriver::initialize(&module, &ctx).await.unwrap();
        assert_eq!(module.status(), ModuleStatus::Loaded);
    }

    #[tokio::test]
    async fn test_failed_hook_forces_error() {
        let (module, ctx) = setup();
        LifecycleDriver::initialize(&module, &ctx).await.unwrap();

        let err = LifecycleDriver::start(&module, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HookFailure);
        assert!(err.to_string().contains("端口被占用"));
        assert_eq!(module.status(), ModuleStatus::Error);
    }

    #[tokio::test]
    async fn test_panicking_hook_is_caught() {
        let (module, ctx) = setup();
        let err = LifecycleDriver::stop(&module, &ctx).await.unwrap_err();
        match err {
            CoreError::HookFailed { hook, reason, .. } => {
                assert_eq!(hook, "on_stop");
                assert!(reason.contains("停止时崩溃"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(module.status(), ModuleStatus::Error);
    }
}
