//! 重试工具
//!
//! 提供带指数退避的异步重试。第 `n` 次失败（从 0 开始）后等待
//! `base_delay * 2^n`，并受 `max_delay` 限制。不可重试的错误
//! （见 [`CoreError::is_retryable`]）会立即返回。

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::utils::{CoreError, Result};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次尝试之后的最大重试次数
    pub max_retries: u32,
    /// 退避基数
    pub base_delay: Duration,
    /// 单次等待上限
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// 创建重试策略
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// 不重试
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// 计算第 `attempt` 次失败后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// 按策略重试异步操作
///
/// `operation` 接收当前尝试序号（从 0 开始）。
///
/// # Errors
///
/// 返回最后一次失败的错误；不可重试的错误直接返回。
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= policy.max_retries => return Err(err),
            Err(err) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "操作失败，等待后重试"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// 为异步操作加上超时
///
/// 超时会转换为 [`CoreError::Timeout`]，与业务失败区分开。
pub async fn with_timeout<F, T>(duration: Duration, what: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout(format!(
            "{} 超过 {}ms 未完成",
            what,
            duration.as_millis()
        ))),
    }
}
