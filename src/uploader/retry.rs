// 错误重试
//
// 对调用方只暴露一个带类型的错误，内部按错误类型决定是否重试：
// - NetworkTransient: 指数退避重试
// - RateLimited: 优先使用服务端给出的等待时间
// - AuthExpired: 刷新令牌后立即重试一次
// - 其他: 直接返回

use crate::auth::TokenProvider;
use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 初始退避延迟（毫秒）
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
pub const MAX_BACKOFF_MS: u64 = 5000;

/// 服务端指定等待时间之外的额外等待（毫秒）
const RATE_LIMIT_EXTRA_MS: u64 = 1000;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次失败后的最大重试次数
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl From<&UploadConfig> for RetryPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

impl RetryPolicy {
    /// 不等待的策略（测试用）
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// 计算第 `retry_count` 次重试前的等待时间
    ///
    /// # 延迟序列（默认配置）
    /// - retry_count=0: 100ms
    /// - retry_count=1: 200ms
    /// - retry_count=2: 400ms
    /// - 最大: 5000ms
    ///
    /// 限流时使用服务端的 x-retry-after + 1s，没有时按 2s、4s、6s 递增
    pub fn backoff_delay(&self, retry_count: u32, error: &UploadError) -> Duration {
        if let UploadError::RateLimited { retry_after, .. } = error {
            return match retry_after {
                Some(delay) => *delay + Duration::from_millis(RATE_LIMIT_EXTRA_MS),
                None => Duration::from_secs(2 * (retry_count as u64 + 1)),
            };
        }

        let base_delay = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(retry_count));
        Duration::from_millis(base_delay.min(self.max_backoff_ms))
    }
}

/// 带重试执行一次接口调用
///
/// `op` 接收当前 AccessToken，每次尝试都会重新调用。
/// AuthExpired 只触发一次令牌刷新，刷新后再次过期则直接返回错误
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    tokens: &dyn TokenProvider,
    op_name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut token = tokens.access_token().await?;
    let mut refreshed = false;
    let mut retry: u32 = 0;

    loop {
        let err = match op(token.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        match err {
            UploadError::AuthExpired { .. } if !refreshed => {
                warn!("[{}] AccessToken 过期，刷新后重试", op_name);
                token = tokens.refresh(&token).await?;
                refreshed = true;
            }
            e @ UploadError::AuthExpired { .. } => return Err(e),
            e if e.is_retriable() && retry < policy.max_retries => {
                let delay = policy.backoff_delay(retry, &e);
                warn!(
                    "[{}] 请求失败，等待 {}ms 后重试 ({}/{}): {}",
                    op_name,
                    delay.as_millis(),
                    retry + 1,
                    policy.max_retries,
                    e
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                retry += 1;
            }
            e => {
                debug!("[{}] 请求失败，不再重试: {}", op_name, e);
                return Err(e);
            }
        }
    }
}
