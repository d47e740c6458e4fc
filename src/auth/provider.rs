// AccessToken 提供者
//
// 上传流水线不持有全局令牌，每次请求前从 TokenProvider 取当前令牌；
// 遇到 AccessTokenExpired 时调用 refresh，并把失效的令牌传回，
// 多个分片同时过期时只有第一个调用真正触发刷新

use super::types::TokenInfo;
use crate::error::{Result, UploadError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// 当前 AccessToken
    async fn access_token(&self) -> Result<String>;

    /// 刷新令牌
    ///
    /// `expired` 是刚被服务端拒绝的令牌。若当前令牌已经与之不同
    /// （其他调用方刚刚完成刷新），直接返回当前令牌
    async fn refresh(&self, expired: &str) -> Result<String>;
}

/// 刷新回调返回的 future
pub type RefreshFuture = Pin<Box<dyn Future<Output = Result<TokenInfo>> + Send>>;

/// 刷新回调：异步换取新的令牌（通常是一次 refresh_token 请求）
pub type RefreshFn = Box<dyn Fn() -> RefreshFuture + Send + Sync>;

/// 内存令牌提供者
///
/// 令牌由外部（登录流程、配置文件）写入；可选的刷新回调负责换取新令牌
pub struct MemoryTokenProvider {
    token: RwLock<TokenInfo>,
    refresher: Option<RefreshFn>,
    /// 串行化刷新，等待期间不持有 `token` 的锁
    refresh_lock: Mutex<()>,
}

impl MemoryTokenProvider {
    pub fn new(token: TokenInfo) -> Self {
        Self {
            token: RwLock::new(token),
            refresher: None,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_refresher(mut self, refresher: RefreshFn) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// 外部更新令牌
    pub fn set_token(&self, token: TokenInfo) {
        *self.token.write() = token;
    }

    pub fn token(&self) -> TokenInfo {
        self.token.read().clone()
    }
}

#[async_trait]
impl TokenProvider for MemoryTokenProvider {
    async fn access_token(&self) -> Result<String> {
        let token = self.token.read();
        if token.is_expired() {
            warn!("AccessToken 已临近过期");
        }
        Ok(token.access_token.clone())
    }

    async fn refresh(&self, expired: &str) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;

        // 拿到锁后再比较一次，前一个持锁者可能已经换好了令牌
        {
            let token = self.token.read();
            if token.access_token != expired {
                return Ok(token.access_token.clone());
            }
        }

        let refresher = self.refresher.as_ref().ok_or_else(|| UploadError::AuthExpired {
            code: "AccessTokenExpired".to_string(),
            message: "令牌已过期且未配置刷新方式".to_string(),
        })?;

        let fresh = refresher().await?;
        info!("AccessToken 刷新成功");
        let access_token = fresh.access_token.clone();
        *self.token.write() = fresh;
        Ok(access_token)
    }
}
