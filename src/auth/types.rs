// 认证模块数据类型定义

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 开放平台访问令牌
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenInfo {
    /// AccessToken
    pub access_token: String,
    /// 令牌类型（固定为 Bearer）
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// 过期时间（未知时为 None，视为永不过期）
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenInfo {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            expires_at: None,
        }
    }

    /// 根据 expires_in（秒）设置过期时间
    pub fn with_expires_in(mut self, expires_in: i64) -> Self {
        self.expires_at = Some(Utc::now() + Duration::seconds(expires_in));
        self
    }

    /// 令牌是否已过期（预留 60 秒余量）
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() + Duration::seconds(60) >= at,
            None => false,
        }
    }

    /// Authorization 请求头的值
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}
