// 上传错误类型
//
// 调用方对每个失败的操作只看到一个带类型的错误；
// 重试由 uploader::retry 在内部完成，对调用方不可见（只体现在耗时上）

use std::time::Duration;
use thiserror::Error;

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 参数错误（调用方 bug，不重试）
    InvalidArgument,
    /// 网络瞬时错误（连接重置、超时、服务端 5xx）
    NetworkTransient,
    /// AccessToken 过期（刷新后重试一次）
    AuthExpired,
    /// 服务端限流
    RateLimited,
    /// 分片上传链接过期（刷新该分片链接后重试）
    UrlExpired,
    /// 空间不足
    QuotaExceeded,
    /// 内容被拒绝
    ContentRejected,
    /// 分片未全部确认就提交
    IncompleteUpload,
    /// 其他服务端业务错误
    Api,
    /// 服务端响应不符合预期
    InvalidResponse,
    /// 本地 I/O 错误
    Io,
    /// 已取消
    Cancelled,
}

impl ErrorKind {
    /// 是否可在内部自动重试
    ///
    /// UrlExpired 不在此列：它需要先刷新链接，由会话控制器的调用方处理
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTransient | ErrorKind::AuthExpired | ErrorKind::RateLimited
        )
    }
}

/// 上传流水线错误
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("参数错误: {0}")]
    InvalidArgument(String),

    #[error("网络错误: {0}")]
    NetworkTransient(String),

    #[error("AccessToken 已过期: {code} - {message}")]
    AuthExpired { code: String, message: String },

    #[error("请求被限流: {message}")]
    RateLimited {
        message: String,
        /// 服务端通过 x-retry-after 指定的等待时间
        retry_after: Option<Duration>,
    },

    #[error("分片 #{part_number} 上传链接已过期")]
    UrlExpired { part_number: u32 },

    #[error("网盘空间不足: {code} - {message}")]
    QuotaExceeded { code: String, message: String },

    #[error("文件内容被拒绝: {code} - {message}")]
    ContentRejected { code: String, message: String },

    #[error("上传未完成，仍有 {} 个分片未确认: {pending:?}", pending.len())]
    IncompleteUpload { pending: Vec<u32> },

    #[error("接口错误: status={status}, code={code}, message={message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("响应异常: {0}")]
    InvalidResponse(String),

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("上传已取消")]
    Cancelled,
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            UploadError::NetworkTransient(_) => ErrorKind::NetworkTransient,
            UploadError::AuthExpired { .. } => ErrorKind::AuthExpired,
            UploadError::RateLimited { .. } => ErrorKind::RateLimited,
            UploadError::UrlExpired { .. } => ErrorKind::UrlExpired,
            UploadError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            UploadError::ContentRejected { .. } => ErrorKind::ContentRejected,
            UploadError::IncompleteUpload { .. } => ErrorKind::IncompleteUpload,
            UploadError::Api { .. } => ErrorKind::Api,
            UploadError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            UploadError::Io(_) => ErrorKind::Io,
            UploadError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        UploadError::InvalidArgument(msg.into())
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            UploadError::NetworkTransient(e.to_string())
        } else if e.is_decode() {
            UploadError::InvalidResponse(e.to_string())
        } else {
            UploadError::NetworkTransient(e.to_string())
        }
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(e: serde_json::Error) -> Self {
        UploadError::InvalidResponse(format!("JSON 解析失败: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, UploadError>;
