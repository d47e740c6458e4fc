// 服务端错误解析与分类
//
// 开放平台接口的错误体是 JSON，有两种形态：
// - 业务错误: {"code": "...", "message": "..."}
// - 网关错误: {"timestamp": ..., "status": 404, "error": "...", "path": "..."}
// 分片 PUT 直接打到 OSS，错误体是 XML: <Error><Code/><Message/></Error>

use crate::error::UploadError;
use crate::netdisk::types::OpenApiErrorBody;
use regex::Regex;
use std::time::Duration;

/// PreHash 命中时服务端返回的错误码
pub const CODE_PRE_HASH_MATCHED: &str = "PreHashMatched";

/// 分片已存在（重复上传同一分片）
pub const CODE_PART_ALREADY_EXIST: &str = "PartAlreadyExist";

/// 内容被拒绝的错误码
const CONTENT_REJECTED_CODES: &[&str] = &[
    "ForbiddenFileInTheRecycleBin",
    "InvalidParameter.ProofCode",
    "FileSizeExceed",
];

/// 解析后的开放平台错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiErrorInfo {
    pub status: u16,
    pub code: String,
    pub message: String,
    /// x-retry-after 响应头（毫秒）
    pub retry_after: Option<Duration>,
}

impl ApiErrorInfo {
    /// 按状态码和错误码归类为上传错误
    pub fn into_upload_error(self) -> UploadError {
        let ApiErrorInfo {
            status,
            code,
            message,
            retry_after,
        } = self;

        if code == "AccessTokenExpired"
            || code == "AccessTokenInvalid"
            || (status == 401 && code.is_empty())
        {
            return UploadError::AuthExpired { code, message };
        }

        if status == 429 || code == "TooManyRequests" {
            return UploadError::RateLimited {
                message,
                retry_after,
            };
        }

        if code.starts_with("QuotaExhausted") || code.starts_with("ExceedCapacity") {
            return UploadError::QuotaExceeded { code, message };
        }

        if code.starts_with("IllegalFile") || CONTENT_REJECTED_CODES.contains(&code.as_str()) {
            return UploadError::ContentRejected { code, message };
        }

        if status >= 500 {
            return UploadError::NetworkTransient(format!(
                "服务端错误: status={}, code={}, message={}",
                status, code, message
            ));
        }

        UploadError::Api {
            status,
            code,
            message,
        }
    }
}

/// 解析开放平台错误响应
///
/// # 参数
/// * `status` - HTTP 状态码
/// * `retry_after` - x-retry-after 响应头原始值
/// * `body` - 响应体
pub fn parse_open_api_error(status: u16, retry_after: Option<&str>, body: &str) -> ApiErrorInfo {
    let retry_after = retry_after
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis);

    let parsed: OpenApiErrorBody = serde_json::from_str(body).unwrap_or_default();

    let (code, message) = if !parsed.error.is_empty() && parsed.status.unwrap_or(0) != 0 {
        // 网关错误
        (parsed.error.clone(), parsed.error)
    } else if !parsed.code.is_empty() {
        (parsed.code, parsed.message)
    } else if status == 429 {
        ("TooManyRequests".to_string(), "请求太频繁，已被临时限流".to_string())
    } else {
        (String::new(), truncate(body, 200))
    };

    ApiErrorInfo {
        status,
        code,
        message,
        retry_after,
    }
}

/// OSS 错误
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OssErrorInfo {
    pub code: String,
    pub message: String,
}

impl OssErrorInfo {
    pub fn is_part_already_exist(&self) -> bool {
        self.code == CODE_PART_ALREADY_EXIST
    }
}

/// 解析 OSS XML 错误体
pub fn parse_oss_error(body: &str) -> OssErrorInfo {
    OssErrorInfo {
        code: xml_tag(body, "Code").unwrap_or_default(),
        message: xml_tag(body, "Message").unwrap_or_default(),
    }
}

/// 分片 PUT 失败归类
///
/// 返回 None 表示该分片实际上已经存在于服务端（409 PartAlreadyExist），按成功处理
pub fn classify_part_error(part_number: u32, status: u16, body: &str) -> Option<UploadError> {
    let oss = parse_oss_error(body);

    if status == 409 && oss.is_part_already_exist() {
        return None;
    }

    if status == 403 && is_expired_message(&oss) {
        return Some(UploadError::UrlExpired { part_number });
    }

    if status == 429 {
        return Some(UploadError::RateLimited {
            message: oss.message,
            retry_after: None,
        });
    }

    if status >= 500 {
        return Some(UploadError::NetworkTransient(format!(
            "分片 #{} 上传失败: status={}, code={}",
            part_number, status, oss.code
        )));
    }

    Some(UploadError::Api {
        status,
        code: oss.code,
        message: oss.message,
    })
}

fn is_expired_message(oss: &OssErrorInfo) -> bool {
    oss.message.to_lowercase().contains("expired") || oss.code.to_lowercase().contains("expired")
}

fn xml_tag(body: &str, tag: &str) -> Option<String> {
    let re = Regex::new(&format!(r"<{tag}>([\s\S]*?)</{tag}>")).ok()?;
    re.captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
