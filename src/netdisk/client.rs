// 阿里云盘开放平台客户端实现

use crate::config::ApiConfig;
use crate::error::{Result, UploadError};
use crate::netdisk::api::{PartTransport, PutPartOutcome, UploadApi};
use crate::netdisk::api_error::{classify_part_error, parse_open_api_error, CODE_PRE_HASH_MATCHED};
use crate::netdisk::types::{
    CompleteUploadRequest, CreateFileRequest, CreateFileResponse, GetUploadUrlRequest,
    GetUploadUrlResponse, ListUploadedPartsRequest, ListUploadedPartsResponse, UploadedFile,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ETAG};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info};

/// 创建文件 / pre_hash 检测
pub const API_FILE_CREATE: &str = "/adrive/v1.0/openFile/create";
/// 获取分片上传地址
pub const API_GET_UPLOAD_URL: &str = "/adrive/v1.0/openFile/getUploadUrl";
/// 列举已上传分片
pub const API_LIST_UPLOADED_PARTS: &str = "/adrive/v1.0/openFile/listUploadedParts";
/// 完成上传
pub const API_FILE_COMPLETE: &str = "/adrive/v1.0/openFile/complete";

/// 限流等待时间响应头（毫秒）
const HEADER_RETRY_AFTER: &str = "x-retry-after";

/// 阿里云盘开放平台客户端
#[derive(Debug, Clone)]
pub struct DriveClient {
    /// HTTP客户端
    client: Client,
    /// 接口地址（不含结尾 /）
    base_url: String,
}

impl DriveClient {
    /// 创建新的客户端
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| {
                UploadError::invalid_argument(format!("Failed to create HTTP client: {}", e))
            })?;

        info!("初始化开放平台客户端: base_url={}", config.base_url);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 发送 JSON POST，返回状态码、x-retry-after 和响应体
    async fn post_raw<B: Serialize + Sync>(
        &self,
        access_token: &str,
        path: &str,
        body: &B,
    ) -> Result<(u16, Option<String>, String)> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(access_token)
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let retry_after = header_str(response.headers(), HEADER_RETRY_AFTER);
        let text = response.text().await?;

        debug!("接口响应: path={}, status={}, len={}", path, status, text.len());

        Ok((status, retry_after, text))
    }

    /// 发送 JSON POST 并解析成功响应
    async fn post_json<B, T>(&self, access_token: &str, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let (status, retry_after, text) = self.post_raw(access_token, path, body).await?;

        if !(200..300).contains(&status) {
            let info = parse_open_api_error(status, retry_after.as_deref(), &text);
            error!(
                "接口请求失败: path={}, status={}, code={}, message={}",
                path, info.status, info.code, info.message
            );
            return Err(info.into_upload_error());
        }

        serde_json::from_str(&text).map_err(|e| {
            UploadError::InvalidResponse(format!("解析 {} 响应失败: {}", path, e))
        })
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// pre_hash 检测结果判定：命中错误码视为 true，普通成功视为 false
pub fn pre_hash_matched(result: Result<CreateFileResponse>) -> Result<bool> {
    match result {
        Ok(_) => Ok(false),
        Err(UploadError::Api { code, .. }) if code == CODE_PRE_HASH_MATCHED => Ok(true),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl UploadApi for DriveClient {
    async fn create_file(
        &self,
        access_token: &str,
        req: &CreateFileRequest,
    ) -> Result<CreateFileResponse> {
        self.post_json(access_token, API_FILE_CREATE, req).await
    }

    async fn check_pre_hash(&self, access_token: &str, req: &CreateFileRequest) -> Result<bool> {
        let result = self.post_json(access_token, API_FILE_CREATE, req).await;
        pre_hash_matched(result)
    }

    async fn get_upload_url(
        &self,
        access_token: &str,
        req: &GetUploadUrlRequest,
    ) -> Result<GetUploadUrlResponse> {
        self.post_json(access_token, API_GET_UPLOAD_URL, req).await
    }

    async fn list_uploaded_parts(
        &self,
        access_token: &str,
        req: &ListUploadedPartsRequest,
    ) -> Result<ListUploadedPartsResponse> {
        self.post_json(access_token, API_LIST_UPLOADED_PARTS, req)
            .await
    }

    async fn complete_upload(
        &self,
        access_token: &str,
        req: &CompleteUploadRequest,
    ) -> Result<UploadedFile> {
        self.post_json(access_token, API_FILE_COMPLETE, req).await
    }
}

#[async_trait]
impl PartTransport for DriveClient {
    async fn put_part(
        &self,
        part_number: u32,
        upload_url: &str,
        data: Vec<u8>,
    ) -> Result<PutPartOutcome> {
        let size = data.len();

        // Vec<u8> 请求体长度已知，reqwest 会发送 Content-Length 而非分块编码。
        // 上传地址已签名，不能附加 Content-Type
        let response = self
            .client
            .put(upload_url)
            .body(data)
            .send()
            .await?;

        let status = response.status().as_u16();
        let etag = header_str(response.headers(), ETAG.as_str());

        if (200..300).contains(&status) {
            debug!(
                "分片上传响应: part={}, status={}, size={}",
                part_number, status, size
            );
            return Ok(PutPartOutcome { etag });
        }

        let text = response.text().await.unwrap_or_default();
        match classify_part_error(part_number, status, &text) {
            None => {
                info!("分片 #{} 已存在于服务端，按成功处理", part_number);
                Ok(PutPartOutcome { etag: None })
            }
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_url() {
        let config = ApiConfig {
            base_url: "https://openapi.example.com/".to_string(),
            ..ApiConfig::default()
        };
        let client = DriveClient::new(&config).unwrap();
        assert_eq!(
            client.url(API_FILE_CREATE),
            "https://openapi.example.com/adrive/v1.0/openFile/create"
        );
    }

    #[test]
    fn test_pre_hash_matched_mapping() {
        assert!(!pre_hash_matched(Ok(CreateFileResponse::default())).unwrap());
        assert!(pre_hash_matched(Err(UploadError::Api {
            status: 409,
            code: "PreHashMatched".into(),
            message: "Pre hash matched.".into(),
        }))
        .unwrap());
        assert!(pre_hash_matched(Err(UploadError::NetworkTransient("x".into()))).is_err());
    }
}
