// 上传相关接口抽象
//
// 每个方法对应一次 HTTP 往返，不做重试；重试与令牌刷新由 uploader::retry 负责。
// DriveClient 是基于 reqwest 的实现，测试中用内存实现替代

use crate::error::Result;
use crate::netdisk::types::{
    CompleteUploadRequest, CreateFileRequest, CreateFileResponse, GetUploadUrlRequest,
    GetUploadUrlResponse, ListUploadedPartsRequest, ListUploadedPartsResponse, UploadedFile,
};
use async_trait::async_trait;

/// 开放平台上传接口
#[async_trait]
pub trait UploadApi: Send + Sync {
    /// 创建文件（上传会话），可能直接秒传成功
    async fn create_file(
        &self,
        access_token: &str,
        req: &CreateFileRequest,
    ) -> Result<CreateFileResponse>;

    /// pre_hash 检测，命中返回 true
    async fn check_pre_hash(&self, access_token: &str, req: &CreateFileRequest) -> Result<bool>;

    /// 获取 / 刷新分片上传地址
    async fn get_upload_url(
        &self,
        access_token: &str,
        req: &GetUploadUrlRequest,
    ) -> Result<GetUploadUrlResponse>;

    /// 列举已上传分片（单页）
    async fn list_uploaded_parts(
        &self,
        access_token: &str,
        req: &ListUploadedPartsRequest,
    ) -> Result<ListUploadedPartsResponse>;

    /// 完成上传
    async fn complete_upload(
        &self,
        access_token: &str,
        req: &CompleteUploadRequest,
    ) -> Result<UploadedFile>;
}

/// 分片 PUT 成功
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutPartOutcome {
    /// 服务端返回的 ETag（分片已存在时没有）
    pub etag: Option<String>,
}

/// 分片数据传输
#[async_trait]
pub trait PartTransport: Send + Sync {
    /// 把一个分片的完整数据 PUT 到上传地址
    ///
    /// 非 2xx 响应按 api_error::classify_part_error 归类
    async fn put_part(
        &self,
        part_number: u32,
        upload_url: &str,
        data: Vec<u8>,
    ) -> Result<PutPartOutcome>;
}
