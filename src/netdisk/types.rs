// 网盘开放平台 API 数据类型
//
// 字段名与开放平台文档一一对应；请求中未设置的可选字段不序列化

use serde::{Deserialize, Serialize};

/// 分片信息（请求只带 part_number，响应附带 upload_url）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartInfoItem {
    /// 分片序号，从 1 开始
    pub part_number: u32,

    /// 分片上传地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,

    /// 分片大小
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
}

impl PartInfoItem {
    pub fn request(part_number: u32) -> Self {
        Self {
            part_number,
            upload_url: None,
            part_size: None,
        }
    }
}

/// 已上传分片
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UploadedPartItem {
    #[serde(default)]
    pub etag: String,
    pub part_number: u32,
    #[serde(default)]
    pub part_size: u64,
}

/// 创建文件 / 上传会话请求
#[derive(Debug, Clone, Serialize)]
pub struct CreateFileRequest {
    pub drive_id: String,
    pub parent_file_id: String,
    pub name: String,
    /// file | folder
    #[serde(rename = "type")]
    pub file_type: String,
    /// auto_rename | refuse | ignore
    pub check_name_mode: String,
    pub size: u64,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub part_info_list: Vec<PartInfoItem>,

    /// 秒传字段：content_hash 为空时全部省略
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_version: Option<String>,

    /// pre_hash 检测时使用
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_hash: Option<String>,

    /// 格式 yyyy-MM-dd'T'HH:mm:ss.SSS'Z'
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_modified_at: Option<String>,
}

/// 创建文件响应
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateFileResponse {
    #[serde(default)]
    pub drive_id: String,
    #[serde(default)]
    pub parent_file_id: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub status: String,
    /// 秒传成功时为空
    #[serde(default)]
    pub upload_id: String,
    #[serde(default)]
    pub available: bool,
    /// 是否存在同名文件
    #[serde(default)]
    pub exist: bool,
    /// 是否秒传成功
    #[serde(default)]
    pub rapid_upload: bool,
    #[serde(default)]
    pub part_info_list: Vec<PartInfoItem>,
}

/// 获取 / 刷新分片上传地址请求
#[derive(Debug, Clone, Serialize)]
pub struct GetUploadUrlRequest {
    pub drive_id: String,
    pub file_id: String,
    pub upload_id: String,
    pub part_info_list: Vec<PartInfoItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetUploadUrlResponse {
    #[serde(default)]
    pub drive_id: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub upload_id: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub part_info_list: Vec<PartInfoItem>,
}

/// 列举已上传分片请求
#[derive(Debug, Clone, Serialize)]
pub struct ListUploadedPartsRequest {
    pub drive_id: String,
    pub file_id: String,
    pub upload_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub part_number_marker: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListUploadedPartsResponse {
    #[serde(default)]
    pub drive_id: String,
    #[serde(default)]
    pub upload_id: String,
    #[serde(default, rename = "parallelUpload")]
    pub parallel_upload: bool,
    #[serde(default)]
    pub uploaded_parts: Vec<UploadedPartItem>,
    /// 最后一页为空
    #[serde(default)]
    pub next_part_number_marker: String,
}

/// 完成上传请求
#[derive(Debug, Clone, Serialize)]
pub struct CompleteUploadRequest {
    pub drive_id: String,
    pub file_id: String,
    pub upload_id: String,
}

/// 上传完成后的文件信息
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedFile {
    #[serde(default)]
    pub drive_id: String,
    #[serde(default)]
    pub parent_file_id: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub file_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub file_extension: String,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub content_hash_name: String,
    #[serde(default)]
    pub local_created_at: String,
    #[serde(default)]
    pub local_modified_at: String,
}

/// 开放平台通用错误体
///
/// 业务错误为 `{code, message}`；网关错误为 `{timestamp, status, error, path}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenApiErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub path: String,
}
