// 上传会话控制器
//
// 状态流转：
//   Planned → Created → RapidUploaded                        （秒传成功，终态）
//                     → AwaitingParts → PartsUploading → PartsComplete → Finalized
//
// Planned 由 UploadSession::planned 产生，只能查看分片计划；
// Created 只在 create_upload 校验创建响应期间存在
//
// 会话中的分片链接在创建/刷新后只读，只有 refresh_upload_urls 会修改；
// 调用方需要保证刷新某个分片链接时，该分片没有正在进行的传输

use crate::auth::TokenProvider;
use crate::error::{Result, UploadError};
use crate::netdisk::types::{
    CompleteUploadRequest, CreateFileRequest, CreateFileResponse, GetUploadUrlRequest,
    ListUploadedPartsRequest, PartInfoItem, UploadedFile,
};
use crate::netdisk::UploadApi;
use crate::uploader::chunk::{
    plan_parts, recommended_chunk_size, PartDescriptor, PartTracker, DEFAULT_CHUNK_SIZE,
};
use crate::uploader::proof::RandomAccessSource;
use crate::uploader::retry::{run_with_retry, RetryPolicy};
use crate::uploader::transfer::{ChunkTransferExecutor, ChunkTransferResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 根目录 ID
pub const ROOT_FOLDER_ID: &str = "root";

/// 默认内容哈希算法
pub const DEFAULT_CONTENT_HASH_NAME: &str = "sha1";

/// 防伪码协议版本
pub const PROOF_VERSION: &str = "v1";

/// 单次列举已上传分片的最大页数
const MAX_LIST_PAGES: usize = 1000;

/// 同名文件处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckNameMode {
    /// 自动重命名（创建文件默认）
    #[default]
    AutoRename,
    /// 同名不创建（重命名默认）
    Refuse,
    /// 同名文件可创建
    Ignore,
}

impl CheckNameMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckNameMode::AutoRename => "auto_rename",
            CheckNameMode::Refuse => "refuse",
            CheckNameMode::Ignore => "ignore",
        }
    }

    /// 仅重命名操作使用的默认值
    pub fn rename_default() -> Self {
        CheckNameMode::Refuse
    }
}

/// 上传请求
///
/// 由调用方一次性构建，之后不再修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub drive_id: String,
    pub parent_file_id: String,
    pub name: String,
    pub size: u64,
    pub content_hash_name: String,
    /// 为空表示不尝试秒传
    pub content_hash: Option<String>,
    pub proof_code: Option<String>,
    /// 文件前 1KB 的 SHA1
    pub pre_hash: Option<String>,
    /// 为空时按文件大小自动选择，保证分片数不超过 10000
    pub chunk_size: Option<u64>,
    pub check_name_mode: CheckNameMode,
    pub local_created_at: Option<DateTime<Utc>>,
    pub local_modified_at: Option<DateTime<Utc>>,
}

impl UploadRequest {
    pub fn new(drive_id: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            drive_id: drive_id.into(),
            parent_file_id: ROOT_FOLDER_ID.to_string(),
            name: name.into(),
            size,
            content_hash_name: DEFAULT_CONTENT_HASH_NAME.to_string(),
            content_hash: None,
            proof_code: None,
            pre_hash: None,
            chunk_size: None,
            check_name_mode: CheckNameMode::default(),
            local_created_at: None,
            local_modified_at: None,
        }
    }

    pub fn with_parent(mut self, parent_file_id: impl Into<String>) -> Self {
        self.parent_file_id = parent_file_id.into();
        self
    }

    pub fn with_content_hash(
        mut self,
        content_hash: impl Into<String>,
        proof_code: impl Into<String>,
    ) -> Self {
        self.content_hash = Some(content_hash.into());
        self.proof_code = Some(proof_code.into());
        self
    }

    pub fn with_pre_hash(mut self, pre_hash: impl Into<String>) -> Self {
        self.pre_hash = Some(pre_hash.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_check_name_mode(mut self, mode: CheckNameMode) -> Self {
        self.check_name_mode = mode;
        self
    }

    pub fn with_local_times(
        mut self,
        created_at: Option<DateTime<Utc>>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.local_created_at = created_at;
        self.local_modified_at = modified_at;
        self
    }

    /// 是否携带秒传字段
    pub fn wants_rapid_upload(&self) -> bool {
        self.content_hash
            .as_deref()
            .map(|h| !h.is_empty())
            .unwrap_or(false)
    }

    /// 实际使用的分片大小
    ///
    /// 显式指定时原样使用（分片过多由 plan 报错）；否则从默认值起按文件大小放大
    pub fn effective_chunk_size(&self) -> u64 {
        self.chunk_size
            .unwrap_or_else(|| recommended_chunk_size(self.size, DEFAULT_CHUNK_SIZE))
    }

    /// 分片计划（同一请求多次调用结果相同）
    pub fn plan(&self) -> Result<Vec<PartDescriptor>> {
        plan_parts(self.size, self.effective_chunk_size())
    }

    fn base_request(&self, check_name_mode: CheckNameMode) -> CreateFileRequest {
        CreateFileRequest {
            drive_id: self.drive_id.clone(),
            parent_file_id: self.parent_file_id.clone(),
            name: self.name.clone(),
            file_type: "file".to_string(),
            check_name_mode: check_name_mode.as_str().to_string(),
            size: self.size,
            part_info_list: Vec::new(),
            content_hash: None,
            content_hash_name: None,
            proof_code: None,
            proof_version: None,
            pre_hash: None,
            local_created_at: self.local_created_at.map(format_local_time),
            local_modified_at: self.local_modified_at.map(format_local_time),
        }
    }

    fn to_create_request(&self, plan: &[PartDescriptor]) -> CreateFileRequest {
        let mut req = self.base_request(self.check_name_mode);
        req.part_info_list = plan
            .iter()
            .map(|p| PartInfoItem::request(p.part_number))
            .collect();

        if self.wants_rapid_upload() {
            req.content_hash = self.content_hash.clone();
            req.content_hash_name = Some(self.content_hash_name.clone());
            req.proof_code = Some(self.proof_code.clone().unwrap_or_default());
            req.proof_version = Some(PROOF_VERSION.to_string());
        }

        req
    }

    fn to_pre_hash_request(&self, pre_hash: &str) -> CreateFileRequest {
        let mut req = self.base_request(CheckNameMode::Ignore);
        req.pre_hash = Some(pre_hash.to_string());
        req
    }
}

/// 本地时间格式：yyyy-MM-dd'T'HH:mm:ss.SSS'Z'
fn format_local_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 已生成分片计划，尚未提交到服务端
    Planned,
    /// 服务端已返回 file_id，分片链接尚未校验
    Created,
    RapidUploaded,
    AwaitingParts,
    PartsUploading,
    PartsComplete,
    Finalized,
}

impl SessionState {
    /// 是否为成功终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::RapidUploaded | SessionState::Finalized)
    }
}

/// 上传会话
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub drive_id: String,
    pub file_id: String,
    /// 秒传成功时为空
    pub upload_id: String,
    /// 服务端分配的文件名（可能被自动重命名）
    pub file_name: String,
    pub parent_file_id: String,
    pub rapid_upload: bool,
    state: SessionState,
    parts: PartTracker,
    uploaded: Option<UploadedFile>,
}

impl UploadSession {
    /// 按请求生成尚未提交到服务端的会话
    ///
    /// 只用于查看分片计划，分片操作需要经过 create_upload 得到的会话
    pub fn planned(req: &UploadRequest) -> Result<Self> {
        let plan = req.plan()?;
        Ok(Self::from_plan(req, &plan))
    }

    fn from_plan(req: &UploadRequest, plan: &[PartDescriptor]) -> Self {
        Self {
            drive_id: req.drive_id.clone(),
            file_id: String::new(),
            upload_id: String::new(),
            file_name: req.name.clone(),
            parent_file_id: req.parent_file_id.clone(),
            rapid_upload: false,
            state: SessionState::Planned,
            parts: PartTracker::new(plan),
            uploaded: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn parts(&self) -> &PartTracker {
        &self.parts
    }

    pub fn is_rapid_upload(&self) -> bool {
        self.rapid_upload
    }

    pub fn upload_url(&self, part_number: u32) -> Option<&str> {
        self.parts.upload_url(part_number)
    }

    /// 所有分片 → 上传链接
    pub fn upload_urls(&self) -> BTreeMap<u32, String> {
        self.parts.urls()
    }

    pub fn descriptor(&self, part_number: u32) -> Option<PartDescriptor> {
        self.parts.get(part_number).map(|p| p.descriptor)
    }

    /// 尚未确认的分片（升序）
    pub fn pending_parts(&self) -> Vec<u32> {
        self.parts.pending()
    }

    pub fn is_complete(&self) -> bool {
        self.rapid_upload || self.parts.is_complete()
    }

    /// 已完成的文件信息（秒传或 complete 之后）
    pub fn uploaded_file(&self) -> Option<&UploadedFile> {
        self.uploaded.as_ref()
    }

    /// 记录一次分片传输结果
    ///
    /// 失败结果不改变状态，由调用方决定重试
    pub fn record_transfer(&mut self, result: &ChunkTransferResult) -> Result<()> {
        ensure_created(self)?;
        if self.rapid_upload {
            return Err(UploadError::invalid_argument("秒传会话没有需要上传的分片"));
        }
        if !self.parts.contains(result.part_number) {
            return Err(UploadError::invalid_argument(format!(
                "分片 #{} 不属于该上传会话",
                result.part_number
            )));
        }
        if !result.success {
            return Ok(());
        }

        self.parts
            .acknowledge(result.part_number, result.etag.clone());
        self.advance_after_ack();
        Ok(())
    }

    /// 记录分片链接刷新，返回该分片累计刷新次数
    pub fn record_url_refresh(&mut self, part_number: u32) -> u32 {
        self.parts.record_refresh(part_number)
    }

    fn advance_after_ack(&mut self) {
        if matches!(
            self.state,
            SessionState::AwaitingParts | SessionState::PartsUploading
        ) {
            self.state = if self.parts.is_complete() {
                SessionState::PartsComplete
            } else {
                SessionState::PartsUploading
            };
        }
    }

    fn short_upload_id(&self) -> &str {
        &self.upload_id[..8.min(self.upload_id.len())]
    }
}

/// 上传会话控制器
#[derive(Clone)]
pub struct UploadSessionController {
    api: Arc<dyn UploadApi>,
    tokens: Arc<dyn TokenProvider>,
    policy: RetryPolicy,
    max_url_refreshes: u32,
}

impl UploadSessionController {
    pub fn new(
        api: Arc<dyn UploadApi>,
        tokens: Arc<dyn TokenProvider>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            api,
            tokens,
            policy,
            max_url_refreshes: 3,
        }
    }

    pub fn with_max_url_refreshes(mut self, max_url_refreshes: u32) -> Self {
        self.max_url_refreshes = max_url_refreshes;
        self
    }

    pub fn tokens(&self) -> &Arc<dyn TokenProvider> {
        &self.tokens
    }

    /// 创建上传会话
    ///
    /// 秒传成功时会话直接进入 RapidUploaded，否则进入 AwaitingParts，
    /// 且每个计划分片都带有上传链接
    pub async fn create_upload(&self, req: &UploadRequest) -> Result<UploadSession> {
        let plan = req.plan()?;
        let body = req.to_create_request(&plan);

        info!(
            "创建上传会话: name={}, size={}, parts={}, rapid={}",
            req.name,
            req.size,
            plan.len(),
            req.wants_rapid_upload()
        );

        let api = self.api.clone();
        let resp = run_with_retry(&self.policy, self.tokens.as_ref(), "create_file", |token| {
            let api = api.clone();
            let body = body.clone();
            async move { api.create_file(&token, &body).await }
        })
        .await?;

        let session = build_session(req, UploadSession::from_plan(req, &plan), resp)?;
        match session.state {
            SessionState::RapidUploaded => info!(
                "秒传成功: name={}, file_id={}",
                session.file_name, session.file_id
            ),
            _ => info!(
                "上传会话已创建: file_id={}, upload_id={}..., parts={}",
                session.file_id,
                session.short_upload_id(),
                session.parts.part_count()
            ),
        }

        Ok(session)
    }

    /// pre_hash 检测
    ///
    /// 返回 false 说明服务端不存在相同文件，无需计算完整哈希；
    /// 返回 true 只说明可能存在，仍需完整哈希才能秒传
    pub async fn check_pre_hash(&self, req: &UploadRequest) -> Result<bool> {
        let pre_hash = req
            .pre_hash
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| UploadError::invalid_argument("pre_hash 检测需要 pre_hash"))?;
        let body = req.to_pre_hash_request(pre_hash);

        let api = self.api.clone();
        let matched = run_with_retry(&self.policy, self.tokens.as_ref(), "check_pre_hash", |token| {
            let api = api.clone();
            let body = body.clone();
            async move { api.check_pre_hash(&token, &body).await }
        })
        .await?;

        debug!("pre_hash 检测: name={}, matched={}", req.name, matched);
        Ok(matched)
    }

    /// 刷新指定分片的上传链接
    ///
    /// 只请求仍未确认的分片；upload_id 与分片序号保持不变
    pub async fn refresh_upload_urls(
        &self,
        session: &mut UploadSession,
        part_numbers: &[u32],
    ) -> Result<BTreeMap<u32, String>> {
        ensure_uploadable(session)?;

        let mut wanted = BTreeSet::new();
        for &n in part_numbers {
            if !session.parts.contains(n) {
                return Err(UploadError::invalid_argument(format!(
                    "分片 #{} 不属于该上传会话",
                    n
                )));
            }
            if session.parts.is_acknowledged(n) {
                debug!("分片 #{} 已确认，跳过链接刷新", n);
                continue;
            }
            wanted.insert(n);
        }

        if wanted.is_empty() {
            return Ok(BTreeMap::new());
        }

        let body = GetUploadUrlRequest {
            drive_id: session.drive_id.clone(),
            file_id: session.file_id.clone(),
            upload_id: session.upload_id.clone(),
            part_info_list: wanted.iter().map(|n| PartInfoItem::request(*n)).collect(),
        };

        info!(
            "刷新上传链接: upload_id={}..., parts={:?}",
            session.short_upload_id(),
            wanted
        );

        let api = self.api.clone();
        let resp = run_with_retry(&self.policy, self.tokens.as_ref(), "get_upload_url", |token| {
            let api = api.clone();
            let body = body.clone();
            async move { api.get_upload_url(&token, &body).await }
        })
        .await?;

        if !resp.upload_id.is_empty() && resp.upload_id != session.upload_id {
            return Err(UploadError::InvalidResponse(
                "刷新链接返回的 upload_id 与会话不一致".to_string(),
            ));
        }

        let mut refreshed = BTreeMap::new();
        for item in resp.part_info_list {
            if !wanted.contains(&item.part_number) {
                warn!("刷新链接返回了未请求的分片 #{}，忽略", item.part_number);
                continue;
            }
            if let Some(url) = item.upload_url.filter(|u| !u.is_empty()) {
                refreshed.insert(item.part_number, url);
            }
        }

        if let Some(missing) = wanted.iter().find(|n| !refreshed.contains_key(n)) {
            return Err(UploadError::InvalidResponse(format!(
                "刷新链接响应缺少分片 #{}",
                missing
            )));
        }

        for (n, url) in &refreshed {
            session.parts.set_url(*n, url.clone());
        }

        Ok(refreshed)
    }

    /// 上传单个分片，链接过期时刷新该分片链接后重试
    pub async fn upload_part(
        &self,
        session: &mut UploadSession,
        executor: &ChunkTransferExecutor,
        part_number: u32,
        source: Arc<dyn RandomAccessSource>,
    ) -> Result<ChunkTransferResult> {
        ensure_uploadable(session)?;

        let descriptor = session.descriptor(part_number).ok_or_else(|| {
            UploadError::invalid_argument(format!("分片 #{} 不属于该上传会话", part_number))
        })?;

        loop {
            let url = session
                .upload_url(part_number)
                .map(str::to_string)
                .ok_or_else(|| {
                    UploadError::InvalidResponse(format!("分片 #{} 没有上传链接", part_number))
                })?;

            match executor
                .transfer_part(descriptor, &url, source.clone())
                .await
            {
                Ok(result) => {
                    session.record_transfer(&result)?;
                    return Ok(result);
                }
                Err(UploadError::UrlExpired { part_number }) => {
                    let refreshes = session.record_url_refresh(part_number);
                    if refreshes > self.max_url_refreshes {
                        return Err(UploadError::UrlExpired { part_number });
                    }
                    self.refresh_upload_urls(session, &[part_number]).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 查询服务端已保存的分片并在会话中确认，返回新确认的分片序号
    pub async fn list_uploaded_parts(&self, session: &mut UploadSession) -> Result<Vec<u32>> {
        ensure_uploadable(session)?;

        let mut marker = String::new();
        let mut newly_acknowledged = Vec::new();

        for _ in 0..MAX_LIST_PAGES {
            let body = ListUploadedPartsRequest {
                drive_id: session.drive_id.clone(),
                file_id: session.file_id.clone(),
                upload_id: session.upload_id.clone(),
                part_number_marker: marker.clone(),
            };

            let api = self.api.clone();
            let page = run_with_retry(
                &self.policy,
                self.tokens.as_ref(),
                "list_uploaded_parts",
                |token| {
                    let api = api.clone();
                    let body = body.clone();
                    async move { api.list_uploaded_parts(&token, &body).await }
                },
            )
            .await?;

            for part in page.uploaded_parts {
                if !session.parts.contains(part.part_number) {
                    warn!("服务端返回未知分片 #{}，忽略", part.part_number);
                    continue;
                }
                if session.parts.is_acknowledged(part.part_number) {
                    continue;
                }
                let etag = Some(part.etag).filter(|e| !e.is_empty());
                session.parts.acknowledge(part.part_number, etag);
                newly_acknowledged.push(part.part_number);
            }

            if page.next_part_number_marker.is_empty() || page.next_part_number_marker == marker {
                break;
            }
            marker = page.next_part_number_marker;
        }

        if !newly_acknowledged.is_empty() {
            session.advance_after_ack();
        }

        info!(
            "已上传分片: upload_id={}..., 新确认 {} 个, 共 {}/{}",
            session.short_upload_id(),
            newly_acknowledged.len(),
            session.parts.acknowledged_count(),
            session.parts.part_count()
        );

        Ok(newly_acknowledged)
    }

    /// 完成上传
    ///
    /// 秒传会话直接返回已有的文件信息；仍有未确认分片时返回 IncompleteUpload
    pub async fn complete_upload(&self, session: &mut UploadSession) -> Result<UploadedFile> {
        ensure_created(session)?;
        if session.state.is_terminal() {
            if let Some(file) = &session.uploaded {
                return Ok(file.clone());
            }
        }

        let pending = session.parts.pending();
        if !pending.is_empty() {
            return Err(UploadError::IncompleteUpload { pending });
        }

        let body = CompleteUploadRequest {
            drive_id: session.drive_id.clone(),
            file_id: session.file_id.clone(),
            upload_id: session.upload_id.clone(),
        };

        let api = self.api.clone();
        let file = run_with_retry(&self.policy, self.tokens.as_ref(), "complete_upload", |token| {
            let api = api.clone();
            let body = body.clone();
            async move { api.complete_upload(&token, &body).await }
        })
        .await?;

        info!(
            "上传完成: name={}, file_id={}, size={}",
            file.name, file.file_id, file.size
        );

        session.state = SessionState::Finalized;
        session.uploaded = Some(file.clone());
        Ok(file)
    }
}

fn ensure_created(session: &UploadSession) -> Result<()> {
    if matches!(session.state, SessionState::Planned | SessionState::Created) {
        return Err(UploadError::invalid_argument("上传会话尚未在服务端创建"));
    }
    Ok(())
}

fn ensure_uploadable(session: &UploadSession) -> Result<()> {
    ensure_created(session)?;
    if session.rapid_upload {
        return Err(UploadError::invalid_argument("秒传会话没有需要上传的分片"));
    }
    if session.state == SessionState::Finalized {
        return Err(UploadError::invalid_argument("上传会话已完成"));
    }
    Ok(())
}

/// 由创建响应推进 Planned 会话，并校验分片链接与计划一致
fn build_session(
    req: &UploadRequest,
    mut session: UploadSession,
    resp: CreateFileResponse,
) -> Result<UploadSession> {
    if resp.file_id.is_empty() {
        return Err(UploadError::InvalidResponse(
            "创建响应缺少 file_id".to_string(),
        ));
    }

    if !resp.drive_id.is_empty() {
        session.drive_id = resp.drive_id;
    }
    if !resp.parent_file_id.is_empty() {
        session.parent_file_id = resp.parent_file_id;
    }
    if !resp.file_name.is_empty() {
        session.file_name = resp.file_name;
    }
    session.file_id = resp.file_id;
    session.state = SessionState::Created;

    if resp.rapid_upload {
        session.uploaded = Some(UploadedFile {
            drive_id: session.drive_id.clone(),
            parent_file_id: session.parent_file_id.clone(),
            file_id: session.file_id.clone(),
            name: session.file_name.clone(),
            file_type: "file".to_string(),
            size: req.size,
            content_hash: req.content_hash.clone().unwrap_or_default(),
            content_hash_name: req.content_hash_name.clone(),
            ..UploadedFile::default()
        });
        session.rapid_upload = true;
        session.parts = PartTracker::empty();
        session.state = SessionState::RapidUploaded;
        return Ok(session);
    }

    if resp.upload_id.is_empty() {
        return Err(UploadError::InvalidResponse(
            "创建响应既不是秒传也没有 upload_id".to_string(),
        ));
    }
    session.upload_id = resp.upload_id;

    for item in resp.part_info_list {
        let url = item.upload_url.filter(|u| !u.is_empty()).ok_or_else(|| {
            UploadError::InvalidResponse(format!("分片 #{} 缺少上传链接", item.part_number))
        })?;
        if !session.parts.set_url(item.part_number, url) {
            return Err(UploadError::InvalidResponse(format!(
                "创建响应包含计划外的分片 #{}",
                item.part_number
            )));
        }
    }

    if !session.parts.all_urls_present() {
        return Err(UploadError::InvalidResponse(format!(
            "创建响应的分片链接不完整: 计划 {} 个, 收到 {} 个",
            session.parts.part_count(),
            session.parts.urls().len()
        )));
    }

    session.state = SessionState::AwaitingParts;
    Ok(session)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::{MemoryTokenProvider, TokenInfo};
    use crate::error::ErrorKind;
    use crate::netdisk::types::{
        GetUploadUrlResponse, ListUploadedPartsResponse, UploadedPartItem,
    };
    use crate::netdisk::{PartTransport, PutPartOutcome};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// 内存版开放平台
    #[derive(Default)]
    pub(crate) struct FakeApi {
        pub rapid: bool,
        pub pre_hash_matches: bool,
        pub uploaded_parts: Vec<UploadedPartItem>,
        pub page_size: usize,
        pub url_generation: Mutex<u32>,
        pub create_calls: Mutex<Vec<CreateFileRequest>>,
        pub refresh_calls: Mutex<Vec<Vec<u32>>>,
        pub complete_calls: Mutex<u32>,
        pub list_calls: Mutex<u32>,
    }

    impl FakeApi {
        pub(crate) fn url(part_number: u32, generation: u32) -> String {
            format!("https://oss.example/u1/{}?gen={}", part_number, generation)
        }
    }

    #[async_trait]
    impl UploadApi for FakeApi {
        async fn create_file(
            &self,
            _access_token: &str,
            req: &CreateFileRequest,
        ) -> Result<CreateFileResponse> {
            self.create_calls.lock().push(req.clone());
            if self.rapid && req.content_hash.is_some() {
                return Ok(CreateFileResponse {
                    drive_id: req.drive_id.clone(),
                    parent_file_id: req.parent_file_id.clone(),
                    file_id: "f-rapid".into(),
                    file_name: req.name.clone(),
                    rapid_upload: true,
                    ..CreateFileResponse::default()
                });
            }
            Ok(CreateFileResponse {
                drive_id: req.drive_id.clone(),
                parent_file_id: req.parent_file_id.clone(),
                file_id: "f1".into(),
                file_name: req.name.clone(),
                upload_id: "u1-abcdefgh".into(),
                rapid_upload: false,
                part_info_list: req
                    .part_info_list
                    .iter()
                    .map(|p| PartInfoItem {
                        part_number: p.part_number,
                        upload_url: Some(Self::url(p.part_number, 0)),
                        part_size: None,
                    })
                    .collect(),
                ..CreateFileResponse::default()
            })
        }

        async fn check_pre_hash(
            &self,
            _access_token: &str,
            req: &CreateFileRequest,
        ) -> Result<bool> {
            self.create_calls.lock().push(req.clone());
            Ok(self.pre_hash_matches)
        }

        async fn get_upload_url(
            &self,
            _access_token: &str,
            req: &GetUploadUrlRequest,
        ) -> Result<GetUploadUrlResponse> {
            let numbers: Vec<u32> = req.part_info_list.iter().map(|p| p.part_number).collect();
            self.refresh_calls.lock().push(numbers.clone());
            let generation = {
                let mut g = self.url_generation.lock();
                *g += 1;
                *g
            };
            Ok(GetUploadUrlResponse {
                upload_id: req.upload_id.clone(),
                part_info_list: numbers
                    .into_iter()
                    .map(|n| PartInfoItem {
                        part_number: n,
                        upload_url: Some(Self::url(n, generation)),
                        part_size: None,
                    })
                    .collect(),
                ..GetUploadUrlResponse::default()
            })
        }

        async fn list_uploaded_parts(
            &self,
            _access_token: &str,
            req: &ListUploadedPartsRequest,
        ) -> Result<ListUploadedPartsResponse> {
            *self.list_calls.lock() += 1;
            let start: usize = req.part_number_marker.parse().unwrap_or(0);
            let page_size = if self.page_size == 0 {
                usize::MAX
            } else {
                self.page_size
            };
            let page: Vec<UploadedPartItem> = self
                .uploaded_parts
                .iter()
                .skip(start)
                .take(page_size)
                .cloned()
                .collect();
            let next = start + page.len();
            Ok(ListUploadedPartsResponse {
                upload_id: req.upload_id.clone(),
                uploaded_parts: page,
                next_part_number_marker: if next < self.uploaded_parts.len() {
                    next.to_string()
                } else {
                    String::new()
                },
                ..ListUploadedPartsResponse::default()
            })
        }

        async fn complete_upload(
            &self,
            _access_token: &str,
            req: &CompleteUploadRequest,
        ) -> Result<UploadedFile> {
            *self.complete_calls.lock() += 1;
            Ok(UploadedFile {
                drive_id: req.drive_id.clone(),
                file_id: req.file_id.clone(),
                name: "a.bin".into(),
                file_type: "file".into(),
                content_hash: "HASH".into(),
                content_hash_name: "sha1".into(),
                ..UploadedFile::default()
            })
        }
    }

    /// 内存版 OSS：指定的 URL 视为已过期
    #[derive(Default)]
    pub(crate) struct FakeOss {
        pub expired_urls: Mutex<HashSet<String>>,
        pub puts: Mutex<Vec<(u32, String, usize)>>,
    }

    #[async_trait]
    impl PartTransport for FakeOss {
        async fn put_part(
            &self,
            part_number: u32,
            upload_url: &str,
            data: Vec<u8>,
        ) -> Result<PutPartOutcome> {
            self.puts
                .lock()
                .push((part_number, upload_url.to_string(), data.len()));
            if self.expired_urls.lock().contains(upload_url) {
                return Err(UploadError::UrlExpired { part_number });
            }
            Ok(PutPartOutcome {
                etag: Some(format!("\"E{}\"", part_number)),
            })
        }
    }

    pub(crate) fn tokens() -> Arc<dyn TokenProvider> {
        Arc::new(MemoryTokenProvider::new(TokenInfo::new("test_access_token")))
    }

    fn controller(api: Arc<FakeApi>) -> UploadSessionController {
        UploadSessionController::new(api, tokens(), RetryPolicy::immediate(3))
    }

    fn data(len: usize) -> Arc<dyn RandomAccessSource> {
        Arc::new((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_request_defaults() {
        let req = UploadRequest::new("d1", "a.bin", 10);
        assert_eq!(req.parent_file_id, "root");
        assert_eq!(req.content_hash_name, "sha1");
        assert_eq!(req.chunk_size, None);
        assert_eq!(req.effective_chunk_size(), 524288);
        assert_eq!(req.check_name_mode, CheckNameMode::AutoRename);
        assert_eq!(CheckNameMode::rename_default(), CheckNameMode::Refuse);
        assert!(!req.wants_rapid_upload());
    }

    #[test]
    fn test_create_request_without_hash_omits_rapid_fields() {
        let req = UploadRequest::new("d1", "a.bin", 10).with_content_hash("", "");
        let body = req.to_create_request(&req.plan().unwrap());
        assert!(body.content_hash.is_none());
        assert!(body.proof_code.is_none());
        assert!(body.proof_version.is_none());
        assert_eq!(body.check_name_mode, "auto_rename");
    }

    #[test]
    fn test_create_request_with_hash() {
        let created = DateTime::parse_from_rfc3339("2024-01-02T03:04:05.678Z")
            .unwrap()
            .with_timezone(&Utc);
        let req = UploadRequest::new("d1", "a.bin", 10)
            .with_parent("folder1")
            .with_content_hash("ABC", "cHJvb2Y=")
            .with_local_times(Some(created), None);
        let body = req.to_create_request(&req.plan().unwrap());

        assert_eq!(body.parent_file_id, "folder1");
        assert_eq!(body.content_hash.as_deref(), Some("ABC"));
        assert_eq!(body.content_hash_name.as_deref(), Some("sha1"));
        assert_eq!(body.proof_code.as_deref(), Some("cHJvb2Y="));
        assert_eq!(body.proof_version.as_deref(), Some("v1"));
        assert_eq!(
            body.local_created_at.as_deref(),
            Some("2024-01-02T03:04:05.678Z")
        );
        assert!(body.local_modified_at.is_none());
    }

    #[tokio::test]
    async fn test_rapid_upload_session() {
        let api = Arc::new(FakeApi {
            rapid: true,
            ..FakeApi::default()
        });
        let controller = controller(api.clone());

        let req = UploadRequest::new("d1", "a.bin", 1_048_576).with_content_hash("HASH", "PROOF");
        let mut session = controller.create_upload(&req).await.unwrap();

        assert_eq!(session.state(), SessionState::RapidUploaded);
        assert!(session.is_rapid_upload());
        assert!(session.upload_id.is_empty());
        assert!(session.pending_parts().is_empty());

        let file = controller.complete_upload(&mut session).await.unwrap();
        assert_eq!(file.file_id, "f-rapid");
        assert_eq!(file.content_hash, "HASH");
        // 秒传会话的 complete 不访问服务端
        assert_eq!(*api.complete_calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_create_session_has_all_urls() {
        let api = Arc::new(FakeApi::default());
        let controller = controller(api.clone());

        let req = UploadRequest::new("d1", "a.bin", 1_048_576);
        let session = controller.create_upload(&req).await.unwrap();

        assert_eq!(session.state(), SessionState::AwaitingParts);
        assert_eq!(session.upload_id, "u1-abcdefgh");
        assert_eq!(session.upload_urls().len(), 2);
        assert_eq!(session.pending_parts(), vec![1, 2]);
        // 请求中只有分片序号
        let calls = api.create_calls.lock();
        let create = &calls[0];
        assert_eq!(create.part_info_list.len(), 2);
        assert!(create.part_info_list[0].upload_url.is_none());
        assert!(create.content_hash.is_none());
    }

    #[tokio::test]
    async fn test_planned_session_rejects_part_operations() {
        let api = Arc::new(FakeApi::default());
        let controller = controller(api.clone());

        let req = UploadRequest::new("d1", "a.bin", 3000).with_chunk_size(1024);
        let mut session = UploadSession::planned(&req).unwrap();
        assert_eq!(session.state(), SessionState::Planned);
        assert_eq!(session.pending_parts(), vec![1, 2, 3]);
        assert!(session.upload_urls().is_empty());
        assert!(session.file_id.is_empty());

        let err = controller
            .refresh_upload_urls(&mut session, &[1])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = controller.complete_upload(&mut session).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = session
            .record_transfer(&ChunkTransferResult::succeeded(1, None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(session.pending_parts(), vec![1, 2, 3]);

        // 没有发出任何请求
        assert!(api.create_calls.lock().is_empty());
        assert!(api.refresh_calls.lock().is_empty());
        assert_eq!(*api.complete_calls.lock(), 0);
    }

    #[test]
    fn test_default_chunk_size_scales_with_file_size() {
        // 6GB 按 512KB 切分会超过 10000 片
        let size = 6 * 1024 * 1024 * 1024;
        let req = UploadRequest::new("d1", "big.bin", size);
        assert_eq!(req.effective_chunk_size(), 1024 * 1024);
        let plan = req.plan().unwrap();
        assert_eq!(plan.len(), 6144);
        assert_eq!(plan.iter().map(|p| p.length).sum::<u64>(), size);

        // 显式指定的分片大小不做调整
        let err = req.clone().with_chunk_size(DEFAULT_CHUNK_SIZE).plan().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_complete_before_parts_acknowledged() {
        let api = Arc::new(FakeApi::default());
        let controller = controller(api.clone());

        let req = UploadRequest::new("d1", "a.bin", 1_048_576);
        let mut session = controller.create_upload(&req).await.unwrap();
        session
            .record_transfer(&ChunkTransferResult::succeeded(1, None))
            .unwrap();
        assert_eq!(session.state(), SessionState::PartsUploading);

        let err = controller.complete_upload(&mut session).await.unwrap_err();
        match err {
            UploadError::IncompleteUpload { pending } => assert_eq!(pending, vec![2]),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(*api.complete_calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_failed_result_does_not_acknowledge() {
        let api = Arc::new(FakeApi::default());
        let controller = controller(api);

        let req = UploadRequest::new("d1", "a.bin", 100);
        let mut session = controller.create_upload(&req).await.unwrap();
        session
            .record_transfer(&ChunkTransferResult::failed(1))
            .unwrap();
        assert_eq!(session.pending_parts(), vec![1]);

        let err = session
            .record_transfer(&ChunkTransferResult::succeeded(9, None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_expired_url_refreshes_only_that_part() {
        let api = Arc::new(FakeApi::default());
        let oss = Arc::new(FakeOss::default());
        let controller = controller(api.clone());
        let executor = ChunkTransferExecutor::new(oss.clone(), RetryPolicy::immediate(3));

        let size = 3 * 1024;
        let req = UploadRequest::new("d1", "a.bin", size as u64).with_chunk_size(1024);
        let mut session = controller.create_upload(&req).await.unwrap();
        let source = data(size);

        // 第 2 个分片的链接已过期
        oss.expired_urls.lock().insert(FakeApi::url(2, 0));

        for n in [1, 2, 3] {
            let result = controller
                .upload_part(&mut session, &executor, n, source.clone())
                .await
                .unwrap();
            assert!(result.success);
        }

        assert_eq!(*api.refresh_calls.lock(), vec![vec![2]]);
        assert_eq!(session.upload_url(2), Some(FakeApi::url(2, 1).as_str()));
        assert_eq!(session.state(), SessionState::PartsComplete);

        let file = controller.complete_upload(&mut session).await.unwrap();
        assert_eq!(file.file_id, "f1");
        assert_eq!(session.state(), SessionState::Finalized);

        // 分片 1、3 各上传一次，分片 2 上传两次（过期一次）
        let puts = oss.puts.lock();
        assert_eq!(puts.iter().filter(|p| p.0 == 1).count(), 1);
        assert_eq!(puts.iter().filter(|p| p.0 == 2).count(), 2);
        assert_eq!(puts.iter().filter(|p| p.0 == 3).count(), 1);
        assert!(puts.iter().all(|p| p.2 == 1024));
    }

    #[tokio::test]
    async fn test_url_refresh_bounded() {
        let api = Arc::new(FakeApi::default());
        let oss = Arc::new(FakeOss::default());
        let controller = controller(api.clone()).with_max_url_refreshes(2);
        let executor = ChunkTransferExecutor::new(oss.clone(), RetryPolicy::immediate(3));

        let req = UploadRequest::new("d1", "a.bin", 10);
        let mut session = controller.create_upload(&req).await.unwrap();
        {
            let mut expired = oss.expired_urls.lock();
            for generation in 0..10 {
                expired.insert(FakeApi::url(1, generation));
            }
        }

        let err = controller
            .upload_part(&mut session, &executor, 1, data(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UrlExpired);
        assert_eq!(api.refresh_calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_rejects_unknown_and_skips_acknowledged() {
        let api = Arc::new(FakeApi::default());
        let controller = controller(api.clone());

        let req = UploadRequest::new("d1", "a.bin", 3000).with_chunk_size(1024);
        let mut session = controller.create_upload(&req).await.unwrap();
        let upload_id = session.upload_id.clone();

        let err = controller
            .refresh_upload_urls(&mut session, &[4])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        session
            .record_transfer(&ChunkTransferResult::succeeded(1, None))
            .unwrap();
        let refreshed = controller
            .refresh_upload_urls(&mut session, &[1, 3])
            .await
            .unwrap();

        assert_eq!(refreshed.keys().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(*api.refresh_calls.lock(), vec![vec![3]]);
        assert_eq!(session.upload_id, upload_id);
        assert_eq!(session.parts().part_count(), 3);
    }

    #[tokio::test]
    async fn test_check_pre_hash() {
        let api = Arc::new(FakeApi {
            pre_hash_matches: true,
            ..FakeApi::default()
        });
        let controller = controller(api.clone());

        let req = UploadRequest::new("d1", "a.bin", 4096);
        let err = controller.check_pre_hash(&req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let req = req.with_pre_hash("PREHASH");
        assert!(controller.check_pre_hash(&req).await.unwrap());

        let calls = api.create_calls.lock();
        let sent = &calls[0];
        assert_eq!(sent.pre_hash.as_deref(), Some("PREHASH"));
        assert_eq!(sent.check_name_mode, "ignore");
        assert!(sent.part_info_list.is_empty());
    }

    #[tokio::test]
    async fn test_list_uploaded_parts_paged() {
        let api = Arc::new(FakeApi {
            uploaded_parts: (1..=3)
                .map(|n| UploadedPartItem {
                    etag: format!("\"E{}\"", n),
                    part_number: n,
                    part_size: 1024,
                })
                .collect(),
            page_size: 2,
            ..FakeApi::default()
        });
        let controller = controller(api.clone());

        let req = UploadRequest::new("d1", "a.bin", 5 * 1024).with_chunk_size(1024);
        let mut session = controller.create_upload(&req).await.unwrap();

        let acknowledged = controller.list_uploaded_parts(&mut session).await.unwrap();
        assert_eq!(acknowledged, vec![1, 2, 3]);
        assert_eq!(*api.list_calls.lock(), 2);
        assert_eq!(session.pending_parts(), vec![4, 5]);
        assert_eq!(session.state(), SessionState::PartsUploading);
        assert_eq!(
            session.parts().get(2).and_then(|p| p.etag.clone()),
            Some("\"E2\"".to_string())
        );
    }

    #[tokio::test]
    async fn test_rapid_session_rejects_part_operations() {
        let api = Arc::new(FakeApi {
            rapid: true,
            ..FakeApi::default()
        });
        let controller = controller(api);

        let req = UploadRequest::new("d1", "a.bin", 10).with_content_hash("HASH", "PROOF");
        let mut session = controller.create_upload(&req).await.unwrap();

        let err = controller
            .refresh_upload_urls(&mut session, &[1])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
