// 上传引擎
//
// 核心功能：
// 1. 秒传准备（pre_hash 检测、完整哈希、防伪码）
// 2. 协调文件分片上传（支持并发）
// 3. 分片链接过期时单独刷新并重新排队
// 4. 支持断点续传
//
// 并发上传策略：
// - 使用 Semaphore 控制最大并发分片数
// - 使用 JoinSet 管理并发任务
// - 会话只在调度循环中修改，分片任务只拿到链接副本
// - 原子计数器追踪进度

use crate::auth::TokenProvider;
use crate::config::{UploadConfig, MAX_CONCURRENT_PARTS};
use crate::error::{Result, UploadError};
use crate::netdisk::types::UploadedFile;
use crate::netdisk::{PartTransport, UploadApi};
use crate::uploader::chunk::recommended_chunk_size;
use crate::uploader::proof::{calc_proof_code, LocalFileSource, RandomAccessSource};
use crate::uploader::rapid_upload::{RapidUploadChecker, EMPTY_FILE_SHA1};
use crate::uploader::retry::RetryPolicy;
use crate::uploader::session::{UploadRequest, UploadSession, UploadSessionController};
use crate::uploader::transfer::{ChunkTransferExecutor, ChunkTransferResult};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 上传结果
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub file: UploadedFile,
    /// 是否秒传
    pub rapid_upload: bool,
    /// 本次实际传输的分片数
    pub transferred_parts: usize,
}

/// 上传引擎
///
/// 负责协调单个文件的上传过程，包括：
/// - 秒传检查
/// - 分片上传
/// - 链接刷新
/// - 进度跟踪
pub struct UploadEngine {
    controller: UploadSessionController,
    executor: ChunkTransferExecutor,
    config: UploadConfig,
    cancel_token: CancellationToken,
    /// 已上传字节数（本引擎实例累计）
    uploaded_bytes: Arc<AtomicU64>,
}

impl UploadEngine {
    /// 创建上传引擎
    pub fn new(
        api: Arc<dyn UploadApi>,
        transport: Arc<dyn PartTransport>,
        tokens: Arc<dyn TokenProvider>,
        config: UploadConfig,
    ) -> Self {
        let policy = RetryPolicy::from(&config);
        let controller = UploadSessionController::new(api, tokens, policy)
            .with_max_url_refreshes(config.max_url_refreshes);
        let executor = ChunkTransferExecutor::new(transport, policy);

        Self {
            controller,
            executor,
            config,
            cancel_token: CancellationToken::new(),
            uploaded_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn controller(&self) -> &UploadSessionController {
        &self.controller
    }

    /// 已上传字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::SeqCst)
    }

    /// 上传本地文件
    pub async fn upload_file(&self, req: UploadRequest, path: &Path) -> Result<UploadOutcome> {
        let source: Arc<dyn RandomAccessSource> = Arc::new(LocalFileSource::open(path)?);
        self.upload(req, source).await
    }

    /// 完整上传流程：秒传准备 → 创建会话 → 分片上传 → 完成
    pub async fn upload(
        &self,
        req: UploadRequest,
        source: Arc<dyn RandomAccessSource>,
    ) -> Result<UploadOutcome> {
        let mut session = self.start(req, source.clone()).await?;
        self.finish(&mut session, source).await
    }

    /// 秒传准备并创建上传会话
    ///
    /// 调用方持有返回的会话，上传中断后可以交给 resume 继续。
    /// 请求未指定分片大小时，以配置的分片大小为起点按文件大小放大
    pub async fn start(
        &self,
        mut req: UploadRequest,
        source: Arc<dyn RandomAccessSource>,
    ) -> Result<UploadSession> {
        if req.size != source.len() {
            return Err(UploadError::invalid_argument(format!(
                "请求大小 {} 与文件长度 {} 不一致",
                req.size,
                source.len()
            )));
        }
        self.check_cancelled()?;

        if req.chunk_size.is_none() {
            req.chunk_size = Some(recommended_chunk_size(req.size, self.config.chunk_size));
        }

        let req = self.prepare_rapid_upload(req, source).await?;
        self.check_cancelled()?;

        self.controller.create_upload(&req).await
    }

    /// 继续已有会话：先查询服务端已保存的分片，再上传剩余部分
    pub async fn resume(
        &self,
        session: &mut UploadSession,
        source: Arc<dyn RandomAccessSource>,
    ) -> Result<UploadOutcome> {
        if !session.is_rapid_upload() {
            let acknowledged = self.controller.list_uploaded_parts(session).await?;
            info!(
                "断点续传: file_id={}, 服务端已有 {} 个新确认分片, 剩余 {} 个",
                session.file_id,
                acknowledged.len(),
                session.pending_parts().len()
            );
        }
        self.finish(session, source).await
    }

    /// 上传会话中所有未确认分片并完成上传
    pub async fn finish(
        &self,
        session: &mut UploadSession,
        source: Arc<dyn RandomAccessSource>,
    ) -> Result<UploadOutcome> {
        if session.is_rapid_upload() {
            let file = self.controller.complete_upload(session).await?;
            return Ok(UploadOutcome {
                file,
                rapid_upload: true,
                transferred_parts: 0,
            });
        }

        let transferred_parts = self.transfer_pending(session, source).await?;
        self.check_cancelled()?;
        let file = self.controller.complete_upload(session).await?;

        Ok(UploadOutcome {
            file,
            rapid_upload: false,
            transferred_parts,
        })
    }

    /// 填充秒传字段
    ///
    /// pre_hash 未命中时直接返回（不计算完整哈希），按普通上传处理
    async fn prepare_rapid_upload(
        &self,
        req: UploadRequest,
        source: Arc<dyn RandomAccessSource>,
    ) -> Result<UploadRequest> {
        if !self.config.enable_rapid_upload || req.wants_rapid_upload() {
            return Ok(req);
        }

        if req.size == 0 {
            return Ok(req.with_content_hash(EMPTY_FILE_SHA1, ""));
        }

        let mut req = req;
        if self.config.use_pre_hash && req.size > RapidUploadChecker::PRE_HASH_SIZE as u64 {
            let pre_hash = RapidUploadChecker::calculate_source_pre_hash(source.clone()).await?;
            req = req.with_pre_hash(pre_hash);
            if !self.controller.check_pre_hash(&req).await? {
                info!("pre_hash 未命中，跳过秒传: name={}", req.name);
                return Ok(req);
            }
            debug!("pre_hash 命中，计算完整哈希: name={}", req.name);
        }

        let hash = RapidUploadChecker::calculate_source_hash(source.clone()).await?;
        let access_token = self.controller.tokens().access_token().await?;
        let size = req.size;
        // 防伪码要定位读文件，同样放到阻塞线程池
        let proof = tokio::task::spawn_blocking(move || {
            calc_proof_code(&access_token, size, source.as_ref())
        })
        .await
        .map_err(|e| UploadError::Io(std::io::Error::other(e)))??;

        debug!(
            "秒传参数: name={}, content_hash={}, proof_offset={}",
            req.name, hash.content_hash, proof.offset
        );

        Ok(req.with_content_hash(hash.content_hash, proof.code))
    }

    /// 并发上传所有未确认分片，返回实际传输成功的分片数
    ///
    /// 使用 Semaphore 控制并发分片数，JoinSet 管理并发任务
    async fn transfer_pending(
        &self,
        session: &mut UploadSession,
        source: Arc<dyn RandomAccessSource>,
    ) -> Result<usize> {
        let mut queue: VecDeque<u32> = session.pending_parts().into();
        let total = session.parts().part_count();
        if queue.is_empty() {
            return Ok(0);
        }

        let max_concurrent = self.config.max_concurrent_parts.clamp(1, MAX_CONCURRENT_PARTS);
        info!(
            "[并发上传] 开始上传 {} 个分片，并发数: {}",
            queue.len(),
            max_concurrent
        );

        // 信号量控制并发数
        let semaphore = Arc::new(Semaphore::new(max_concurrent));

        // JoinSet 管理并发任务
        let mut join_set: JoinSet<(u32, Result<ChunkTransferResult>)> = JoinSet::new();
        let mut transferred = 0usize;

        loop {
            if self.cancel_token.is_cancelled() {
                join_set.abort_all();
                warn!("[并发上传] 上传已取消");
                return Err(UploadError::Cancelled);
            }

            // 有空闲许可时启动下一个分片
            while let Some(&part_number) = queue.front() {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => break,
                };
                queue.pop_front();

                let descriptor = session.descriptor(part_number).ok_or_else(|| {
                    UploadError::invalid_argument(format!("分片 #{} 不属于该上传会话", part_number))
                })?;
                let url = session
                    .upload_url(part_number)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        UploadError::InvalidResponse(format!("分片 #{} 没有上传链接", part_number))
                    })?;

                let executor = self.executor.clone();
                let source = source.clone();
                join_set.spawn(async move {
                    let result = executor.transfer_part(descriptor, &url, source).await;
                    // 释放信号量
                    drop(permit);
                    (part_number, result)
                });
            }

            let joined = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    join_set.abort_all();
                    warn!("[并发上传] 上传已取消");
                    return Err(UploadError::Cancelled);
                }
                joined = join_set.join_next() => joined,
            };

            // 队列与任务都已清空
            let Some(joined) = joined else {
                break;
            };

            let (part_number, result) = joined.map_err(|e| {
                error!("分片任务异常: {}", e);
                UploadError::Io(std::io::Error::other(e))
            })?;

            match result {
                Ok(result) => {
                    session.record_transfer(&result)?;
                    transferred += 1;

                    let length = session.descriptor(part_number).map_or(0, |d| d.length);
                    self.uploaded_bytes.fetch_add(length, Ordering::SeqCst);

                    info!(
                        "[分片#{}] ✓ 上传成功 ({}/{} 完成)",
                        part_number,
                        session.parts().acknowledged_count(),
                        total
                    );
                }
                Err(UploadError::UrlExpired { .. }) => {
                    let refreshes = session.record_url_refresh(part_number);
                    if refreshes > self.config.max_url_refreshes {
                        join_set.abort_all();
                        error!(
                            "[分片#{}] 上传链接连续过期 {} 次，放弃上传",
                            part_number, refreshes
                        );
                        return Err(UploadError::UrlExpired { part_number });
                    }

                    warn!(
                        "[分片#{}] 上传链接已过期，刷新后重新排队 ({}/{})",
                        part_number, refreshes, self.config.max_url_refreshes
                    );
                    if let Err(e) = self
                        .controller
                        .refresh_upload_urls(session, &[part_number])
                        .await
                    {
                        join_set.abort_all();
                        return Err(e);
                    }
                    queue.push_back(part_number);
                }
                Err(e) => {
                    join_set.abort_all();
                    error!("[分片#{}] 上传失败，终止上传: {}", part_number, e);
                    return Err(e);
                }
            }
        }

        info!("[并发上传] 所有 {} 个分片上传完成", total);
        Ok(transferred)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }
}
