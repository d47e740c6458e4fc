// 分片传输
//
// 一次调用只处理一个分片：按分片范围读取数据，PUT 到上传地址。
// 分片边界不拆分不合并；不同分片之间没有共享状态，可以并发调用

use crate::error::{Result, UploadError};
use crate::netdisk::PartTransport;
use crate::uploader::chunk::PartDescriptor;
use crate::uploader::proof::RandomAccessSource;
use crate::uploader::retry::RetryPolicy;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// 单次分片传输结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTransferResult {
    pub part_number: u32,
    pub success: bool,
    pub etag: Option<String>,
}

impl ChunkTransferResult {
    pub fn succeeded(part_number: u32, etag: Option<String>) -> Self {
        Self {
            part_number,
            success: true,
            etag,
        }
    }

    pub fn failed(part_number: u32) -> Self {
        Self {
            part_number,
            success: false,
            etag: None,
        }
    }
}

/// 读取分片数据
///
/// 在阻塞线程池中做定位读，不影响其他分片
pub async fn read_part(
    source: Arc<dyn RandomAccessSource>,
    part: PartDescriptor,
) -> Result<Vec<u8>> {
    if part.offset + part.length > source.len() {
        return Err(UploadError::invalid_argument(format!(
            "分片 #{} 范围 {}..{} 超出文件长度 {}",
            part.part_number,
            part.offset,
            part.offset + part.length,
            source.len()
        )));
    }

    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; part.length as usize];
        source.read_at(part.offset, &mut buffer)?;
        Ok(buffer)
    })
    .await
    .map_err(|e| UploadError::Io(std::io::Error::other(e)))?
}

/// 分片传输执行器
#[derive(Clone)]
pub struct ChunkTransferExecutor {
    transport: Arc<dyn PartTransport>,
    policy: RetryPolicy,
}

impl ChunkTransferExecutor {
    pub fn new(transport: Arc<dyn PartTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// 从字节源读取分片并上传
    pub async fn transfer_part(
        &self,
        part: PartDescriptor,
        upload_url: &str,
        source: Arc<dyn RandomAccessSource>,
    ) -> Result<ChunkTransferResult> {
        let data = read_part(source, part).await?;
        self.transfer_bytes(part, upload_url, data).await
    }

    /// 上传已读取的分片数据
    ///
    /// 瞬时错误（网络、限流）按退避策略重试；链接过期返回 UrlExpired，
    /// 由调用方刷新该分片链接后再次调用；其他错误直接返回
    pub async fn transfer_bytes(
        &self,
        part: PartDescriptor,
        upload_url: &str,
        data: Vec<u8>,
    ) -> Result<ChunkTransferResult> {
        if data.len() as u64 != part.length {
            return Err(UploadError::invalid_argument(format!(
                "分片 #{} 数据长度 {} 与计划长度 {} 不一致",
                part.part_number,
                data.len(),
                part.length
            )));
        }

        debug!(
            "[分片#{}] 开始上传 (偏移: {}, 大小: {} bytes)",
            part.part_number, part.offset, part.length
        );

        let mut retry: u32 = 0;
        loop {
            match self
                .transport
                .put_part(part.part_number, upload_url, data.clone())
                .await
            {
                Ok(outcome) => {
                    debug!("[分片#{}] PUT 成功", part.part_number);
                    return Ok(ChunkTransferResult::succeeded(
                        part.part_number,
                        outcome.etag,
                    ));
                }
                Err(e) if e.is_retriable() && retry < self.policy.max_retries => {
                    let delay = self.policy.backoff_delay(retry, &e);
                    warn!(
                        "[分片#{}] 上传失败，等待 {}ms 后重试 ({}/{}): {}",
                        part.part_number,
                        delay.as_millis(),
                        retry + 1,
                        self.policy.max_retries,
                        e
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    retry += 1;
                }
                Err(e) => {
                    if !matches!(e, UploadError::UrlExpired { .. }) {
                        error!("[分片#{}] 上传失败: {}", part.part_number, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}
