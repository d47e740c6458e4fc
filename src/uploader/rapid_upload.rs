// 秒传哈希计算
//
// 阿里云盘秒传原理：
// 1. 先计算文件前 1KB 的 SHA1 (pre_hash)，向服务端探测是否可能存在相同文件
// 2. 若 pre_hash 命中，再计算完整 SHA1 (content_hash) 与防伪码 (proof_code)
// 3. 创建上传会话时携带这些值，服务端已有相同文件则直接完成（秒传成功）
//
// pre_hash 未命中时无需计算完整 SHA1，大文件可以省掉一次全量读取

use crate::error::{Result, UploadError};
use crate::uploader::proof::{LocalFileSource, RandomAccessSource};
use sha1::{Digest, Sha1};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// 空文件的 SHA1
pub const EMPTY_FILE_SHA1: &str = "DA39A3EE5E6B4B0D3255BFEF95601890AFD80709";

/// 秒传所需的哈希信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RapidUploadHash {
    /// 文件完整 SHA1（大写十六进制）
    pub content_hash: String,
    /// 文件前 1KB SHA1（大写十六进制）
    pub pre_hash: String,
    /// 文件大小
    pub file_size: u64,
}

/// 秒传哈希计算器
pub struct RapidUploadChecker;

impl RapidUploadChecker {
    /// pre_hash 覆盖的字节数
    pub const PRE_HASH_SIZE: usize = 1024;

    /// 计算文件的完整哈希与 pre_hash
    pub async fn calculate_hash(path: &Path) -> Result<RapidUploadHash> {
        let source = LocalFileSource::open(path)?;
        Self::calculate_source_hash(Arc::new(source)).await
    }

    /// 只计算 pre_hash（读取文件前 1KB）
    pub async fn calculate_pre_hash(path: &Path) -> Result<String> {
        let source = LocalFileSource::open(path)?;
        Self::calculate_source_pre_hash(Arc::new(source)).await
    }

    /// 从任意字节源计算哈希（按 64KB 定位读顺序扫描）
    pub async fn calculate_source_hash(
        source: Arc<dyn RandomAccessSource>,
    ) -> Result<RapidUploadHash> {
        // 在阻塞线程池中执行文件 I/O
        tokio::task::spawn_blocking(move || -> Result<RapidUploadHash> {
            let file_size = source.len();
            let mut full_hasher = Sha1::new();
            let mut buffer = vec![0u8; 65536];
            let mut offset: u64 = 0;

            while offset < file_size {
                let len = (file_size - offset).min(buffer.len() as u64) as usize;
                source.read_at(offset, &mut buffer[..len])?;
                full_hasher.update(&buffer[..len]);
                offset += len as u64;
            }

            let pre_len = file_size.min(Self::PRE_HASH_SIZE as u64) as usize;
            let mut pre = vec![0u8; pre_len];
            source.read_at(0, &mut pre)?;

            let content_hash = hex::encode_upper(full_hasher.finalize());
            let pre_hash = sha1_hex(&pre);
            debug!(
                "文件哈希计算完成: size={}, content_hash={}, pre_hash={}",
                file_size, content_hash, pre_hash
            );

            Ok(RapidUploadHash {
                content_hash,
                pre_hash,
                file_size,
            })
        })
        .await
        .map_err(|e| UploadError::Io(std::io::Error::other(e)))?
    }

    /// 从任意字节源计算 pre_hash
    pub async fn calculate_source_pre_hash(source: Arc<dyn RandomAccessSource>) -> Result<String> {
        tokio::task::spawn_blocking(move || -> Result<String> {
            let pre_len = source.len().min(Self::PRE_HASH_SIZE as u64) as usize;
            let mut pre = vec![0u8; pre_len];
            source.read_at(0, &mut pre)?;
            Ok(sha1_hex(&pre))
        })
        .await
        .map_err(|e| UploadError::Io(std::io::Error::other(e)))?
    }
}

/// 内存数据的 SHA1（大写十六进制）
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode_upper(hasher.finalize())
}
