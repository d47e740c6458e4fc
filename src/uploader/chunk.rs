// 上传分片规划
//
// 阿里云盘分片规则：
// - 分片序号从 1 开始，连续编号，最多 10000 个
// - 除最后一个分片外，每个分片大小都等于分片大小
// - 文件 <= 分片大小（包括 0 字节文件）：只有一个分片
//
// 规划结果必须是确定的：刷新上传链接时需要重新生成与服务端完全一致的分片列表

use crate::error::{Result, UploadError};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::debug;

/// 默认分片大小: 512KB
pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 1024;

/// 单文件最大分片数量
pub const MAX_PART_NUM: u32 = 10000;

/// 分片描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 分片序号（从 1 开始）
    pub part_number: u32,
    /// 分片在文件中的起始偏移
    pub offset: u64,
    /// 分片字节长度
    pub length: u64,
}

impl PartDescriptor {
    /// 字节范围
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// 根据文件大小和分片大小生成分片列表
///
/// # 参数
/// * `size` - 文件总大小
/// * `chunk_size` - 分片大小（必须大于 0）
///
/// # 错误
/// 分片大小为 0，或分片数量超过 10000 时返回 `InvalidArgument`
pub fn plan_parts(size: u64, chunk_size: u64) -> Result<Vec<PartDescriptor>> {
    if chunk_size == 0 {
        return Err(UploadError::invalid_argument("分片大小必须大于 0"));
    }

    if size <= chunk_size {
        return Ok(vec![PartDescriptor {
            part_number: 1,
            offset: 0,
            length: size,
        }]);
    }

    let count = size.div_ceil(chunk_size);
    if count > MAX_PART_NUM as u64 {
        return Err(UploadError::invalid_argument(format!(
            "分片数量 {} 超过上限 {}，请使用更大的分片（文件大小={}, 分片大小={}）",
            count, MAX_PART_NUM, size, chunk_size
        )));
    }

    let parts = (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            PartDescriptor {
                part_number: (i + 1) as u32,
                offset,
                length: chunk_size.min(size - offset),
            }
        })
        .collect::<Vec<_>>();

    debug!(
        "分片规划完成: size={}, chunk_size={}, parts={}",
        size,
        chunk_size,
        parts.len()
    );

    Ok(parts)
}

/// 计算推荐的分片大小
///
/// 返回 `preferred` 的最小整数倍，使分片数量不超过 10000
pub fn recommended_chunk_size(size: u64, preferred: u64) -> u64 {
    let preferred = if preferred == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        preferred
    };

    let count = size.div_ceil(preferred);
    if count <= MAX_PART_NUM as u64 {
        return preferred;
    }

    let multiplier = count.div_ceil(MAX_PART_NUM as u64);
    preferred * multiplier
}

/// 单个分片的上传状态
#[derive(Debug, Clone)]
pub struct TrackedPart {
    pub descriptor: PartDescriptor,
    /// 当前有效的上传链接
    pub upload_url: Option<String>,
    /// 服务端是否已确认
    pub acknowledged: bool,
    /// 服务端返回的 ETag
    pub etag: Option<String>,
    /// 链接刷新次数
    pub url_refreshes: u32,
}

/// 分片跟踪器
///
/// 保存一个上传会话中所有分片的链接和确认状态，按分片序号索引
#[derive(Debug, Clone)]
pub struct PartTracker {
    parts: BTreeMap<u32, TrackedPart>,
    total_size: u64,
}

impl PartTracker {
    pub fn new(plan: &[PartDescriptor]) -> Self {
        let parts = plan
            .iter()
            .map(|d| {
                (
                    d.part_number,
                    TrackedPart {
                        descriptor: *d,
                        upload_url: None,
                        acknowledged: false,
                        etag: None,
                        url_refreshes: 0,
                    },
                )
            })
            .collect();
        let total_size = plan.iter().map(|d| d.length).sum();

        Self { parts, total_size }
    }

    /// 空跟踪器（秒传会话没有待传分片）
    pub fn empty() -> Self {
        Self {
            parts: BTreeMap::new(),
            total_size: 0,
        }
    }

    pub fn get(&self, part_number: u32) -> Option<&TrackedPart> {
        self.parts.get(&part_number)
    }

    pub fn contains(&self, part_number: u32) -> bool {
        self.parts.contains_key(&part_number)
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn descriptors(&self) -> Vec<PartDescriptor> {
        self.parts.values().map(|p| p.descriptor).collect()
    }

    /// 设置分片上传链接，返回分片是否存在
    pub fn set_url(&mut self, part_number: u32, url: String) -> bool {
        match self.parts.get_mut(&part_number) {
            Some(part) => {
                part.upload_url = Some(url);
                true
            }
            None => false,
        }
    }

    pub fn upload_url(&self, part_number: u32) -> Option<&str> {
        self.parts
            .get(&part_number)
            .and_then(|p| p.upload_url.as_deref())
    }

    /// 所有已分配链接的分片
    pub fn urls(&self) -> BTreeMap<u32, String> {
        self.parts
            .iter()
            .filter_map(|(n, p)| p.upload_url.clone().map(|url| (*n, url)))
            .collect()
    }

    /// 是否每个分片都有上传链接
    pub fn all_urls_present(&self) -> bool {
        self.parts.values().all(|p| p.upload_url.is_some())
    }

    pub fn record_refresh(&mut self, part_number: u32) -> u32 {
        match self.parts.get_mut(&part_number) {
            Some(part) => {
                part.url_refreshes += 1;
                part.url_refreshes
            }
            None => 0,
        }
    }

    /// 标记分片已被服务端确认
    pub fn acknowledge(&mut self, part_number: u32, etag: Option<String>) -> bool {
        match self.parts.get_mut(&part_number) {
            Some(part) => {
                part.acknowledged = true;
                if etag.is_some() {
                    part.etag = etag;
                }
                true
            }
            None => false,
        }
    }

    pub fn is_acknowledged(&self, part_number: u32) -> bool {
        self.parts
            .get(&part_number)
            .map(|p| p.acknowledged)
            .unwrap_or(false)
    }

    /// 尚未确认的分片序号（升序）
    pub fn pending(&self) -> Vec<u32> {
        self.parts
            .iter()
            .filter(|(_, p)| !p.acknowledged)
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn acknowledged_count(&self) -> usize {
        self.parts.values().filter(|p| p.acknowledged).count()
    }

    pub fn acknowledged_bytes(&self) -> u64 {
        self.parts
            .values()
            .filter(|p| p.acknowledged)
            .map(|p| p.descriptor.length)
            .sum()
    }

    /// 上传进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return if self.is_complete() { 100.0 } else { 0.0 };
        }
        (self.acknowledged_bytes() as f64 / self.total_size as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.parts.values().all(|p| p.acknowledged)
    }
}
