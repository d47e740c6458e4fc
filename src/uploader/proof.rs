// 秒传防伪码计算
//
// 服务端在允许秒传前，要求客户端证明确实持有文件内容：
// 1. 计算 MD5(access_token)，取十六进制表示的前 16 个字符，按 16 进制解析为整数 H
// 2. start = H mod file_size（使用 128 位整数运算，避免大文件溢出）
// 3. end = min(start + 8, file_size)
// 4. 读取 [start, end) 字节，标准 base64（带填充）编码
//
// 算法必须与服务端校验逐位一致

use crate::error::{Result, UploadError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 防伪码窗口长度
const PROOF_WINDOW: u64 = 8;

/// 可随机读取的字节源
///
/// 每次读取都是独立的定位读，多个分片可以并发读取同一个源
pub trait RandomAccessSource: Send + Sync {
    /// 字节源总长度
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 从 `offset` 开始读满 `buf`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;
}

/// 本地文件字节源
///
/// 每次读取单独打开文件句柄，不在多个读取之间共享游标
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    path: PathBuf,
    size: u64,
}

impl LocalFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = std::fs::metadata(&path)?.len();
        Ok(Self { path, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RandomAccessSource for LocalFileSource {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

impl RandomAccessSource for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.as_slice().len())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "读取超出数据末尾")
            })?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }
}

/// 防伪码
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProofCode {
    /// base64 编码后的窗口内容（空文件为空字符串）
    pub code: String,
    /// 窗口起始偏移
    pub offset: u64,
}

/// 计算防伪码窗口 [start, end)
///
/// 空文件返回 `(0, 0)`
pub fn proof_window(access_token: &str, file_size: u64) -> (u64, u64) {
    if file_size == 0 {
        return (0, 0);
    }

    let digest = format!("{:x}", md5::compute(access_token.as_bytes()));
    // MD5 的十六进制固定 32 位，前 16 位恰好是一个 64 位无符号整数
    let hash = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);

    let start = (hash as u128 % file_size as u128) as u64;
    let end = start.saturating_add(PROOF_WINDOW).min(file_size);
    (start, end)
}

/// 计算文件上传防伪码
///
/// # 参数
/// * `access_token` - 当前 AccessToken
/// * `file_size` - 文件大小
/// * `source` - 文件内容
///
/// # 错误
/// 窗口超出字节源长度时返回 `InvalidArgument`；读取失败时原样返回 I/O 错误
pub fn calc_proof_code(
    access_token: &str,
    file_size: u64,
    source: &dyn RandomAccessSource,
) -> Result<ProofCode> {
    if file_size == 0 {
        return Ok(ProofCode::default());
    }

    let (start, end) = proof_window(access_token, file_size);
    if end > source.len() {
        return Err(UploadError::invalid_argument(format!(
            "防伪码窗口 [{}, {}) 超出文件长度 {}",
            start,
            end,
            source.len()
        )));
    }

    let mut buf = vec![0u8; (end - start) as usize];
    source.read_at(start, &mut buf)?;

    debug!(
        "防伪码计算完成: file_size={}, offset={}, len={}",
        file_size,
        start,
        buf.len()
    );

    Ok(ProofCode {
        code: STANDARD.encode(&buf),
        offset: start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TOKEN: &str = "test_access_token";

    fn sample_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn test_empty_file() {
        let source: Vec<u8> = Vec::new();
        let proof = calc_proof_code(TOKEN, 0, &source).unwrap();
        assert_eq!(proof.code, "");
        assert_eq!(proof.offset, 0);
    }

    #[test]
    fn test_one_byte_file() {
        let source = b"Z".to_vec();
        let proof = calc_proof_code(TOKEN, 1, &source).unwrap();
        assert_eq!(proof.offset, 0);
        assert_eq!(proof.code, "Wg==");
    }

    #[test]
    fn test_known_windows() {
        // MD5("test_access_token") 前 16 位 = e232979cd06a7499
        assert_eq!(proof_window(TOKEN, 100), (81, 89));
        assert_eq!(proof_window(TOKEN, 1_048_576), (685_209, 685_217));
        // 窗口被截断到文件末尾
        assert_eq!(proof_window(TOKEN, 7), (5, 7));
        // 5TB 文件
        assert_eq!(
            proof_window(TOKEN, 5 * 1024 * 1024 * 1024 * 1024),
            (2_872_534_791_321, 2_872_534_791_329)
        );
        assert_eq!(proof_window("abc", 1000), (432, 440));
    }

    #[test]
    fn test_window_edge_sizes() {
        assert_eq!(proof_window(TOKEN, 0), (0, 0));
        assert_eq!(proof_window("", 0), (0, 0));
        assert_eq!(
            proof_window(TOKEN, u64::MAX),
            (0xe232_979c_d06a_7499, 0xe232_979c_d06a_7499 + PROOF_WINDOW)
        );
        assert_eq!(proof_window(TOKEN, 1), (0, 1));
    }

    #[test]
    fn test_known_codes() {
        let data = sample_data(1024);
        let proof = calc_proof_code(TOKEN, 1024, &data).unwrap();
        assert_eq!(proof.offset, 153);
        assert_eq!(proof.code, "mZqbnJ2en6A=");

        let data = sample_data(100);
        let proof = calc_proof_code(TOKEN, 100, &data).unwrap();
        assert_eq!(proof.code, "UVJTVFVWV1g=");
    }

    #[test]
    fn test_local_file_source() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let data = sample_data(1024);
        temp_file.write_all(&data).unwrap();
        temp_file.flush().unwrap();

        let source = LocalFileSource::open(temp_file.path()).unwrap();
        assert_eq!(source.len(), 1024);

        let proof = calc_proof_code(TOKEN, 1024, &source).unwrap();
        assert_eq!(proof.code, "mZqbnJ2en6A=");
    }

    #[test]
    fn test_source_shorter_than_declared_size() {
        let data = sample_data(50);
        let err = calc_proof_code(TOKEN, 100, &data).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_missing_file() {
        let result = LocalFileSource::open("/nonexistent/file.bin");
        assert!(matches!(result, Err(UploadError::Io(_))));
    }

    proptest! {
        #[test]
        fn prop_window_inside_file(token in "[a-zA-Z0-9._-]{1,64}", size in 1u64..u64::MAX) {
            let (start, end) = proof_window(&token, size);
            prop_assert!(start < size);
            prop_assert!(end <= size);
            prop_assert!(end - start <= PROOF_WINDOW);
            prop_assert!(end > start);
        }

        #[test]
        fn prop_deterministic(token in "[a-z0-9]{8,32}", size in 1usize..4096) {
            let data = sample_data(size);
            let first = calc_proof_code(&token, size as u64, &data).unwrap();
            let second = calc_proof_code(&token, size as u64, &data).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
