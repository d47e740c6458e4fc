// Aliyun Drive Rust Library
// 阿里云盘上传客户端核心库

// 认证模块
pub mod auth;

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志模块
pub mod logging;

// 开放平台API模块
pub mod netdisk;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use auth::{MemoryTokenProvider, TokenInfo, TokenProvider};
pub use config::{AppConfig, ApiConfig, LogConfig, UploadConfig};
pub use error::{ErrorKind, Result, UploadError};
pub use logging::{init_logging, LogGuard};
pub use netdisk::{DriveClient, PartTransport, UploadApi, UploadedFile};
pub use uploader::{
    calc_proof_code, plan_parts, ChunkTransferExecutor, ChunkTransferResult, LocalFileSource,
    PartDescriptor, ProofCode, RandomAccessSource, RapidUploadChecker, RapidUploadHash,
    UploadEngine, UploadOutcome, UploadRequest, UploadSession, UploadSessionController,
};
