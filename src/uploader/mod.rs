// 上传引擎模块
//
// - chunk: 分片规划与分片状态
// - proof / rapid_upload: 秒传所需的防伪码与哈希
// - session: 上传会话（创建、刷新链接、列举分片、完成）
// - transfer: 单分片传输
// - retry: 退避重试与令牌刷新
// - engine: 端到端上传，Semaphore 控制分片并发

pub mod chunk;
pub mod engine;
pub mod proof;
pub mod rapid_upload;
pub mod retry;
pub mod session;
pub mod transfer;

pub use chunk::{
    plan_parts, recommended_chunk_size, PartDescriptor, PartTracker, TrackedPart,
    DEFAULT_CHUNK_SIZE, MAX_PART_NUM,
};
pub use engine::{UploadEngine, UploadOutcome};
pub use proof::{calc_proof_code, proof_window, LocalFileSource, ProofCode, RandomAccessSource};
pub use rapid_upload::{sha1_hex, RapidUploadChecker, RapidUploadHash, EMPTY_FILE_SHA1};
pub use retry::{run_with_retry, RetryPolicy};
pub use session::{
    CheckNameMode, SessionState, UploadRequest, UploadSession, UploadSessionController,
    PROOF_VERSION, ROOT_FOLDER_ID,
};
pub use transfer::{read_part, ChunkTransferExecutor, ChunkTransferResult};
