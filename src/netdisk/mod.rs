// 网盘API模块

pub mod api;
pub mod api_error;
pub mod client;
pub mod types;

pub use api::{PartTransport, PutPartOutcome, UploadApi};
pub use api_error::{ApiErrorInfo, OssErrorInfo};
pub use client::DriveClient;
pub use types::*;
