// 认证模块

pub mod provider;
pub mod types;

pub use provider::{MemoryTokenProvider, RefreshFn, RefreshFuture, TokenProvider};
pub use types::TokenInfo;
