// 导出模块
pub mod klcommon;
pub mod klaggregate;
pub mod klstorage;
pub mod klfeed;

// Re-export error types
pub use klcommon::error::AppError;
