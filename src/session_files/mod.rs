//! 会话文件存储模块
//!
//! 每个采集会话在上传根目录下拥有独立的目录树，
//! 所有状态都保存在磁盘上，目录存在即代表会话存在。
//!
//! ## 目录结构
//! ```text
//! uploads/
//! ├── {session-id}/
//! │   ├── .meta.json              # 会话元数据
//! │   ├── sketches/
//! │   │   └── sketch_{index}.svg
//! │   ├── audio/
//! │   │   ├── audio_chunk_{n}.webm
//! │   │   └── merged_audio.webm   # 结束会话时生成
//! │   └── top3/                   # 按需创建
//! │       └── top3_{1..3}.svg
//! └── saved_drawings/             # 早期原型的单张画作
//! ```

mod error;
pub mod storage;
pub mod types;

pub use error::StorageError;
pub use storage::{parse_chunk_number, sanitize_filename, validate_session_id, SessionFileStorage};
pub use types::*;
