//! sketchcast：草图与语音采集后端
//!
//! 浏览器画板把 SVG 快照和录音分片提交到这里，按会话落盘；
//! 会话结束时合并录音，并保存用户选出的 Top-3 草图。

pub mod audio_merge;
pub mod config;
pub mod error;
pub mod logging;
pub mod server;
pub mod session_files;

pub use config::Config;
pub use server::{build_router, run_server, AppState};
