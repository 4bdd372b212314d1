//! 会话文件存储类型定义

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::audio_merge::MergeStrategy;

/// 草图子目录
pub const SKETCHES_DIR: &str = "sketches";
/// 音频分片子目录
pub const AUDIO_DIR: &str = "audio";
/// Top-3 子目录（按需创建）
pub const TOP3_DIR: &str = "top3";
/// 会话元数据文件
pub const META_FILE: &str = ".meta.json";
/// 早期原型单张画作的保存目录（位于上传根目录下）
pub const LEGACY_DRAWINGS_DIR: &str = "saved_drawings";
/// 合并后的音频文件名
pub const MERGED_AUDIO_FILE: &str = "merged_audio.webm";
/// Top-3 必须恰好包含的数量
pub const TOP3_COUNT: usize = 3;

/// 会话元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMeta {
    /// 会话 ID
    pub session_id: String,
    /// 实验条件编号（客户端开始会话时提供）
    #[serde(default)]
    pub condition: Option<u32>,
    /// 创建时间（Unix 时间戳，毫秒）
    pub created_at: i64,
    /// 结束时间（Unix 时间戳，毫秒）
    #[serde(default)]
    pub ended_at: Option<i64>,
    /// 最近一次音频合并结果
    #[serde(default)]
    pub last_merge: Option<MergeRecord>,
}

impl SessionMeta {
    /// 创建新的会话元数据
    pub fn new(session_id: String, condition: Option<u32>) -> Self {
        Self {
            session_id,
            condition,
            created_at: chrono::Utc::now().timestamp_millis(),
            ended_at: None,
            last_merge: None,
        }
    }
}

/// 音频合并记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeRecord {
    pub strategy: MergeStrategy,
    pub chunk_count: usize,
    pub merged_at: i64,
}

/// 草图编号：客户端可以传数字或字符串
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SketchIndex {
    Number(i64),
    Text(String),
}

impl fmt::Display for SketchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// 磁盘上的一个音频分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// 文件名中的分片编号
    pub number: u64,
    pub path: PathBuf,
}

/// 会话文件信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    /// 文件名
    pub name: String,
    /// 文件大小（字节）
    pub size: u64,
    /// 更新时间（Unix 时间戳，毫秒）
    pub updated_at: i64,
}

/// 会话摘要（用于列表显示）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub condition: Option<u32>,
    pub created_at: i64,
    pub ended_at: Option<i64>,
    pub sketch_count: usize,
    pub audio_chunk_count: usize,
}

/// 会话详情（包含各子目录的文件列表）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub meta: SessionMeta,
    pub sketches: Vec<SessionFile>,
    pub audio: Vec<SessionFile>,
    pub top3: Vec<SessionFile>,
}
