//! 会话文件存储服务
//!
//! 负责会话目录的创建以及草图、音频分片、Top-3 的落盘。
//! 所有路径都由校验过的会话 ID 和确定性的文件名拼出，不会逃出会话目录。

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, Utc};

use super::error::StorageError;
use super::types::{
    AudioChunk, MergeRecord, SessionDetail, SessionFile, SessionMeta, SessionSummary, SketchIndex,
    AUDIO_DIR, LEGACY_DRAWINGS_DIR, META_FILE, SKETCHES_DIR, TOP3_COUNT, TOP3_DIR,
};

const MAX_ID_LEN: usize = 128;
const CHUNK_PREFIX: &str = "audio_chunk_";
const CHUNK_SUFFIX: &str = ".webm";

/// 会话文件存储服务
#[derive(Debug, Clone)]
pub struct SessionFileStorage {
    /// 上传根目录
    base_dir: PathBuf,
}

impl SessionFileStorage {
    /// 使用指定目录创建存储服务，目录不存在时自动创建
    pub fn with_base_dir(base_dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&base_dir).map_err(StorageError::io("创建上传根目录失败"))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// 获取会话目录路径（会先校验会话 ID）
    pub fn session_dir(&self, session_id: &str) -> Result<PathBuf, StorageError> {
        validate_session_id(session_id)?;
        Ok(self.base_dir.join(session_id))
    }

    /// 获取已存在的会话目录，会话不存在时返回 NotFound
    fn existing_session_dir(&self, session_id: &str) -> Result<PathBuf, StorageError> {
        let session_dir = self.session_dir(session_id)?;
        if !session_dir.is_dir() {
            return Err(StorageError::NotFound(format!(
                "session not found: {}",
                session_id
            )));
        }
        Ok(session_dir)
    }

    fn existing_subdir(&self, session_id: &str, sub: &str) -> Result<PathBuf, StorageError> {
        Ok(self.existing_session_dir(session_id)?.join(sub))
    }

    /// 获取会话音频目录路径
    pub fn audio_dir(&self, session_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.session_dir(session_id)?.join(AUDIO_DIR))
    }

    // ========================================================================
    // 会话管理
    // ========================================================================

    /// 生成新的会话 ID：本地时间戳 + 8 位随机十六进制后缀
    pub fn generate_session_id() -> String {
        let suffix: [u8; 4] = rand::random();
        format!(
            "{}_{}",
            Local::now().format("%Y%m%d_%H%M%S"),
            hex::encode(suffix)
        )
    }

    /// 创建新会话目录（含 sketches 和 audio 子目录）
    pub fn create_session(&self, condition: Option<u32>) -> Result<SessionMeta, StorageError> {
        let session_id = Self::generate_session_id();
        let session_dir = self.session_dir(&session_id)?;

        for sub in [SKETCHES_DIR, AUDIO_DIR] {
            fs::create_dir_all(session_dir.join(sub))
                .map_err(StorageError::io(format!("创建会话目录失败: {}", sub)))?;
        }

        let meta = SessionMeta::new(session_id.clone(), condition);
        self.save_meta(&meta)?;

        tracing::info!(
            "[SessionFileStorage] 创建会话目录: {:?} condition={:?}",
            session_dir,
            condition
        );
        Ok(meta)
    }

    /// 检查会话是否存在
    pub fn session_exists(&self, session_id: &str) -> bool {
        self.session_dir(session_id)
            .map(|dir| dir.is_dir())
            .unwrap_or(false)
    }

    /// 列出所有会话，按创建时间倒序
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, StorageError> {
        let mut sessions = Vec::new();

        let entries = fs::read_dir(&self.base_dir).map_err(StorageError::io("读取上传根目录失败"))?;

        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let Some(session_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // 跳过隐藏目录和早期原型目录
            if session_id.starts_with('.') || session_id == LEGACY_DRAWINGS_DIR {
                continue;
            }
            let Ok(meta) = self.get_meta(&session_id) else {
                continue;
            };
            let sketch_count = list_dir_files(&entry.path().join(SKETCHES_DIR))?.len();
            let audio_chunk_count = self.list_audio_chunks(&session_id)?.len();

            sessions.push(SessionSummary {
                session_id: meta.session_id,
                condition: meta.condition,
                created_at: meta.created_at,
                ended_at: meta.ended_at,
                sketch_count,
                audio_chunk_count,
            });
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// 获取会话详情（包括各子目录的文件列表）
    pub fn get_session_detail(&self, session_id: &str) -> Result<SessionDetail, StorageError> {
        let meta = self.get_meta(session_id)?;
        let session_dir = self.session_dir(session_id)?;
        Ok(SessionDetail {
            meta,
            sketches: list_dir_files(&session_dir.join(SKETCHES_DIR))?,
            audio: list_dir_files(&session_dir.join(AUDIO_DIR))?,
            top3: list_dir_files(&session_dir.join(TOP3_DIR))?,
        })
    }

    // ========================================================================
    // 元数据管理
    // ========================================================================

    /// 读取会话元数据
    ///
    /// 元数据文件缺失时（例如手工拷贝进来的会话目录）根据目录信息补一份。
    pub fn get_meta(&self, session_id: &str) -> Result<SessionMeta, StorageError> {
        let session_dir = self.existing_session_dir(session_id)?;
        let meta_path = session_dir.join(META_FILE);

        if !meta_path.exists() {
            let created_at = fs::metadata(&session_dir)
                .ok()
                .and_then(|m| m.modified().ok())
                .map(system_time_millis)
                .unwrap_or(0);
            return Ok(SessionMeta {
                created_at,
                ..SessionMeta::new(session_id.to_string(), None)
            });
        }

        let content = fs::read_to_string(&meta_path).map_err(StorageError::io("读取元数据失败"))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// 保存会话元数据
    pub fn save_meta(&self, meta: &SessionMeta) -> Result<(), StorageError> {
        let meta_path = self.session_dir(&meta.session_id)?.join(META_FILE);
        let content = serde_json::to_string_pretty(meta)?;
        fs::write(&meta_path, content).map_err(StorageError::io("写入元数据失败"))
    }

    /// 标记会话结束，并记录本次合并结果
    pub fn mark_ended(
        &self,
        session_id: &str,
        merge: Option<MergeRecord>,
    ) -> Result<SessionMeta, StorageError> {
        let mut meta = self.get_meta(session_id)?;
        meta.ended_at = Some(Utc::now().timestamp_millis());
        if merge.is_some() {
            meta.last_merge = merge;
        }
        self.save_meta(&meta)?;
        Ok(meta)
    }

    // ========================================================================
    // 文件管理
    // ========================================================================

    /// 保存草图，返回生成的文件名
    ///
    /// 未提供编号时使用服务器当前时间戳（秒），同一秒内的两次保存会互相覆盖。
    pub fn save_sketch(
        &self,
        session_id: &str,
        svg_data: &str,
        index: Option<&SketchIndex>,
    ) -> Result<String, StorageError> {
        if svg_data.is_empty() {
            return Err(StorageError::InvalidInput("No SVG data provided".to_string()));
        }
        let index = match index {
            Some(SketchIndex::Text(text)) => {
                validate_token(text, "sketch_index")?;
                text.clone()
            }
            Some(index @ SketchIndex::Number(_)) => index.to_string(),
            None => Utc::now().timestamp().to_string(),
        };

        let sketches_dir = self.existing_subdir(session_id, SKETCHES_DIR)?;
        fs::create_dir_all(&sketches_dir).map_err(StorageError::io("创建草图目录失败"))?;

        let filename = format!("sketch_{}.svg", index);
        let file_path = sketches_dir.join(&filename);
        fs::write(&file_path, svg_data).map_err(StorageError::io("写入草图失败"))?;

        tracing::debug!("[SessionFileStorage] 保存草图: {} -> {:?}", filename, file_path);
        Ok(filename)
    }

    /// 保存音频分片，返回生成的文件名
    pub fn save_audio_chunk(
        &self,
        session_id: &str,
        chunk_number: u64,
        payload: &[u8],
    ) -> Result<String, StorageError> {
        let audio_dir = self.existing_subdir(session_id, AUDIO_DIR)?;
        fs::create_dir_all(&audio_dir).map_err(StorageError::io("创建音频目录失败"))?;

        let filename = chunk_file_name(chunk_number);
        fs::write(audio_dir.join(&filename), payload).map_err(StorageError::io("写入音频分片失败"))?;

        tracing::debug!(
            "[SessionFileStorage] 保存音频分片: session={} chunk={} size={}",
            session_id,
            chunk_number,
            payload.len()
        );
        Ok(filename)
    }

    /// 保存 Top-3 草图
    ///
    /// 先把三份内容写入临时文件，全部成功后再依次重命名到位；
    /// 暂存阶段失败会清理临时文件，之前的 Top-3 保持不变。
    /// 重命名阶段失败时同样清理剩余的临时文件，但已经重命名的文件不会回滚，
    /// 此时 Top-3 可能新旧混合。
    pub fn save_top3(
        &self,
        session_id: &str,
        svg_data_list: &[String],
    ) -> Result<Vec<String>, StorageError> {
        if svg_data_list.len() != TOP3_COUNT {
            return Err(StorageError::InvalidInput(format!(
                "Exactly {} sketches are required, got {}",
                TOP3_COUNT,
                svg_data_list.len()
            )));
        }

        let top3_dir = self.existing_subdir(session_id, TOP3_DIR)?;
        fs::create_dir_all(&top3_dir).map_err(StorageError::io("创建 Top-3 目录失败"))?;

        let mut staged: Vec<(PathBuf, PathBuf, String)> = Vec::with_capacity(TOP3_COUNT);
        for (i, svg) in svg_data_list.iter().enumerate() {
            let filename = format!("top3_{}.svg", i + 1);
            let tmp_path = top3_dir.join(format!(".{}.tmp", filename));
            if let Err(e) = fs::write(&tmp_path, svg) {
                let _ = fs::remove_file(&tmp_path);
                for (tmp, _, _) in &staged {
                    let _ = fs::remove_file(tmp);
                }
                return Err(StorageError::Io {
                    context: format!("写入 {} 失败", filename),
                    source: e,
                });
            }
            staged.push((tmp_path, top3_dir.join(&filename), filename));
        }

        let mut filenames = Vec::with_capacity(TOP3_COUNT);
        for (i, (tmp_path, final_path, filename)) in staged.iter().enumerate() {
            if let Err(e) = fs::rename(tmp_path, final_path) {
                for (tmp, _, _) in &staged[i..] {
                    let _ = fs::remove_file(tmp);
                }
                tracing::warn!(
                    "[SessionFileStorage] Top-3 重命名中断: session={} 已替换 {} 个",
                    session_id,
                    i
                );
                return Err(StorageError::Io {
                    context: format!("保存 {} 失败", filename),
                    source: e,
                });
            }
            filenames.push(filename.clone());
        }

        tracing::info!("[SessionFileStorage] 保存 Top-3: session={}", session_id);
        Ok(filenames)
    }

    /// 早期原型的单张画作保存，返回相对上传根目录的路径
    pub fn save_legacy_drawing(&self, svg: &str) -> Result<String, StorageError> {
        if svg.is_empty() {
            return Err(StorageError::InvalidInput(
                "No SVG content provided".to_string(),
            ));
        }
        let dir = self.base_dir.join(LEGACY_DRAWINGS_DIR);
        fs::create_dir_all(&dir).map_err(StorageError::io("创建画作目录失败"))?;

        let name = format!("drawing-{}.svg", Local::now().format("%Y%m%d-%H%M%S"));
        fs::write(dir.join(&name), svg).map_err(StorageError::io("写入画作失败"))?;
        Ok(format!("{}/{}", LEGACY_DRAWINGS_DIR, name))
    }

    /// 解析可下载的草图路径
    ///
    /// 文件名经过清洗后只能落在会话的 sketches 目录内，文件不存在时返回 NotFound。
    pub fn sketch_path(&self, session_id: &str, filename: &str) -> Result<PathBuf, StorageError> {
        let not_found = || StorageError::NotFound(format!("file not found: {}", filename));

        let safe_name = sanitize_filename(filename);
        if safe_name.is_empty() {
            return Err(not_found());
        }
        let sketches_dir = self.existing_subdir(session_id, SKETCHES_DIR)?;
        let path = sketches_dir.join(&safe_name);
        if !path.is_file() {
            return Err(not_found());
        }
        Ok(path)
    }

    /// 读取草图内容，返回清洗后的文件名和字节
    pub fn read_sketch(
        &self,
        session_id: &str,
        filename: &str,
    ) -> Result<(String, Vec<u8>), StorageError> {
        let path = self.sketch_path(session_id, filename)?;
        let bytes = fs::read(&path).map_err(StorageError::io("读取草图失败"))?;
        Ok((sanitize_filename(filename), bytes))
    }

    /// 列出会话的音频分片，按分片编号升序排列
    ///
    /// 只是当前磁盘状态的快照，之后到达的分片不会出现在结果中。
    pub fn list_audio_chunks(&self, session_id: &str) -> Result<Vec<AudioChunk>, StorageError> {
        let audio_dir = self.audio_dir(session_id)?;
        if !audio_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&audio_dir).map_err(StorageError::io("读取音频目录失败"))?;
        let mut chunks: Vec<AudioChunk> = entries
            .flatten()
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                let number = entry.file_name().to_str().and_then(parse_chunk_number)?;
                Some(AudioChunk {
                    number,
                    path: entry.path(),
                })
            })
            .collect();

        chunks.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.path.cmp(&b.path)));
        Ok(chunks)
    }
}

// ============================================================================
// 辅助函数
// ============================================================================

/// 音频分片文件名
pub fn chunk_file_name(chunk_number: u64) -> String {
    format!("{}{}{}", CHUNK_PREFIX, chunk_number, CHUNK_SUFFIX)
}

/// 从 `audio_chunk_{n}.webm` 中解析分片编号
pub fn parse_chunk_number(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(CHUNK_PREFIX)?
        .strip_suffix(CHUNK_SUFFIX)?
        .parse()
        .ok()
}

/// 校验会话 ID：只允许 ASCII 字母数字、`_` 和 `-`
pub fn validate_session_id(session_id: &str) -> Result<(), StorageError> {
    validate_token(session_id, "session_id")
}

fn validate_token(value: &str, field: &str) -> Result<(), StorageError> {
    if value.is_empty() {
        return Err(StorageError::InvalidInput(format!("{} is required", field)));
    }
    if value.len() > MAX_ID_LEN
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(StorageError::InvalidInput(format!("Invalid {}", field)));
    }
    Ok(())
}

/// 清洗用户提供的文件名
///
/// 只保留最后一个路径分量，去掉不在白名单内的字符，再去掉开头的点。
/// 结果为空说明原文件名不可用。
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

fn system_time_millis(t: std::time::SystemTime) -> i64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// 列出目录中的普通文件（跳过隐藏文件），按文件名排序；目录不存在时返回空列表
fn list_dir_files(dir: &Path) -> Result<Vec<SessionFile>, StorageError> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }

    let entries = fs::read_dir(dir).map_err(StorageError::io("读取目录失败"))?;
    for entry in entries.flatten() {
        if !entry.path().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            files.push(SessionFile {
                name,
                size: metadata.len(),
                updated_at: metadata.modified().map(system_time_millis).unwrap_or(0),
            });
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}
