//! 音频分片合并
//!
//! 两级策略：
//! - 首选 ffmpeg concat demuxer 无损拼接（`-c copy`）
//! - ffmpeg 不可用或执行失败时，按相同顺序直接拼接原始字节
//!
//! 字节拼接得到的容器结构并不规范，但对 webm 这类容忍直接拼接的格式通常仍可播放。

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::MergeConfig;
use crate::session_files::{AudioChunk, SessionFileStorage, StorageError, MERGED_AUDIO_FILE};

/// ffmpeg 分片清单文件名前缀（隐藏文件，合并结束后删除）
///
/// 每次合并使用带随机后缀的独立清单，同一会话的并发合并互不干扰。
const MANIFEST_PREFIX: &str = ".concat_manifest";

/// 实际采用的合并方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Ffmpeg,
    ByteJoin,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ffmpeg => write!(f, "ffmpeg"),
            Self::ByteJoin => write!(f, "byte_join"),
        }
    }
}

/// 一次合并的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub chunk_count: usize,
    pub strategy: MergeStrategy,
    pub output: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// 会话 ID 非法或分片目录无法读取
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// 字节拼接读写失败
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("分片扫描任务异常终止: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl MergeError {
    fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}

/// 音频合并器
#[derive(Debug, Clone)]
pub struct AudioMerger {
    /// ffmpeg 路径；为 None 时只使用字节拼接
    ffmpeg: Option<PathBuf>,
}

impl AudioMerger {
    pub fn new(config: &MergeConfig) -> Self {
        Self {
            ffmpeg: config
                .ffmpeg_enabled
                .then(|| config.ffmpeg_path.clone()),
        }
    }

    #[cfg(test)]
    fn byte_join_only() -> Self {
        Self { ffmpeg: None }
    }

    /// 合并会话的所有音频分片到 `audio/merged_audio.webm`
    ///
    /// 分片列表只在开始时读取一次。没有分片时返回 `Ok(None)`。
    pub async fn merge_session(
        &self,
        storage: &SessionFileStorage,
        session_id: &str,
    ) -> Result<Option<MergeOutcome>, MergeError> {
        let storage = storage.clone();
        let session_id = session_id.to_string();
        let (chunks, audio_dir) = tokio::task::spawn_blocking(move || {
            let chunks = storage.list_audio_chunks(&session_id)?;
            let audio_dir = storage.audio_dir(&session_id)?;
            Ok::<_, StorageError>((chunks, audio_dir))
        })
        .await??;
        self.merge_chunks(&chunks, &audio_dir.join(MERGED_AUDIO_FILE))
            .await
    }

    /// 按给定顺序合并分片，重复执行会覆盖之前的输出
    pub async fn merge_chunks(
        &self,
        chunks: &[AudioChunk],
        output: &Path,
    ) -> Result<Option<MergeOutcome>, MergeError> {
        if chunks.is_empty() {
            tracing::info!("[AudioMerge] 没有音频分片，跳过合并: {:?}", output);
            return Ok(None);
        }

        let merged_by_ffmpeg = match &self.ffmpeg {
            Some(ffmpeg) => self.try_ffmpeg(ffmpeg, chunks, output).await,
            None => false,
        };
        let strategy = if merged_by_ffmpeg {
            MergeStrategy::Ffmpeg
        } else {
            byte_join(chunks, output).await?;
            MergeStrategy::ByteJoin
        };

        tracing::info!(
            "[AudioMerge] 合并完成: chunks={} strategy={} output={:?}",
            chunks.len(),
            strategy,
            output
        );
        Ok(Some(MergeOutcome {
            chunk_count: chunks.len(),
            strategy,
            output: output.to_path_buf(),
        }))
    }

    /// 尝试用 ffmpeg 合并，成功返回 true
    async fn try_ffmpeg(&self, ffmpeg: &Path, chunks: &[AudioChunk], output: &Path) -> bool {
        let manifest_dir = output.parent().unwrap_or_else(|| Path::new("."));
        let manifest_path = manifest_dir.join(format!(
            "{}_{}.txt",
            MANIFEST_PREFIX,
            hex::encode(rand::random::<[u8; 4]>())
        ));

        let manifest = match build_manifest(chunks).await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!("[AudioMerge] 生成分片清单失败，改用字节拼接: {}", e);
                return false;
            }
        };
        if let Err(e) = tokio::fs::write(&manifest_path, manifest).await {
            tracing::warn!("[AudioMerge] 写入分片清单失败，改用字节拼接: {}", e);
            return false;
        }
        // 无论 ffmpeg 结果如何都删除清单
        let _manifest_guard = scopeguard::guard(manifest_path.clone(), |path| {
            let _ = std::fs::remove_file(path);
        });

        let result = Command::new(ffmpeg)
            .args(["-y", "-hide_banner", "-loglevel", "error"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(&manifest_path)
            .args(["-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .output()
            .await;

        match result {
            Ok(out) if out.status.success() => true,
            Ok(out) => {
                tracing::warn!(
                    "[AudioMerge] ffmpeg 执行失败 ({}), 改用字节拼接: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    "[AudioMerge] 无法启动 ffmpeg {:?}，改用字节拼接: {}",
                    ffmpeg,
                    e
                );
                false
            }
        }
    }
}

/// ffmpeg concat demuxer 清单，每行 `file '<绝对路径>'`
async fn build_manifest(chunks: &[AudioChunk]) -> std::io::Result<String> {
    let mut manifest = String::new();
    for chunk in chunks {
        let path = tokio::fs::canonicalize(&chunk.path).await?;
        let escaped = path.to_string_lossy().replace('\'', r"'\''");
        manifest.push_str(&format!("file '{}'\n", escaped));
    }
    Ok(manifest)
}

/// 直接按顺序拼接分片字节
async fn byte_join(chunks: &[AudioChunk], output: &Path) -> Result<(), MergeError> {
    let mut file = tokio::fs::File::create(output)
        .await
        .map_err(MergeError::io("创建合并文件失败"))?;
    for chunk in chunks {
        let bytes = tokio::fs::read(&chunk.path)
            .await
            .map_err(MergeError::io(format!("读取分片 {} 失败", chunk.number)))?;
        file.write_all(&bytes)
            .await
            .map_err(MergeError::io("写入合并文件失败"))?;
    }
    file.flush().await.map_err(MergeError::io("写入合并文件失败"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (SessionFileStorage, String, TempDir) {
        let temp = TempDir::new().unwrap();
        let storage = SessionFileStorage::with_base_dir(temp.path().to_path_buf()).unwrap();
        let session_id = storage.create_session(None).unwrap().session_id;
        (storage, session_id, temp)
    }

    fn merger_with_ffmpeg(path: impl Into<PathBuf>) -> AudioMerger {
        AudioMerger::new(&MergeConfig {
            ffmpeg_enabled: true,
            ffmpeg_path: path.into(),
        })
    }

    fn manifest_left(dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .unwrap()
            .any(|e| e.unwrap().file_name().to_string_lossy().starts_with(MANIFEST_PREFIX))
    }

    /// 模拟 ffmpeg：`$10` 为清单，`${13}` 为输出。按清单顺序拼接各分片，并记录清单内容与路径
    #[cfg(unix)]
    const FAKE_FFMPEG: &str = r##"#!/bin/sh
cp "${10}" "$(dirname "$0")/manifest_seen.txt"
echo "${10}" >> "$(dirname "$0")/manifest_names.txt"
sed -n "s/^file '\(.*\)'$/\1/p" "${10}" | while IFS= read -r f; do cat "$f"; done > "${13}"
"##;

    #[cfg(unix)]
    fn write_fake_ffmpeg(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-ffmpeg");
        std::fs::write(&script, FAKE_FFMPEG).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[tokio::test]
    async fn test_byte_join_orders_by_chunk_number() {
        let (storage, sid, _temp) = setup();
        storage.save_audio_chunk(&sid, 2, b"cc").unwrap();
        storage.save_audio_chunk(&sid, 0, b"a").unwrap();
        storage.save_audio_chunk(&sid, 1, b"bbb").unwrap();

        let outcome = AudioMerger::byte_join_only()
            .merge_session(&storage, &sid)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.chunk_count, 3);
        assert_eq!(outcome.strategy, MergeStrategy::ByteJoin);
        assert_eq!(std::fs::read(&outcome.output).unwrap(), b"abbbcc");
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_falls_back() {
        let (storage, sid, _temp) = setup();
        storage.save_audio_chunk(&sid, 0, b"x").unwrap();
        storage.save_audio_chunk(&sid, 1, b"y").unwrap();

        let merger = merger_with_ffmpeg("/nonexistent/bin/ffmpeg");
        let outcome = merger.merge_session(&storage, &sid).await.unwrap().unwrap();

        assert_eq!(outcome.strategy, MergeStrategy::ByteJoin);
        assert_eq!(std::fs::read(&outcome.output).unwrap(), b"xy");
        let audio_dir = storage.audio_dir(&sid).unwrap();
        assert!(!manifest_left(&audio_dir));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_ffmpeg_falls_back_and_removes_manifest() {
        let (storage, sid, _temp) = setup();
        storage.save_audio_chunk(&sid, 0, b"1").unwrap();
        storage.save_audio_chunk(&sid, 1, b"2").unwrap();

        // `false` 总是以非零状态退出
        let merger = merger_with_ffmpeg("false");
        let outcome = merger.merge_session(&storage, &sid).await.unwrap().unwrap();

        assert_eq!(outcome.strategy, MergeStrategy::ByteJoin);
        assert_eq!(std::fs::read(&outcome.output).unwrap(), b"12");
        let audio_dir = storage.audio_dir(&sid).unwrap();
        assert!(!manifest_left(&audio_dir));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ffmpeg_concat_in_chunk_order() {
        let (storage, sid, _temp) = setup();
        storage.save_audio_chunk(&sid, 1, b"B").unwrap();
        storage.save_audio_chunk(&sid, 0, b"A").unwrap();

        let bin_dir = TempDir::new().unwrap();
        let merger = merger_with_ffmpeg(write_fake_ffmpeg(bin_dir.path()));
        let outcome = merger.merge_session(&storage, &sid).await.unwrap().unwrap();

        assert_eq!(outcome.strategy, MergeStrategy::Ffmpeg);
        assert_eq!(outcome.chunk_count, 2);
        assert_eq!(std::fs::read(&outcome.output).unwrap(), b"AB");

        let audio_dir = storage.audio_dir(&sid).unwrap();
        assert!(!manifest_left(&audio_dir));

        let seen = std::fs::read_to_string(bin_dir.path().join("manifest_seen.txt")).unwrap();
        let lines: Vec<&str> = seen.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("file '/") && lines[0].ends_with("audio_chunk_0.webm'"));
        assert!(lines[1].ends_with("audio_chunk_1.webm'"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_merges_use_separate_manifests() {
        let (storage, sid, _temp) = setup();
        storage.save_audio_chunk(&sid, 0, b"A").unwrap();
        storage.save_audio_chunk(&sid, 1, b"B").unwrap();

        let bin_dir = TempDir::new().unwrap();
        let merger = merger_with_ffmpeg(write_fake_ffmpeg(bin_dir.path()));
        let (first, second) = tokio::join!(
            merger.merge_session(&storage, &sid),
            merger.merge_session(&storage, &sid)
        );
        assert_eq!(first.unwrap().unwrap().strategy, MergeStrategy::Ffmpeg);
        assert_eq!(second.unwrap().unwrap().strategy, MergeStrategy::Ffmpeg);

        let names = std::fs::read_to_string(bin_dir.path().join("manifest_names.txt")).unwrap();
        let names: Vec<&str> = names.lines().collect();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
        assert!(!manifest_left(&storage.audio_dir(&sid).unwrap()));
    }

    #[tokio::test]
    async fn test_invalid_session_is_storage_error() {
        let (storage, _sid, _temp) = setup();
        let err = AudioMerger::byte_join_only()
            .merge_session(&storage, "../escape")
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Storage(StorageError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_no_chunks_is_noop() {
        let (storage, sid, _temp) = setup();
        let outcome = AudioMerger::byte_join_only()
            .merge_session(&storage, &sid)
            .await
            .unwrap();

        assert!(outcome.is_none());
        let audio_dir = storage.audio_dir(&sid).unwrap();
        assert!(!audio_dir.join(MERGED_AUDIO_FILE).exists());
    }

    #[tokio::test]
    async fn test_rerun_includes_new_chunk_and_overwrites() {
        let (storage, sid, _temp) = setup();
        let merger = AudioMerger::byte_join_only();
        for n in 0..3u64 {
            storage.save_audio_chunk(&sid, n, &[b'a' + n as u8]).unwrap();
        }
        merger.merge_session(&storage, &sid).await.unwrap();

        storage.save_audio_chunk(&sid, 3, b"d").unwrap();
        let outcome = merger.merge_session(&storage, &sid).await.unwrap().unwrap();

        // 合并产物本身不会被当作分片
        assert_eq!(outcome.chunk_count, 4);
        assert_eq!(std::fs::read(&outcome.output).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_gap_in_chunks_is_merged_silently() {
        let (storage, sid, _temp) = setup();
        for n in [0u64, 1, 3] {
            storage.save_audio_chunk(&sid, n, n.to_string().as_bytes()).unwrap();
        }

        let outcome = AudioMerger::byte_join_only()
            .merge_session(&storage, &sid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(&outcome.output).unwrap(), b"013");
    }

    #[tokio::test]
    async fn test_manifest_escapes_quotes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("it's.webm");
        std::fs::write(&path, b"x").unwrap();

        let manifest = build_manifest(&[AudioChunk { number: 0, path }]).await.unwrap();
        assert!(manifest.starts_with("file '"));
        assert!(manifest.contains(r"it'\''s.webm"));
    }

    #[test]
    fn test_disabled_ffmpeg_config() {
        let merger = AudioMerger::new(&MergeConfig {
            ffmpeg_enabled: false,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        });
        assert!(merger.ffmpeg.is_none());
    }
}
