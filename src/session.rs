use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::StoryError;
use crate::outline::ChapterOutlineEntry;
use crate::prime::PrimeInfo;

pub const SESSION_FILE: &str = "storyforge.session.v1.json";
pub const STREAMING_FILE: &str = "storyforge.streaming.v1.json";
pub const SESSION_ID_FILE: &str = "storyforge.sessionId.v1";

/// What the user asked for when seeding the story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedParams {
    pub title: String,
    pub premise: String,
    pub age_range: String,
    pub genre: String,
    pub chapter_count: u32,
    pub chapter_length: String,
    pub keypoints: String,
    pub style: String,
}

impl Default for SeedParams {
    fn default() -> Self {
        Self {
            title: String::new(),
            premise: String::new(),
            age_range: crate::age::DEFAULT_AGE_RANGE.to_owned(),
            genre: "fantasy".to_owned(),
            chapter_count: 8,
            chapter_length: "short".to_owned(),
            keypoints: String::new(),
            style: "warm, whimsical, gentle-humor".to_owned(),
        }
    }
}

impl SeedParams {
    /// Overwrites every field the seed-info response filled in.
    pub fn apply_prime(&mut self, info: &PrimeInfo) {
        let assign = |target: &mut String, value: &Option<String>| {
            if let Some(value) = value {
                *target = value.clone();
            }
        };
        assign(&mut self.title, &info.title);
        assign(&mut self.premise, &info.description);
        if let Some(age) = &info.age_range {
            self.age_range = crate::age::normalize_age_range(age).to_owned();
        }
        assign(&mut self.genre, &info.genre);
        if let Some(chapters) = info.chapters {
            self.chapter_count = chapters;
        }
        assign(&mut self.chapter_length, &info.chapter_length);
        assign(&mut self.keypoints, &info.keypoints);
        assign(&mut self.style, &info.style);
    }
}

/// One generated chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub chapter_id: u32,
    pub chapter_heading: String,
    pub html: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Progress of a chapter that is still streaming, kept for recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingSnapshot {
    pub chapter_id: u32,
    pub chapter_heading: String,
    pub raw_text: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Everything about the current story that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionRecord {
    #[serde(flatten)]
    pub seed: SeedParams,
    pub toc: Option<String>,
    pub chapters: Vec<ChapterOutlineEntry>,
    pub scenes: Vec<Scene>,
    pub cover_url: Option<String>,
}

impl SessionRecord {
    /// Replaces the outline. Existing scenes belong to the old outline and
    /// are dropped along with the cover.
    pub fn set_outline(&mut self, toc: String, chapters: Vec<ChapterOutlineEntry>) {
        self.toc = Some(toc);
        self.chapters = chapters;
        self.scenes.clear();
        self.cover_url = None;
    }

    /// The chapter that must be generated next, or `None` once every
    /// chapter has a scene.
    pub fn next_chapter(&self) -> Result<Option<&ChapterOutlineEntry>, StoryError> {
        if self.chapters.is_empty() {
            return Err(StoryError::NoOutline);
        }
        Ok(self.chapters.get(self.scenes.len()))
    }

    /// Rejects any chapter other than the next one in order.
    pub fn ensure_next(&self, chapter_id: u32) -> Result<&ChapterOutlineEntry, StoryError> {
        let next = self.scenes.len() as u32 + 1;
        match self.next_chapter()? {
            Some(chapter) if chapter.id == chapter_id => Ok(chapter),
            _ => Err(StoryError::OutOfOrder {
                requested: chapter_id,
                next,
            }),
        }
    }

    pub fn push_scene(&mut self, scene: Scene) -> Result<(), StoryError> {
        self.ensure_next(scene.chapter_id)?;
        self.scenes.push(scene);
        Ok(())
    }

    /// Removes the most recent scene so that chapter can be generated again.
    pub fn rewind(&mut self) -> Option<Scene> {
        self.scenes.pop()
    }

    pub fn scene_mut(&mut self, chapter_id: u32) -> Option<&mut Scene> {
        self.scenes.iter_mut().find(|s| s.chapter_id == chapter_id)
    }

    pub fn is_complete(&self) -> bool {
        !self.chapters.is_empty() && self.scenes.len() >= self.chapters.len()
    }

    pub fn display_title(&self) -> &str {
        let title = self.seed.title.trim();
        if title.is_empty() { "Untitled Codex" } else { title }
    }
}

/// Correlation id attached to every backend request of one story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    id: String,
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// A fresh context for a new story; `self` is left untouched.
    pub fn rotate(&self) -> Self {
        Self::new()
    }

    pub async fn load_or_create(store: &dyn SessionStore) -> anyhow::Result<Self> {
        if let Some(id) = store.load_session_id().await? {
            return Ok(Self::from_id(id));
        }
        let context = Self::new();
        store.save_session_id(context.id()).await?;
        tracing::info!(session_id = context.id(), "created session id");
        Ok(context)
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_record(&self) -> anyhow::Result<Option<SessionRecord>>;
    async fn save_record(&self, record: &SessionRecord) -> anyhow::Result<()>;
    async fn clear_record(&self) -> anyhow::Result<()>;
    async fn load_snapshot(&self) -> anyhow::Result<Option<StreamingSnapshot>>;
    async fn save_snapshot(&self, snapshot: &StreamingSnapshot) -> anyhow::Result<()>;
    async fn clear_snapshot(&self) -> anyhow::Result<()>;
    async fn load_session_id(&self) -> anyhow::Result<Option<String>>;
    async fn save_session_id(&self, id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LocalFsSessionStore {
    base_dir: PathBuf,
}

impl LocalFsSessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn record_path(&self) -> PathBuf {
        self.base_dir.join(SESSION_FILE)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.base_dir.join(STREAMING_FILE)
    }

    fn session_id_path(&self) -> PathBuf {
        self.base_dir.join(SESSION_ID_FILE)
    }
}

#[async_trait]
impl SessionStore for LocalFsSessionStore {
    async fn load_record(&self) -> anyhow::Result<Option<SessionRecord>> {
        let path = self.record_path();
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn save_record(&self, record: &SessionRecord) -> anyhow::Result<()> {
        write_json_atomic(&self.record_path(), record)
            .await
            .context("write session record")
    }

    async fn clear_record(&self) -> anyhow::Result<()> {
        remove_if_exists(&self.record_path()).await
    }

    async fn load_snapshot(&self) -> anyhow::Result<Option<StreamingSnapshot>> {
        let path = self.snapshot_path();
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn save_snapshot(&self, snapshot: &StreamingSnapshot) -> anyhow::Result<()> {
        write_json_atomic(&self.snapshot_path(), snapshot)
            .await
            .context("write streaming snapshot")
    }

    async fn clear_snapshot(&self) -> anyhow::Result<()> {
        remove_if_exists(&self.snapshot_path()).await
    }

    async fn load_session_id(&self) -> anyhow::Result<Option<String>> {
        let path = self.session_id_path();
        match fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw.trim().to_owned()).filter(|id| !id.is_empty())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read: {}", path.display())),
        }
    }

    async fn save_session_id(&self, id: &str) -> anyhow::Result<()> {
        write_atomic(&self.session_id_path(), id.as_bytes())
            .await
            .context("write session id")
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    write_atomic(path, &data).await
}

async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove: {}", path.display())),
    }
}
