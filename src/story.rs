use std::sync::LazyLock;

use anyhow::Context as _;
use regex::Regex;

use crate::age::{chapter_length_hint, normalize_age_range};
use crate::animate::{count_words, wrap_words};
use crate::blob::BlobStore;
use crate::client::{
    ChapterContext, ChapterRequest, ExportPackage, SeedRequest, WebhookClient, SEED_INFO, SEED_STORY,
};
use crate::config::Config;
use crate::dedup::{signature, InFlight};
use crate::entities::decode_entities;
use crate::error::StoryError;
use crate::outline::{build_cover_prompt, normalize_toc_text, parse_toc, reconcile, ChapterOutlineEntry};
use crate::prime::PrimeInfo;
use crate::render::{
    finalize_chapter, finalize_normalized_chapter, render_streaming, strip_agent_protocol,
};
use crate::session::{Scene, SeedParams, SessionContext, SessionRecord, SessionStore, StreamingSnapshot};

pub const POLICY_HINT: &str = "Fictionalize any sensitive or political content; avoid real names; keep it age-appropriate and non-political.";

const KEYPOINT_NOTES_LIMIT: usize = 120;
const UNTITLED: &str = "Untitled Codex";

static BLOCK_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(?:p|h[1-6]|div|li)>").expect("valid block break regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// One rendered update of a chapter that is still streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterFrame {
    pub chapter_id: u32,
    /// Display HTML with per-word animation classes.
    pub html: String,
    pub new_words: usize,
    pub fragments: usize,
}

/// Observer for chapter generation. Both hooks default to no-ops.
pub trait ChapterProgress {
    fn on_image(&mut self, _chapter_id: u32, _image_url: Option<&str>) {}
    fn on_frame(&mut self, _frame: &ChapterFrame) {}
}

/// Ignores all progress.
pub struct Quiet;

impl ChapterProgress for Quiet {}

#[derive(Debug, Clone, Default)]
pub struct ChapterOptions {
    /// Steering text for this chapter only.
    pub influence: Option<String>,
    /// Use the one-shot endpoint instead of the streamed response.
    pub one_shot: bool,
}

/// A streaming snapshot left behind by an interrupted chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredChapter {
    pub snapshot: StreamingSnapshot,
    pub html: String,
}

/// Backend calls that concurrent callers may issue with identical requests.
///
/// Clones share the in-flight maps, so two tasks asking for the same outline
/// or seed info at once wait on a single webhook call.
#[derive(Debug, Clone)]
pub struct StoryBackend {
    client: WebhookClient,
    outlines: InFlight<String>,
    primes: InFlight<PrimeInfo>,
}

impl StoryBackend {
    pub fn new(client: WebhookClient) -> Self {
        Self {
            client,
            outlines: InFlight::new(),
            primes: InFlight::new(),
        }
    }

    pub fn client(&self) -> &WebhookClient {
        &self.client
    }

    pub async fn prime(&self, prompt: &str) -> Result<PrimeInfo, StoryError> {
        let body = serde_json::json!({ "prompt": prompt });
        let client = &self.client;
        self.primes
            .run(&signature(SEED_INFO, &body), || client.prime(prompt))
            .await
    }

    /// Raw outline text for `request`.
    pub async fn outline(&self, request: &SeedRequest) -> Result<String, StoryError> {
        let body = serde_json::to_value(request)
            .map_err(|err| StoryError::UnparseableResponse(err.to_string()))?;
        let client = &self.client;
        self.outlines
            .run(&signature(SEED_STORY, &body), || client.seed_story(request))
            .await
    }
}

/// Drives a story from seed to export, persisting after every change.
pub struct StoryFlow {
    backend: StoryBackend,
    store: Box<dyn SessionStore>,
    config: Config,
    record: SessionRecord,
}

impl StoryFlow {
    pub async fn open(
        client: WebhookClient,
        store: Box<dyn SessionStore>,
        config: Config,
    ) -> anyhow::Result<Self> {
        let record = store
            .load_record()
            .await
            .context("load session record")?
            .unwrap_or_default();
        let mut flow = Self {
            backend: StoryBackend::new(client),
            store,
            config,
            record,
        };
        flow.repair_images().await?;
        Ok(flow)
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn client(&self) -> &WebhookClient {
        &self.backend.client
    }

    /// Shared handle for de-duplicated outline and seed-info requests.
    pub fn backend(&self) -> StoryBackend {
        self.backend.clone()
    }

    /// Starts over with a fresh session id and an empty record.
    pub async fn start_new(&mut self) -> anyhow::Result<SessionContext> {
        let session = self.backend.client.session().rotate();
        self.store
            .save_session_id(session.id())
            .await
            .context("save session id")?;
        self.store.clear_record().await.context("clear session record")?;
        self.store
            .clear_snapshot()
            .await
            .context("clear streaming snapshot")?;
        self.backend.client.set_session(session.clone());
        self.record = SessionRecord::default();
        tracing::info!(session_id = session.id(), "started new story");
        Ok(session)
    }

    /// Asks the backend to infer seed parameters from a free-text idea and
    /// merges them into the current seed.
    pub async fn prime(&mut self, prompt: &str) -> anyhow::Result<PrimeInfo> {
        let info = self.backend.prime(prompt).await?;
        if info.is_empty() {
            tracing::warn!("seed-info response carried no usable fields");
        }
        if self.record.seed.premise.trim().is_empty() && info.description.is_none() {
            self.record.seed.premise = prompt.trim().to_owned();
        }
        self.record.seed.apply_prime(&info);
        self.persist().await?;
        Ok(info)
    }

    /// Requests an outline for `seed` and replaces the current one.
    ///
    /// On any failure, including a refusal, the stored outline and scenes are
    /// left as they were.
    pub async fn seed_outline(&mut self, seed: SeedParams) -> anyhow::Result<&[ChapterOutlineEntry]> {
        let request = seed_request(&seed)?;
        let requested = request.chapters;
        let toc = self.backend.outline(&request).await?;
        if self.config.refusal.is_refusal(&toc) {
            tracing::warn!("outline request was refused");
            return Err(StoryError::Refusal.into());
        }

        let toc = normalize_toc_text(&toc);
        let chapters = reconcile(parse_toc(&toc), requested as usize);
        tracing::info!(chapters = chapters.len(), "outline ready");

        self.record.seed = SeedParams {
            age_range: request.age_range.clone(),
            chapter_count: requested,
            ..seed
        };
        self.record.set_outline(toc, chapters);
        self.persist().await?;

        self.generate_cover().await?;
        Ok(&self.record.chapters)
    }

    /// Best-effort cover illustration for the current outline.
    pub async fn generate_cover(&mut self) -> anyhow::Result<Option<String>> {
        let Some(toc) = self.record.toc.clone() else {
            return Ok(None);
        };
        let prompt = build_cover_prompt(self.record.display_title(), &toc);
        let cover = self.illustrate(&prompt).await;
        self.record.cover_url = cover.clone();
        self.persist().await?;
        Ok(cover)
    }

    /// Generates the next chapter in outline order: illustration first, then
    /// text, then the scene is appended and persisted.
    pub async fn next_chapter(
        &mut self,
        options: ChapterOptions,
        progress: &mut dyn ChapterProgress,
    ) -> anyhow::Result<Scene> {
        let chapter = self
            .record
            .next_chapter()?
            .cloned()
            .context("every chapter in the outline has already been written")?;
        let request = self.chapter_request(&chapter, options.influence.as_deref());

        let image_url = self.illustrate(&self.image_prompt(&chapter)).await;
        progress.on_image(chapter.id, image_url.as_deref());

        let finished = if options.one_shot {
            let html = self.backend.client.expand_chapter(&request).await?;
            if html.trim().is_empty() {
                return Err(StoryError::EmptyResponse.into());
            }
            finalize_normalized_chapter(&html, &chapter.heading)
        } else {
            let raw = self
                .stream_chapter(&chapter, &request, image_url.as_deref(), progress)
                .await?;
            if raw.trim().is_empty() {
                return Err(StoryError::EmptyResponse.into());
            }
            finalize_chapter(&raw, &chapter.heading)
        };

        let scene = Scene {
            chapter_id: chapter.id,
            chapter_heading: finished.title,
            html: finished.html,
            image_url,
        };
        self.record.push_scene(scene.clone())?;
        self.persist().await?;
        self.store
            .clear_snapshot()
            .await
            .context("clear streaming snapshot")?;
        tracing::info!(chapter_id = scene.chapter_id, "chapter complete");
        Ok(scene)
    }

    async fn stream_chapter(
        &self,
        chapter: &ChapterOutlineEntry,
        request: &ChapterRequest,
        image_url: Option<&str>,
        progress: &mut dyn ChapterProgress,
    ) -> anyhow::Result<String> {
        let mut stream = self.backend.client.expand_chapter_stream(request).await?;
        let transport = stream.transport();
        let mut raw = String::new();
        let mut shown_words = 0;
        let mut fragments = 0;

        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            raw.push_str(&strip_agent_protocol(&fragment));
            fragments += 1;

            let html = render_streaming(&raw);
            let words = count_words(&html);
            let new_words = words.saturating_sub(shown_words);
            shown_words = words;
            progress.on_frame(&ChapterFrame {
                chapter_id: chapter.id,
                html: wrap_words(&html, new_words, false),
                new_words,
                fragments,
            });

            let snapshot = StreamingSnapshot {
                chapter_id: chapter.id,
                chapter_heading: chapter.heading.clone(),
                raw_text: raw.clone(),
                image_url: image_url.map(str::to_owned),
            };
            if let Err(err) = self.store.save_snapshot(&snapshot).await {
                tracing::warn!(chapter_id = chapter.id, "save streaming snapshot: {err:#}");
            }
        }
        tracing::debug!(chapter_id = chapter.id, ?transport, fragments, "chapter stream drained");
        Ok(raw)
    }

    /// Drops the last scene so its chapter can be generated again.
    pub async fn rewind(&mut self) -> anyhow::Result<Option<Scene>> {
        let removed = self.record.rewind();
        if let Some(scene) = &removed {
            self.persist().await?;
            tracing::info!(chapter_id = scene.chapter_id, "rewound chapter");
        }
        Ok(removed)
    }

    /// Replaces the illustration of one written chapter. The old image is
    /// kept when the backend returns nothing.
    pub async fn regenerate_image(&mut self, chapter_id: u32) -> anyhow::Result<Option<String>> {
        let chapter = self
            .record
            .chapters
            .iter()
            .find(|c| c.id == chapter_id)
            .cloned()
            .with_context(|| format!("no chapter {chapter_id} in the outline"))?;
        if self.record.scene_mut(chapter_id).is_none() {
            anyhow::bail!("chapter {chapter_id} has not been written yet");
        }
        let Some(url) = self.illustrate(&self.image_prompt(&chapter)).await else {
            return Ok(None);
        };
        if let Some(scene) = self.record.scene_mut(chapter_id) {
            scene.image_url = Some(url.clone());
        }
        self.persist().await?;
        Ok(Some(url))
    }

    /// Narration for one written chapter. Failures degrade to `None`.
    pub async fn narrate(&self, chapter_id: u32) -> anyhow::Result<Option<String>> {
        let scene = self
            .record
            .scenes
            .iter()
            .find(|s| s.chapter_id == chapter_id)
            .with_context(|| format!("chapter {chapter_id} has not been written yet"))?;
        let text = format!("{}. {}", scene.chapter_heading, plain_text(&scene.html));
        match self.backend.client.narrate(&text).await {
            Ok(url) => Ok(url),
            Err(err) => {
                tracing::warn!(chapter_id, "narration failed: {err}");
                Ok(None)
            }
        }
    }

    /// A snapshot from an interrupted chapter that never became a scene.
    /// Stale snapshots are deleted.
    pub async fn recover_snapshot(&self) -> anyhow::Result<Option<RecoveredChapter>> {
        let Some(snapshot) = self
            .store
            .load_snapshot()
            .await
            .context("load streaming snapshot")?
        else {
            return Ok(None);
        };
        let pending = self
            .record
            .next_chapter()
            .ok()
            .flatten()
            .is_some_and(|next| next.id == snapshot.chapter_id);
        if !pending {
            tracing::debug!(chapter_id = snapshot.chapter_id, "dropping stale snapshot");
            self.store
                .clear_snapshot()
                .await
                .context("clear streaming snapshot")?;
            return Ok(None);
        }
        let html = render_streaming(&snapshot.raw_text);
        Ok(Some(RecoveredChapter { snapshot, html }))
    }

    /// The whole story with every image made portable.
    pub fn export_package(&self) -> ExportPackage {
        let blobs = self.backend.client.blobs();
        let portable = |url: &Option<String>| url.as_deref().and_then(|u| blobs.portable_url(u));
        ExportPackage {
            title: self.record.display_title().to_owned(),
            toc: self.record.toc.clone().unwrap_or_default(),
            chapters: self.record.chapters.clone(),
            scenes: self
                .record
                .scenes
                .iter()
                .map(|scene| Scene {
                    image_url: portable(&scene.image_url),
                    ..scene.clone()
                })
                .collect(),
            cover_url: portable(&self.record.cover_url),
            exported_at: chrono::Utc::now(),
        }
    }

    /// Sends the package to the archive endpoint. Failures are only logged.
    pub async fn archive(&self, package: &ExportPackage) {
        match self.backend.client.export_story(package).await {
            Ok(()) => tracing::info!(scenes = package.scenes.len(), "story archived"),
            Err(err) => tracing::warn!("archive story: {err}"),
        }
    }

    pub fn chapter_request(
        &self,
        chapter: &ChapterOutlineEntry,
        influence: Option<&str>,
    ) -> ChapterRequest {
        let seed = &self.record.seed;
        let length_hint = chapter_length_hint(&seed.age_range);
        ChapterRequest {
            context: ChapterContext {
                title: self.record.display_title().to_owned(),
                premise: seed.premise.clone(),
                toc: self.record.toc.clone().unwrap_or_default(),
                prior_html: self.record.scenes.iter().map(|s| s.html.clone()).collect(),
                age_range: seed.age_range.clone(),
                length_hint: length_hint.clone(),
                genre: seed.genre.clone(),
                keypoints: seed.keypoints.clone(),
                style: seed.style.clone(),
                chapter_length: seed.chapter_length.clone(),
            },
            chapter_index: chapter.id.saturating_sub(1),
            influence: Some(influence_text(seed, influence)),
            length_hint: Some(length_hint),
        }
    }

    pub fn image_prompt(&self, chapter: &ChapterOutlineEntry) -> String {
        let seed = &self.record.seed;
        format!(
            "{} (ages {}): Chapter {} - {}. Genre {}. Style {}.",
            self.record.display_title(),
            seed.age_range,
            chapter.id,
            chapter.heading,
            seed.genre,
            seed.style
        )
    }

    /// Generated image as a persistable URL, or `None` on any failure.
    async fn illustrate(&self, prompt: &str) -> Option<String> {
        match self.backend.client.gen_image(prompt).await {
            Ok(Some(url)) => {
                let portable = self.backend.client.blobs().portable_url(&url);
                if BlobStore::is_blob_ref(&url) {
                    self.backend.client.blobs().revoke(&url);
                }
                portable
            }
            Ok(None) => {
                tracing::warn!("image endpoint returned nothing");
                None
            }
            Err(err) => {
                tracing::warn!("image generation failed: {err}");
                None
            }
        }
    }

    /// Persisted image references that cannot resolve in this process are
    /// regenerated or cleared.
    async fn repair_images(&mut self) -> anyhow::Result<()> {
        let broken: Vec<u32> = self
            .record
            .scenes
            .iter()
            .filter(|s| s.image_url.as_deref().is_some_and(BlobStore::is_blob_ref))
            .map(|s| s.chapter_id)
            .collect();
        let broken_cover = self.record.cover_url.as_deref().is_some_and(BlobStore::is_blob_ref);
        if broken.is_empty() && !broken_cover {
            return Ok(());
        }

        for chapter_id in broken {
            let replacement = if self.config.regen_broken_images {
                let chapter = self.record.chapters.iter().find(|c| c.id == chapter_id).cloned();
                match chapter {
                    Some(chapter) => self.illustrate(&self.image_prompt(&chapter)).await,
                    None => None,
                }
            } else {
                None
            };
            tracing::info!(chapter_id, regenerated = replacement.is_some(), "repaired broken image");
            if let Some(scene) = self.record.scene_mut(chapter_id) {
                scene.image_url = replacement;
            }
        }
        if broken_cover {
            self.record.cover_url = None;
            if self.config.regen_broken_images {
                self.generate_cover().await?;
            }
        }
        self.persist().await
    }

    async fn persist(&self) -> anyhow::Result<()> {
        self.store
            .save_record(&self.record)
            .await
            .context("save session record")
    }
}

/// The per-chapter steering text: a context bracket, then the user's own
/// influence if any.
/// Outline request for `seed`, with defaults filled in.
pub fn seed_request(seed: &SeedParams) -> anyhow::Result<SeedRequest> {
    let title = seed.title.trim();
    let premise = seed.premise.trim();
    if title.is_empty() && premise.is_empty() {
        anyhow::bail!("Missing seed info. Provide a title or a premise.");
    }
    Ok(SeedRequest {
        title: if title.is_empty() { UNTITLED } else { title }.to_owned(),
        premise: if premise.is_empty() { title } else { premise }.to_owned(),
        prompt: [premise, title, UNTITLED]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or_default()
            .to_owned(),
        age_range: normalize_age_range(&seed.age_range).to_owned(),
        genre: seed.genre.clone(),
        chapters: seed.chapter_count.max(1),
        keypoints: Some(seed.keypoints.trim().to_owned()).filter(|k| !k.is_empty()),
        style: seed.style.clone(),
        policy_hint: POLICY_HINT.to_owned(),
    })
}

pub fn influence_text(seed: &SeedParams, influence: Option<&str>) -> String {
    let notes: String = seed.keypoints.chars().take(KEYPOINT_NOTES_LIMIT).collect();
    let bracket = format!(
        "[context: genre={}; age={}; style={}; notes={}]",
        seed.genre, seed.age_range, seed.style, notes
    );
    match influence.map(str::trim).filter(|s| !s.is_empty()) {
        Some(extra) => format!("{bracket} {extra}"),
        None => bracket,
    }
}

/// Visible text of chapter HTML, for narration.
pub fn plain_text(html: &str) -> String {
    let text = BLOCK_BREAK.replace_all(html, " ");
    let text = TAG.replace_all(&text, "");
    let text = decode_entities(&text);
    WHITESPACE.replace_all(&text, " ").trim().to_owned()
}
