use std::io::Write as _;
use std::path::Path;

use anyhow::Context as _;

use crate::blob::{decode_data_url, BlobStore};
use crate::cli::{
    ChapterArgs, ChapterSelectArgs, ExportArgs, NarrateArgs, OutlineArgs, PrimeArgs, RenderArgs,
    SeedArgs,
};
use crate::client::WebhookClient;
use crate::config::Config;
use crate::export::{file_name, render_book, write_book};
use crate::outline::{normalize_toc_text, parse_toc, reconcile, ChapterOutlineEntry};
use crate::render::{finalize_chapter_html, render, RenderMode};
use crate::session::{LocalFsSessionStore, SessionContext};
use crate::story::{plain_text, ChapterFrame, ChapterOptions, ChapterProgress, StoryFlow};

async fn open_flow(data_dir: &Path) -> anyhow::Result<StoryFlow> {
    let config = Config::from_env().context("load config")?;
    let store = LocalFsSessionStore::new(data_dir);
    let session = SessionContext::load_or_create(&store)
        .await
        .context("load session id")?;
    tracing::debug!(session_id = session.id(), data_dir = %data_dir.display(), "opening story");
    let client = WebhookClient::new(&config, BlobStore::new(), session)?;
    StoryFlow::open(client, Box::new(store), config).await
}

pub async fn new_story(data_dir: &Path) -> anyhow::Result<()> {
    let mut flow = open_flow(data_dir).await?;
    let session = flow.start_new().await?;
    println!("new story session {}", session.id());
    Ok(())
}

pub async fn prime(data_dir: &Path, args: PrimeArgs) -> anyhow::Result<()> {
    let mut flow = open_flow(data_dir).await?;
    flow.prime(&args.prompt).await?;
    let seed = &flow.record().seed;
    println!("title: {}", seed.title);
    println!("premise: {}", seed.premise);
    println!("age range: {}", seed.age_range);
    println!("genre: {}", seed.genre);
    println!("chapters: {}", seed.chapter_count);
    println!("style: {}", seed.style);
    if !seed.keypoints.is_empty() {
        println!("keypoints: {}", seed.keypoints);
    }
    Ok(())
}

pub async fn seed(data_dir: &Path, args: SeedArgs) -> anyhow::Result<()> {
    let mut flow = open_flow(data_dir).await?;
    let mut seed = flow.record().seed.clone();
    let overrides = [
        (&mut seed.title, args.title),
        (&mut seed.premise, args.premise),
        (&mut seed.age_range, args.age_range),
        (&mut seed.genre, args.genre),
        (&mut seed.keypoints, args.keypoints),
        (&mut seed.style, args.style),
        (&mut seed.chapter_length, args.chapter_length),
    ];
    for (field, value) in overrides {
        if let Some(value) = value {
            *field = value;
        }
    }
    if let Some(chapters) = args.chapters {
        seed.chapter_count = chapters;
    }

    let chapters = flow.seed_outline(seed).await?;
    print_outline(chapters);
    Ok(())
}

pub async fn chapter(data_dir: &Path, args: ChapterArgs) -> anyhow::Result<()> {
    let mut flow = open_flow(data_dir).await?;

    if let Some(recovered) = flow.recover_snapshot().await? {
        eprintln!(
            "recovered partial chapter {} ({}); regenerating it:",
            recovered.snapshot.chapter_id, recovered.snapshot.chapter_heading
        );
        eprintln!("{}", plain_text(&recovered.html));
    }

    let guard = tokio::spawn(interrupt_guard());
    let options = ChapterOptions {
        influence: args.influence,
        one_shot: args.no_stream,
    };
    let mut progress = TerminalProgress::default();
    let result = flow.next_chapter(options, &mut progress).await;
    guard.abort();
    if progress.printed > 0 {
        eprintln!();
    }
    let scene = result?;

    println!("Chapter {}: {}", scene.chapter_id, scene.chapter_heading);
    if let Some(url) = &scene.image_url {
        println!("illustration: {}", abbreviate_url(url));
    }
    println!();
    println!("{}", plain_text(&scene.html));
    if flow.record().is_complete() {
        println!();
        println!("The End. Every chapter of the outline is written; run `storyforge export` next.");
    }
    Ok(())
}

/// First Ctrl-C only warns; the second one aborts.
async fn interrupt_guard() {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("\nchapter generation in progress; partial text is saved. press Ctrl-C again to abort");
    if tokio::signal::ctrl_c().await.is_ok() {
        std::process::exit(130);
    }
}

/// Echoes newly streamed text to stderr as it arrives.
#[derive(Default)]
struct TerminalProgress {
    shown: String,
    printed: usize,
}

impl ChapterProgress for TerminalProgress {
    fn on_image(&mut self, chapter_id: u32, image_url: Option<&str>) {
        match image_url {
            Some(url) => eprintln!("chapter {chapter_id} illustration: {}", abbreviate_url(url)),
            None => eprintln!("chapter {chapter_id}: no illustration"),
        }
    }

    fn on_frame(&mut self, frame: &ChapterFrame) {
        let text = plain_text(&frame.html);
        // Text can shrink or change when a construct closes; only append.
        if let Some(tail) = text.strip_prefix(self.shown.as_str()) {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{tail}");
            let _ = stderr.flush();
            self.printed += tail.len();
            self.shown = text;
        }
    }
}

fn abbreviate_url(url: &str) -> String {
    if url.starts_with("data:") {
        let mime = url
            .strip_prefix("data:")
            .and_then(|rest| rest.split([';', ',']).next())
            .unwrap_or_default();
        return format!("<inline {mime}, {} bytes>", url.len());
    }
    url.to_owned()
}

pub async fn rewind(data_dir: &Path) -> anyhow::Result<()> {
    let mut flow = open_flow(data_dir).await?;
    match flow.rewind().await? {
        Some(scene) => println!("removed chapter {}: {}", scene.chapter_id, scene.chapter_heading),
        None => println!("no chapters to remove"),
    }
    Ok(())
}

pub async fn regen_image(data_dir: &Path, args: ChapterSelectArgs) -> anyhow::Result<()> {
    let mut flow = open_flow(data_dir).await?;
    match flow.regenerate_image(args.chapter).await? {
        Some(url) => println!("chapter {} illustration: {}", args.chapter, abbreviate_url(&url)),
        None => println!("chapter {}: illustration unchanged", args.chapter),
    }
    Ok(())
}

pub async fn narrate(data_dir: &Path, args: NarrateArgs) -> anyhow::Result<()> {
    let flow = open_flow(data_dir).await?;
    let Some(url) = flow.narrate(args.chapter).await? else {
        println!("chapter {}: no narration", args.chapter);
        return Ok(());
    };

    let blobs = flow.client().blobs();
    let Some(out) = args.out else {
        let portable = blobs.portable_url(&url).unwrap_or(url);
        println!("{}", abbreviate_url(&portable));
        return Ok(());
    };

    let bytes = match blobs.get(&url) {
        Some(blob) => blob.bytes.clone(),
        None => match decode_data_url(&url) {
            Some(blob) => blob.bytes,
            None => {
                println!("{url}");
                anyhow::bail!("narration is a remote URL; nothing written to {}", out.display());
            }
        },
    };
    if let Some(parent) = out.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }
    std::fs::write(&out, &bytes).with_context(|| format!("write audio: {}", out.display()))?;
    println!("wrote {} ({} bytes)", out.display(), bytes.len());
    Ok(())
}

pub async fn export(data_dir: &Path, args: ExportArgs) -> anyhow::Result<()> {
    let flow = open_flow(data_dir).await?;
    if flow.record().chapters.is_empty() {
        anyhow::bail!("nothing to export; seed the story first");
    }
    let package = flow.export_package();
    let out = args
        .out
        .unwrap_or_else(|| file_name(&package.title).into());
    write_book(&out, &render_book(&package), args.force)?;
    tracing::info!(out = %out.display(), scenes = package.scenes.len(), "exported book");
    if args.archive {
        flow.archive(&package).await;
    }
    println!("{}", out.display());
    Ok(())
}

pub fn render_file(args: RenderArgs) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&args.input)
        .with_context(|| format!("read input: {}", args.input.display()))?;
    let html = if args.final_render {
        finalize_chapter_html(&raw)
    } else {
        render(&raw, RenderMode::Streaming)
    };
    println!("{html}");
    Ok(())
}

pub fn outline_file(args: OutlineArgs) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&args.input)
        .with_context(|| format!("read input: {}", args.input.display()))?;
    let parsed = parse_toc(&normalize_toc_text(&raw));
    let chapters = match args.chapters {
        Some(count) => reconcile(parsed, count as usize),
        None => parsed,
    };
    if chapters.is_empty() {
        anyhow::bail!("no chapters found in {}", args.input.display());
    }
    print_outline(&chapters);
    Ok(())
}

fn print_outline(chapters: &[ChapterOutlineEntry]) {
    for chapter in chapters {
        println!("{}. {}", chapter.id, chapter.heading);
        if let Some(synopsis) = &chapter.synopsis {
            println!("   {synopsis}");
        }
    }
}
