use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Directory holding the session record, streaming snapshot and session id.
    #[arg(long, global = true, default_value = ".storyforge")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a new story with a fresh session id.
    New,
    /// Infer seed parameters from a free-text idea.
    Prime(PrimeArgs),
    /// Request an outline and replace the current one.
    Seed(SeedArgs),
    /// Write the next chapter.
    Chapter(ChapterArgs),
    /// Drop the most recently written chapter.
    Rewind,
    /// Generate a new illustration for a written chapter.
    RegenImage(ChapterSelectArgs),
    /// Synthesize narration for a written chapter.
    Narrate(NarrateArgs),
    /// Write the story as a standalone HTML book.
    Export(ExportArgs),
    /// Render a markdown or streamed text file (offline).
    Render(RenderArgs),
    /// Parse a table-of-contents file (offline).
    Outline(OutlineArgs),
}

#[derive(Debug, Args)]
pub struct PrimeArgs {
    /// Free-text story idea.
    #[arg(long)]
    pub prompt: String,
}

#[derive(Debug, Args)]
pub struct SeedArgs {
    /// Book title (default: the primed title).
    #[arg(long)]
    pub title: Option<String>,

    /// Story premise (default: the primed description).
    #[arg(long)]
    pub premise: Option<String>,

    /// Reader age range, e.g. `6-8` or `teen`.
    #[arg(long)]
    pub age_range: Option<String>,

    #[arg(long)]
    pub genre: Option<String>,

    /// Number of chapters in the outline.
    #[arg(long)]
    pub chapters: Option<u32>,

    /// Elements the story must include.
    #[arg(long)]
    pub keypoints: Option<String>,

    #[arg(long)]
    pub style: Option<String>,

    /// Chapter length preference, e.g. `short`.
    #[arg(long)]
    pub chapter_length: Option<String>,
}

#[derive(Debug, Args)]
pub struct ChapterArgs {
    /// Steering text for this chapter only.
    #[arg(long)]
    pub influence: Option<String>,

    /// Use the one-shot endpoint instead of streaming.
    #[arg(long)]
    pub no_stream: bool,
}

#[derive(Debug, Args)]
pub struct ChapterSelectArgs {
    /// Chapter id (1-based).
    #[arg(long)]
    pub chapter: u32,
}

#[derive(Debug, Args)]
pub struct NarrateArgs {
    /// Chapter id (1-based).
    #[arg(long)]
    pub chapter: u32,

    /// Write the audio to this file instead of printing its URL.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Output file path (default: derived from the title).
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Overwrite an existing output file.
    #[arg(long)]
    pub force: bool,

    /// Also send the story package to the archive endpoint.
    #[arg(long)]
    pub archive: bool,
}

#[derive(Debug, Args)]
pub struct RenderArgs {
    /// Input text file.
    #[arg(long)]
    pub input: PathBuf,

    /// Render as a completed chapter.
    #[arg(long = "final")]
    pub final_render: bool,
}

#[derive(Debug, Args)]
pub struct OutlineArgs {
    /// Input text file.
    #[arg(long)]
    pub input: PathBuf,

    /// Pad or truncate to this many chapters.
    #[arg(long)]
    pub chapters: Option<u32>,
}
