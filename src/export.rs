use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context as _;
use regex::Regex;

use crate::client::ExportPackage;
use crate::entities::{escape_attr, escape_html};

pub const DEFAULT_FILE_STEM: &str = "storybook";

static UNSAFE_FILE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[^a-z0-9\- _()\[\]]+").expect("valid file name regex"));

const STYLE: &str = "body{font-family:Georgia,serif;max-width:46rem;margin:2rem auto;padding:0 1rem;line-height:1.6;color:#3b2a12;background:#fffaf0}\
img{max-width:100%;border-radius:12px}\
nav ol{padding-left:1.25rem}\
article{margin-top:3rem}";

/// Output file name for a book title: each run of unsafe characters becomes
/// one `_`.
pub fn file_name(title: &str) -> String {
    let safe = UNSAFE_FILE_CHARS.replace_all(title, "_");
    let stem = match safe.trim() {
        "" => DEFAULT_FILE_STEM,
        stem => stem,
    };
    format!("{stem}.html")
}

/// Standalone HTML document for the whole story.
///
/// Image URLs are used as given; callers pass a package whose blob
/// references were already made portable.
pub fn render_book(package: &ExportPackage) -> String {
    let title = escape_html(&package.title);
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str(&format!("<title>{title}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n"));
    html.push_str(&format!("<header>\n<h1>{title}</h1>\n"));
    if let Some(cover) = package.cover_url.as_deref().filter(|u| !is_blob(u)) {
        html.push_str(&format!(
            "<img class=\"cover\" src=\"{}\" alt=\"{}\">\n",
            escape_attr(cover),
            escape_attr(&package.title)
        ));
    }
    html.push_str("</header>\n");

    // Only written chapters have an anchor to link to.
    if !package.scenes.is_empty() {
        html.push_str("<nav>\n<h2>Table of Contents</h2>\n<ol>\n");
        for scene in &package.scenes {
            html.push_str(&format!(
                "<li><a href=\"#chapter-{id}\">{id}. {}</a></li>\n",
                escape_html(&scene.chapter_heading),
                id = scene.chapter_id,
            ));
        }
        html.push_str("</ol>\n</nav>\n");
    }

    for scene in &package.scenes {
        let heading = escape_html(&scene.chapter_heading);
        html.push_str(&format!("<article id=\"chapter-{}\">\n", scene.chapter_id));
        html.push_str(&format!("<h2>Chapter {}: {heading}</h2>\n", scene.chapter_id));
        if let Some(image) = scene.image_url.as_deref().filter(|u| !is_blob(u)) {
            html.push_str(&format!(
                "<img src=\"{}\" alt=\"{}\">\n",
                escape_attr(image),
                escape_attr(&scene.chapter_heading)
            ));
        }
        html.push_str(&scene.html);
        html.push_str("\n</article>\n");
    }

    html.push_str(&format!(
        "<footer><small>Exported {}</small></footer>\n</body>\n</html>\n",
        package.exported_at.format("%Y-%m-%d %H:%M UTC")
    ));
    html
}

fn is_blob(url: &str) -> bool {
    crate::blob::BlobStore::is_blob_ref(url)
}

/// Writes the document, refusing to replace an existing file unless `force`.
pub fn write_book(out: &Path, html: &str, force: bool) -> anyhow::Result<()> {
    if let Some(parent) = out.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create export output dir: {}", parent.display()))?;
    }

    let mut options = OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let mut file = options
        .open(out)
        .with_context(|| format!("open output: {}", out.display()))?;
    file.write_all(html.as_bytes())
        .with_context(|| format!("write output: {}", out.display()))?;
    file.flush()
        .with_context(|| format!("flush output: {}", out.display()))?;
    Ok(())
}
