mod webhook_stub;

use std::fs;
use std::path::Path;

use predicates::prelude::*;
use serde_json::{json, Value};
use webhook_stub::{Reply, WebhookStub};

const TOC: &str = "Table of Contents\n1. The Lost Map - Mia finds a map\n2. Into the Woods: The trail";

fn storyforge(stub: &WebhookStub, data_dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("storyforge");
    cmd.env("STORYFORGE_BASE_URL", &stub.base_url)
        .env_remove("STORYFORGE_USER")
        .env_remove("STORYFORGE_PASS")
        .env_remove("STORYFORGE_REFUSAL_PHRASES")
        .env_remove("RUST_LOG")
        .arg("--data-dir")
        .arg(data_dir);
    cmd
}

fn ndjson(records: &[Value]) -> String {
    records.iter().map(|r| format!("{r}\n")).collect()
}

fn session_record(data_dir: &Path) -> Value {
    let raw = fs::read_to_string(data_dir.join("storyforge.session.v1.json")).expect("session record");
    serde_json::from_str(&raw).expect("session json")
}

fn seed(stub: &WebhookStub, data_dir: &Path) {
    storyforge(stub, data_dir)
        .args(["seed", "--title", "Moon Fox", "--premise", "A fox steals the moon", "--chapters", "3"])
        .assert()
        .success();
}

#[test]
fn seed_stream_chapter_and_export_book() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let data = temp.path().join("data");
    let chapter = ndjson(&[
        json!({"type": "begin"}),
        json!({"type": "item", "content": "# Chapter 1: The Lost Map\n\n"}),
        json!({"type": "item", "content": "Mia **found** a map."}),
        json!({"type": "end"}),
    ]);
    let stub = WebhookStub::spawn(vec![
        ("seedStory", vec![Reply::json(json!([{ "output": TOC }]))]),
        ("genImage", vec![Reply::json(json!({"url": "https://cdn.test/img.png"}))]),
        ("expandChapter", vec![Reply::with_type("application/x-ndjson", chapter)]),
    ]);

    storyforge(&stub, &data)
        .args(["seed", "--title", "Moon Fox", "--premise", "A fox steals the moon", "--chapters", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1. The Lost Map\n   Mia finds a map\n"))
        .stdout(predicate::str::contains("2. Into the Woods\n   The trail\n"))
        .stdout(predicate::str::contains("3. Chapter 3\n"));

    let record = session_record(&data);
    assert_eq!(record["chapters"].as_array().map(Vec::len), Some(3));
    assert_eq!(record["coverUrl"], "https://cdn.test/img.png");
    assert_eq!(record["title"], "Moon Fox");

    let session_id = fs::read_to_string(data.join("storyforge.sessionId.v1"))?;
    let seeds = stub.received_for("seedStory");
    assert_eq!(seeds.len(), 1);
    assert_eq!(seeds[0].body["sessionId"], session_id.trim());
    assert_eq!(seeds[0].body["chapters"], 3);
    assert_eq!(seeds[0].body["prompt"], "A fox steals the moon");
    assert!(seeds[0].body["policyHint"].as_str().unwrap_or_default().contains("Fictionalize"));

    storyforge(&stub, &data)
        .args(["chapter", "--influence", "more owls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Chapter 1: The Lost Map"))
        .stdout(predicate::str::contains("Mia found a map."));
    assert!(!data.join("storyforge.streaming.v1.json").exists());

    let requests = stub.received_for("expandChapter");
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.accept.as_deref().unwrap_or_default().starts_with("application/x-ndjson"));
    assert_eq!(request.body["chapterIndex"], 0);
    assert_eq!(request.body["context"]["ageRange"], "6-8");
    assert!(request.body["context"]["toc"].as_str().unwrap_or_default().contains("The Lost Map"));
    let influence = request.body["influence"].as_str().unwrap_or_default();
    assert!(influence.starts_with("[context: genre=fantasy; age=6-8;"));
    assert!(influence.ends_with("] more owls"));

    let image_prompts: Vec<String> = stub
        .received_for("genImage")
        .iter()
        .filter_map(|r| r.body["prompt"].as_str().map(str::to_owned))
        .collect();
    assert!(image_prompts
        .iter()
        .any(|p| p.starts_with("Moon Fox (ages 6-8): Chapter 1 - The Lost Map. Genre fantasy.")));

    let book = temp.path().join("out").join("book.html");
    storyforge(&stub, &data)
        .args(["export", "--out"])
        .arg(&book)
        .assert()
        .success();
    let html = fs::read_to_string(&book)?;
    assert!(html.contains("<h2>Chapter 1: The Lost Map</h2>"));
    assert!(html.contains("<a href=\"#chapter-1\">1. The Lost Map</a>"));
    assert!(!html.contains("href=\"#chapter-3\""));
    assert!(html.contains("src=\"https://cdn.test/img.png\""));
    assert!(html.contains("<span class=\"word\">found</span>"));

    storyforge(&stub, &data)
        .args(["export", "--out"])
        .arg(&book)
        .assert()
        .failure();
    storyforge(&stub, &data)
        .args(["export", "--force", "--out"])
        .arg(&book)
        .assert()
        .success();
    Ok(())
}

#[test]
fn event_stream_chapter_then_rewind() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let data = temp.path().join("data");
    let sse = "event: message\n\
data: {\"type\":\"item\",\"content\":\"Once upon \"}\n\n\
: keep-alive\n\
data: \"a time.\"\n\n\
data: [DONE]\n\n";
    let stub = WebhookStub::spawn(vec![
        ("seedStory", vec![Reply::json(json!({ "toc": TOC }))]),
        ("genImage", vec![Reply::error(500, "no gpu")]),
        ("expandChapter", vec![Reply::with_type("text/event-stream", sse)]),
    ]);
    seed(&stub, &data);

    storyforge(&stub, &data)
        .arg("chapter")
        .assert()
        .success()
        .stdout(predicate::str::contains("Chapter 1: The Lost Map"))
        .stdout(predicate::str::contains("Once upon a time."))
        .stdout(predicate::str::contains("The End").not())
        .stderr(predicate::str::contains("no illustration"));
    let record = session_record(&data);
    assert_eq!(record["scenes"].as_array().map(Vec::len), Some(1));
    assert!(record["scenes"][0]["imageUrl"].is_null());

    storyforge(&stub, &data)
        .arg("rewind")
        .assert()
        .success()
        .stdout(predicate::str::contains("removed chapter 1"));
    assert_eq!(session_record(&data)["scenes"].as_array().map(Vec::len), Some(0));

    storyforge(&stub, &data)
        .arg("rewind")
        .assert()
        .success()
        .stdout(predicate::str::contains("no chapters to remove"));
    Ok(())
}

#[test]
fn one_shot_chapter_uses_html_payload() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let data = temp.path().join("data");
    let stub = WebhookStub::spawn(vec![
        ("seedStory", vec![Reply::json(json!({ "toc": TOC }))]),
        ("genImage", vec![Reply::with_type("image/png", vec![0x89, 0x50, 0x4e, 0x47])]),
        (
            "expandChapter",
            vec![Reply::json(json!({"html": "<p>Chapter 1: Dawn</p><p>The sun rose.</p>"}))],
        ),
    ]);
    seed(&stub, &data);
    assert!(session_record(&data)["coverUrl"]
        .as_str()
        .unwrap_or_default()
        .starts_with("data:image/png;base64,"));

    storyforge(&stub, &data)
        .args(["chapter", "--no-stream"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Chapter 1: Dawn"))
        .stdout(predicate::str::contains("The sun rose."))
        .stdout(predicate::str::contains("<inline image/png"));

    let requests = stub.received_for("expandChapter");
    assert!(!requests[0].accept.as_deref().unwrap_or_default().contains("x-ndjson"));
    assert_eq!(
        session_record(&data)["scenes"][0]["imageUrl"],
        "data:image/png;base64,iVBORw=="
    );
    Ok(())
}

#[test]
fn one_shot_plain_text_stays_escaped() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let data = temp.path().join("data");
    let stub = WebhookStub::spawn(vec![
        ("seedStory", vec![Reply::json(json!({ "toc": "1. Supper" }))]),
        ("genImage", vec![Reply::with_type("text/plain", "")]),
        (
            "expandChapter",
            vec![Reply::with_type("text/plain", "Fish & chips, 1 < 2.\n\nThe end.")],
        ),
    ]);
    storyforge(&stub, &data)
        .args(["seed", "--title", "Supper", "--chapters", "1"])
        .assert()
        .success();

    storyforge(&stub, &data)
        .args(["chapter", "--no-stream"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Fish & chips, 1 < 2. The end."))
        .stdout(predicate::str::contains("The End. Every chapter"));

    let html = session_record(&data)["scenes"][0]["html"]
        .as_str()
        .unwrap_or_default()
        .to_owned();
    assert!(html.contains("</span> &amp; <span"), "{html}");
    assert!(html.contains("</span> &lt; <span"), "{html}");
    assert!(!html.contains(" & "), "{html}");
    assert!(!html.contains(" < "), "{html}");
    Ok(())
}

#[test]
fn refusal_keeps_previous_outline() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let data = temp.path().join("data");
    let stub = WebhookStub::spawn(vec![
        (
            "seedStory",
            vec![
                Reply::json(json!({ "toc": TOC })),
                Reply::with_type("text/plain", "I cannot create a story seed about that."),
            ],
        ),
        ("genImage", vec![Reply::json(json!({"url": "https://cdn.test/c.png"}))]),
    ]);
    seed(&stub, &data);
    let before = session_record(&data);

    storyforge(&stub, &data)
        .args(["seed", "--title", "Something else", "--chapters", "5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Please retry"));
    assert_eq!(session_record(&data), before);
    Ok(())
}

#[test]
fn endpoint_error_is_reported() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let stub = WebhookStub::spawn(vec![("seedStory", vec![Reply::error(500, "")])]);
    storyforge(&stub, temp.path())
        .args(["seed", "--title", "Moon Fox"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Endpoint error 500"));
    assert!(!temp.path().join("storyforge.session.v1.json").exists());
    Ok(())
}

#[test]
fn chapter_before_outline_fails() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let stub = WebhookStub::spawn(vec![]);
    storyforge(&stub, temp.path())
        .arg("chapter")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no outline yet"));
    Ok(())
}

#[test]
fn prime_fills_seed_and_uses_basic_auth() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let output = r#"({"title":"Moon Fox","ageRange":"teen","chapters":"4","genre":"Mystery"})"#;
    let stub = WebhookStub::spawn(vec![
        ("seedInfo", vec![Reply::json(json!([{ "output": output }]))]),
        ("seedStory", vec![Reply::json(json!({ "toc": TOC }))]),
        ("genImage", vec![Reply::with_type("text/plain", "")]),
    ]);

    storyforge(&stub, temp.path())
        .env("STORYFORGE_USER", "reader")
        .env("STORYFORGE_PASS", "secret")
        .args(["prime", "--prompt", "a fox who steals the moon"])
        .assert()
        .success()
        .stdout(predicate::str::contains("title: Moon Fox"))
        .stdout(predicate::str::contains("age range: 16-20"))
        .stdout(predicate::str::contains("chapters: 4"))
        .stdout(predicate::str::contains("premise: a fox who steals the moon"));
    let auth = stub.received_for("seedInfo")[0].authorization.clone();
    assert!(auth.unwrap_or_default().starts_with("Basic "));

    storyforge(&stub, temp.path())
        .arg("seed")
        .assert()
        .success()
        .stdout(predicate::str::contains("4. Chapter 4"));
    let body = &stub.received_for("seedStory")[0].body;
    assert_eq!(body["title"], "Moon Fox");
    assert_eq!(body["genre"], "Mystery");
    assert_eq!(body["ageRange"], "16-20");
    assert_eq!(body["chapters"], 4);
    assert!(stub.received_for("seedStory")[0].authorization.is_none());
    Ok(())
}

#[test]
fn narrate_writes_audio_bytes() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let data = temp.path().join("data");
    let stub = WebhookStub::spawn(vec![
        ("seedStory", vec![Reply::json(json!({ "toc": TOC }))]),
        ("genImage", vec![Reply::json(json!({"url": "https://cdn.test/i.png"}))]),
        ("expandChapter", vec![Reply::with_type("text/plain", "# Chapter 1: Map\n\nMia ran.")]),
        ("voiceforge", vec![Reply::with_type("audio/mpeg", b"ID3audio".to_vec())]),
    ]);
    seed(&stub, &data);
    storyforge(&stub, &data).arg("chapter").assert().success();

    let out = temp.path().join("audio").join("ch1.mp3");
    storyforge(&stub, &data)
        .args(["narrate", "--chapter", "1", "--out"])
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("8 bytes"));
    assert_eq!(fs::read(&out)?, b"ID3audio");
    let prompt = stub.received_for("voiceforge")[0].body["prompt"].clone();
    assert_eq!(prompt, "Map. Mia ran.");

    storyforge(&stub, &data)
        .args(["narrate", "--chapter", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("has not been written yet"));
    Ok(())
}

#[test]
fn new_rotates_session_and_clears_story() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let stub = WebhookStub::spawn(vec![
        ("seedStory", vec![Reply::json(json!({ "toc": TOC }))]),
        ("genImage", vec![Reply::json(json!({"url": "https://cdn.test/c.png"}))]),
    ]);
    seed(&stub, temp.path());
    let first = fs::read_to_string(temp.path().join("storyforge.sessionId.v1"))?;

    storyforge(&stub, temp.path())
        .arg("new")
        .assert()
        .success()
        .stdout(predicate::str::contains("new story session"));
    let second = fs::read_to_string(temp.path().join("storyforge.sessionId.v1"))?;
    assert_ne!(first.trim(), second.trim());
    assert!(!temp.path().join("storyforge.session.v1.json").exists());
    Ok(())
}

#[test]
fn missing_base_url_is_a_config_error() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("storyforge");
    cmd.env_remove("STORYFORGE_BASE_URL")
        .arg("--data-dir")
        .arg(temp.path())
        .arg("rewind")
        .assert()
        .failure()
        .stderr(predicate::str::contains("STORYFORGE_BASE_URL"));
}
