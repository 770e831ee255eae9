//! Strip Markdown from model output before it is spoken.

use regex::Regex;
use std::sync::LazyLock;

static FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.*?)\*\*|__(.*?)__").unwrap());
static ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\n]+)\*|\b_([^_\n]+)_\b").unwrap());
static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#+[ \t]*").unwrap());
static RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:-{3,}|_{3,}|\*{3,})[ \t]*$").unwrap());
static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*[-*+][ \t]+").unwrap());
static NUMBERED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*\d+\.[ \t]+").unwrap());
static QUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^>[ \t]?").unwrap());
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

pub fn strip_markdown(text: &str) -> String {
    let text = FENCED_CODE.replace_all(text, "");
    // Rules before bullets, otherwise `***` reads as a bullet.
    let text = RULE.replace_all(&text, "");
    let text = BOLD.replace_all(&text, "$1$2");
    let text = ITALIC.replace_all(&text, "$1$2");
    let text = HEADING.replace_all(&text, "");
    let text = BULLET.replace_all(&text, "");
    let text = NUMBERED.replace_all(&text, "");
    let text = QUOTE.replace_all(&text, "");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = BLANK_RUNS.replace_all(&text, "\n\n");
    text.trim().to_string()
}
