use std::fmt::Write as _;

use time::macros::format_description;
use time::{Duration, OffsetDateTime};
use unicode_segmentation::UnicodeSegmentation;

use crate::search::SearchResults;
use crate::store::{LinkMetadata, Post, PostId};

const SHORT_ID_LEN: usize = 8;

pub fn short_id(id: PostId) -> String {
    let mut simple = id.simple().to_string();
    simple.truncate(SHORT_ID_LEN);
    simple
}

/// "just now", "5 minutes ago", "1 hour ago", then an absolute date once a
/// post is a day old.
pub fn time_ago(timestamp: OffsetDateTime, now: OffsetDateTime) -> String {
    let elapsed = now - timestamp;
    if elapsed < Duration::minutes(1) {
        return "just now".to_string();
    }
    if elapsed < Duration::hours(1) {
        let minutes = elapsed.whole_minutes();
        return format!("{minutes} {} ago", plural(minutes, "minute"));
    }
    if elapsed < Duration::hours(24) {
        let hours = elapsed.whole_hours();
        return format!("{hours} {} ago", plural(hours, "hour"));
    }
    let format = format_description!(
        "[month repr:short] [day padding:none], [year] at [hour repr:12 padding:none]:[minute] [period]"
    );
    timestamp
        .format(&format)
        .unwrap_or_else(|_| timestamp.unix_timestamp().to_string())
}

fn plural(count: i64, unit: &str) -> String {
    if count == 1 {
        unit.to_string()
    } else {
        format!("{unit}s")
    }
}

/// Shortens `text` to at most `limit` grapheme clusters (0 = no limit).
pub fn truncate(text: &str, limit: usize) -> String {
    if limit == 0 {
        return text.to_string();
    }
    let mut graphemes = text.graphemes(true);
    let kept: String = graphemes.by_ref().take(limit).collect();
    if graphemes.next().is_some() {
        format!("{}...", kept.trim_end())
    } else {
        kept
    }
}

pub fn format_timeline(posts: &[Post], preview_chars: usize, now: OffsetDateTime) -> String {
    if posts.is_empty() {
        return "No scribs yet. Post one with `scrib post <text>`.\n".to_string();
    }
    let mut out = String::new();
    for post in posts {
        write_entry(&mut out, post, preview_chars, now);
    }
    out
}

pub fn format_search(results: &SearchResults<'_>, preview_chars: usize, now: OffsetDateTime) -> String {
    match results {
        SearchResults::NoQuery => "Type something to search your scribs.\n".to_string(),
        SearchResults::Matches(found) if found.is_empty() => "No matches found.\n".to_string(),
        SearchResults::Matches(found) => {
            let mut out = String::new();
            for post in found {
                write_entry(&mut out, post, preview_chars, now);
            }
            out
        }
    }
}

pub fn format_post(post: &Post, now: OffsetDateTime) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "#{}  {}", short_id(post.id), time_ago(post.timestamp, now));
    let _ = writeln!(&mut out, "id      {}", post.id);
    for line in post.content.lines() {
        let _ = writeln!(&mut out, "    {line}");
    }
    if let Some(meta) = &post.link_metadata {
        let _ = writeln!(&mut out, "link    {}", meta.url);
        if let Some(title) = &meta.title {
            let _ = writeln!(&mut out, "title   {title}");
        }
        if let Some(description) = &meta.description {
            let _ = writeln!(&mut out, "about   {description}");
        }
        let _ = writeln!(
            &mut out,
            "images  preview {}, icon {}",
            byte_label(meta.preview_image.as_deref()),
            byte_label(meta.site_icon.as_deref())
        );
    }
    out
}

fn write_entry(out: &mut String, post: &Post, preview_chars: usize, now: OffsetDateTime) {
    let _ = writeln!(out, "#{}  {}", short_id(post.id), time_ago(post.timestamp, now));
    for line in truncate(&post.content, preview_chars).lines() {
        let _ = writeln!(out, "    {line}");
    }
    if let Some(meta) = &post.link_metadata {
        let _ = writeln!(out, "    -> {}", link_label(meta));
    }
    out.push('\n');
}

fn link_label(meta: &LinkMetadata) -> String {
    let host = meta.host().unwrap_or_default();
    match &meta.title {
        Some(title) => format!("{title} ({host})"),
        None => host.to_string(),
    }
}

fn byte_label(bytes: Option<&[u8]>) -> String {
    match bytes {
        Some(bytes) => format!("{} bytes", bytes.len()),
        None => "none".to_string(),
    }
}
