use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use once_cell::sync::Lazy;
use regex::{Captures, Regex, RegexBuilder};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::redirect::Policy;
use url::Url;

use super::{LinkPreviewer, PageMetadata, PreviewError};
use crate::config::EnrichmentConfig;

const MAX_REDIRECTS: usize = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
// How much of the document is searched for a `<meta charset>` declaration.
const CHARSET_SNIFF_BYTES: usize = 1024;

// Quoted attribute values may contain `>`.
static META_TAG: Lazy<Regex> =
    Lazy::new(|| case_insensitive(r#"<meta\b(?:[^>"']|"[^"]*"|'[^']*')*>"#));
static LINK_TAG: Lazy<Regex> =
    Lazy::new(|| case_insensitive(r#"<link\b(?:[^>"']|"[^"]*"|'[^']*')*>"#));
static META_CHARSET: Lazy<Regex> =
    Lazy::new(|| case_insensitive(r#"<meta\b[^>]*?charset\s*=\s*["']?\s*([a-z0-9_:.-]+)"#));
static TITLE_TAG: Lazy<Regex> = Lazy::new(|| case_insensitive(r"(?s)<title[^>]*>(.*?)</title>"));
static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    case_insensitive(r#"([a-z_:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
});
static ENTITY: Lazy<Regex> =
    Lazy::new(|| case_insensitive(r"&(#x[0-9a-f]+|#[0-9]+|amp|lt|gt|quot|apos|nbsp);"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| case_insensitive(r"\s+"));

fn case_insensitive(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("valid html pattern")
}

/// Fetches pages over HTTP and reads their OpenGraph, Twitter card and plain
/// HTML metadata.
#[derive(Clone)]
pub struct HttpPreviewer {
    client: reqwest::Client,
    max_page_bytes: usize,
    max_image_bytes: usize,
}

impl HttpPreviewer {
    pub fn new(config: &EnrichmentConfig) -> Result<Self, PreviewError> {
        Self::with_builder(config, reqwest::Client::builder())
    }

    fn with_builder(
        config: &EnrichmentConfig,
        builder: reqwest::ClientBuilder,
    ) -> Result<Self, PreviewError> {
        let client = builder
            .user_agent(config.user_agent.as_str())
            .redirect(Policy::limited(MAX_REDIRECTS))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            max_page_bytes: config.max_page_bytes,
            max_image_bytes: config.max_image_bytes,
        })
    }

    async fn read_capped(
        mut response: reqwest::Response,
        limit: usize,
        truncate: bool,
    ) -> Result<Vec<u8>, PreviewError> {
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                if truncate {
                    body.extend_from_slice(&chunk[..limit - body.len()]);
                    break;
                }
                return Err(PreviewError::TooLarge(limit));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl LinkPreviewer for HttpPreviewer {
    async fn fetch_page(&self, url: &Url) -> Result<PageMetadata, PreviewError> {
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.5")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PreviewError::Status(status.as_u16()));
        }
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();

        if content_type.starts_with("image/") {
            let mut page = PageMetadata::new(final_url.clone());
            page.image = Some(final_url);
            return Ok(page);
        }
        if !content_type.is_empty()
            && !content_type.starts_with("text/html")
            && !content_type.starts_with("application/xhtml")
        {
            return Err(PreviewError::UnsupportedContent(content_type));
        }

        // Metadata lives in <head>, so an oversized page is cut rather than refused.
        let body = Self::read_capped(response, self.max_page_bytes, true).await?;
        let html = decode_body(&body, &content_type);
        let page = parse_page(&final_url, &html);
        if page.is_empty() {
            return Err(PreviewError::NoMetadata(url.clone()));
        }
        tracing::debug!(url = %url, title = ?page.title, "parsed link preview");
        Ok(page)
    }

    async fn load_image(&self, url: &Url) -> Result<Vec<u8>, PreviewError> {
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "image/*")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PreviewError::Status(status.as_u16()));
        }
        Self::read_capped(response, self.max_image_bytes, false).await
    }
}

/// Extracts preview metadata from an HTML document. Relative image and icon
/// references are resolved against `base`.
pub fn parse_page(base: &Url, html: &str) -> PageMetadata {
    let mut meta: HashMap<String, String> = HashMap::new();
    for tag in META_TAG.find_iter(html) {
        let attrs = attributes(tag.as_str());
        let key = attrs.get("property").or_else(|| attrs.get("name"));
        let (Some(key), Some(content)) = (key, attrs.get("content")) else {
            continue;
        };
        meta.entry(key.to_ascii_lowercase())
            .or_insert_with(|| content.clone());
    }

    let first = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| meta.get(*key))
            .map(|value| clean_text(value))
            .find(|value| !value.is_empty())
    };

    let title = first(&["og:title", "twitter:title"]).or_else(|| {
        TITLE_TAG
            .captures(html)
            .and_then(|caps| caps.get(1))
            .map(|found| clean_text(found.as_str()))
            .filter(|value| !value.is_empty())
    });
    let description = first(&["og:description", "twitter:description", "description"]);
    let image = first(&[
        "og:image:secure_url",
        "og:image",
        "og:image:url",
        "twitter:image",
        "twitter:image:src",
    ])
    .and_then(|href| resolve(base, &href));

    PageMetadata {
        url: base.clone(),
        title,
        description,
        image,
        icon: find_icon(base, html),
    }
}

fn find_icon(base: &Url, html: &str) -> Option<Url> {
    let mut best: Option<(u8, Url)> = None;
    for tag in LINK_TAG.find_iter(html) {
        let attrs = attributes(tag.as_str());
        let (Some(rel), Some(href)) = (attrs.get("rel"), attrs.get("href")) else {
            continue;
        };
        let rel = rel.to_ascii_lowercase();
        let rank = match rel.as_str() {
            "apple-touch-icon" | "apple-touch-icon-precomposed" => 3,
            "icon" => 2,
            "shortcut icon" => 1,
            _ => continue,
        };
        let Some(resolved) = resolve(base, &decode_entities(href)) else {
            continue;
        };
        if best.as_ref().map_or(true, |(current, _)| rank > *current) {
            best = Some((rank, resolved));
        }
    }
    best.map(|(_, url)| url)
        .or_else(|| base.join("/favicon.ico").ok())
}

/// Decodes a page using the `Content-Type` charset, then a `<meta charset>`
/// near the top of the document, then UTF-8. A byte order mark wins over all
/// of them.
fn decode_body(body: &[u8], content_type: &str) -> String {
    let label = charset_param(content_type).or_else(|| {
        let head = String::from_utf8_lossy(&body[..body.len().min(CHARSET_SNIFF_BYTES)]);
        META_CHARSET
            .captures(&head)
            .map(|caps| caps[1].to_string())
    });
    let encoding = label
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(body);
    text.into_owned()
}

fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn attributes(tag: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(tag)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4))?;
            Some((name, value.as_str().to_string()))
        })
        .collect()
}

fn resolve(base: &Url, href: &str) -> Option<Url> {
    let resolved = base.join(href.trim()).ok()?;
    matches!(resolved.scheme(), "http" | "https").then_some(resolved)
}

fn clean_text(raw: &str) -> String {
    let decoded = decode_entities(raw);
    WHITESPACE.replace_all(decoded.trim(), " ").into_owned()
}

fn decode_entities(raw: &str) -> String {
    ENTITY
        .replace_all(raw, |caps: &Captures| {
            let entity = caps[1].to_ascii_lowercase();
            let decoded = match entity.as_str() {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                numeric => numeric
                    .strip_prefix("#x")
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .unwrap_or_else(|| numeric[1..].parse())
                    .ok()
                    .and_then(char::from_u32),
            };
            decoded
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    const ARTICLE: &str = r#"<!doctype html>
<html><head>
  <title>Fallback   title</title>
  <meta property="og:title" content="Rust &amp; You">
  <meta name="description" content='Plain description'>
  <meta property="og:description" content="Open &#39;graph&#x27; text">
  <meta property="og:image" content="/images/hero.jpg">
  <link rel="shortcut icon" href="/favicon.ico">
  <link rel="apple-touch-icon" href="https://static.example.com/touch.png">
</head><body></body></html>"#;

    fn base() -> Url {
        Url::parse("https://example.com/blog/post").expect("url")
    }

    #[test]
    fn prefers_open_graph_fields() {
        let page = parse_page(&base(), ARTICLE);
        assert_eq!(page.title.as_deref(), Some("Rust & You"));
        assert_eq!(page.description.as_deref(), Some("Open 'graph' text"));
        assert_eq!(
            page.image.as_ref().map(Url::as_str),
            Some("https://example.com/images/hero.jpg")
        );
        assert_eq!(
            page.icon.as_ref().map(Url::as_str),
            Some("https://static.example.com/touch.png")
        );
    }

    #[test]
    fn falls_back_to_title_tag_and_favicon() {
        let html = "<html><head><title>\n  Just a\ttitle </title></head></html>";
        let page = parse_page(&base(), html);
        assert_eq!(page.title.as_deref(), Some("Just a title"));
        assert!(page.description.is_none());
        assert!(page.image.is_none());
        assert_eq!(
            page.icon.as_ref().map(Url::as_str),
            Some("https://example.com/favicon.ico")
        );
        assert!(!page.is_empty());
    }

    #[test]
    fn page_without_metadata_is_empty() {
        let page = parse_page(&base(), "<html><body>hi</body></html>");
        assert!(page.is_empty());
    }

    #[test]
    fn non_http_images_are_ignored() {
        let html = r#"<meta property="og:image" content="data:image/png;base64,AAAA">"#;
        assert!(parse_page(&base(), html).image.is_none());
    }

    #[test]
    fn quoted_values_may_contain_angle_brackets() {
        let html = r#"<meta property="og:title" content="a > b">
<meta name='description' content='x -> y'>
<link rel="icon" title="=>" href="/i.png">"#;
        let page = parse_page(&base(), html);
        assert_eq!(page.title.as_deref(), Some("a > b"));
        assert_eq!(page.description.as_deref(), Some("x -> y"));
        assert_eq!(
            page.icon.as_ref().map(Url::as_str),
            Some("https://example.com/i.png")
        );
    }

    #[test]
    fn body_charset_comes_from_header_then_meta() {
        let latin1 = b"<title>Caf\xe9</title>";
        assert_eq!(
            decode_body(latin1, "text/html; charset=iso-8859-1"),
            "<title>Caf\u{e9}</title>"
        );

        let declared = b"<meta charset=\"windows-1252\"><title>Caf\xe9</title>";
        assert!(decode_body(declared, "text/html").contains("Caf\u{e9}"));

        let sjis = b"<meta http-equiv=\"Content-Type\" content=\"text/html; charset=Shift_JIS\"><title>\x93\xfa\x96\x7b</title>";
        assert!(decode_body(sjis, "").contains("\u{65e5}\u{672c}"));

        assert_eq!(decode_body("caf\u{e9}".as_bytes(), "text/html"), "caf\u{e9}");
    }

    #[test]
    fn unknown_entities_are_kept() {
        assert_eq!(decode_entities("a &bogus; b &lt;c&gt;"), "a &bogus; b <c>");
    }

    /// Serves the same canned response to every connection on a local port.
    async fn serve(status: &str, content_type: &str, body: Vec<u8>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let head = format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => request.extend_from_slice(&buf[..read]),
                    }
                }
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            }
        });
        Url::parse(&format!("http://{addr}/page")).expect("server url")
    }

    fn previewer(config: EnrichmentConfig) -> HttpPreviewer {
        HttpPreviewer::with_builder(&config, reqwest::Client::builder().no_proxy())
            .expect("http client")
    }

    #[tokio::test]
    async fn fetches_and_parses_html() {
        let url = serve(
            "200 OK",
            "text/html; charset=utf-8",
            ARTICLE.as_bytes().to_vec(),
        )
        .await;
        let page = previewer(EnrichmentConfig::default())
            .fetch_page(&url)
            .await
            .expect("page");
        assert_eq!(page.title.as_deref(), Some("Rust & You"));
        assert_eq!(page.image, url.join("/images/hero.jpg").ok());
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let url = serve("404 Not Found", "text/html", b"gone".to_vec()).await;
        let result = previewer(EnrichmentConfig::default()).fetch_page(&url).await;
        assert_matches!(result, Err(PreviewError::Status(404)));
    }

    #[tokio::test]
    async fn non_html_content_is_rejected() {
        let url = serve("200 OK", "application/json", b"{}".to_vec()).await;
        let result = previewer(EnrichmentConfig::default()).fetch_page(&url).await;
        assert_matches!(result, Err(PreviewError::UnsupportedContent(kind)) if kind == "application/json");
    }

    #[tokio::test]
    async fn direct_image_link_previews_itself() {
        let url = serve("200 OK", "image/png", vec![0u8; 16]).await;
        let page = previewer(EnrichmentConfig::default())
            .fetch_page(&url)
            .await
            .expect("page");
        assert_eq!(page.image.as_ref(), Some(&url));
        assert!(page.title.is_none());
    }

    #[tokio::test]
    async fn long_pages_are_cut_at_the_limit() {
        let mut body = b"<html><head><title>Kept</title>".to_vec();
        body.extend(std::iter::repeat(b' ').take(4096));
        body.extend_from_slice(br#"<meta property="og:description" content="cut off"></head>"#);
        let url = serve("200 OK", "text/html", body).await;

        let config = EnrichmentConfig {
            max_page_bytes: 256,
            ..EnrichmentConfig::default()
        };
        let page = previewer(config).fetch_page(&url).await.expect("page");
        assert_eq!(page.title.as_deref(), Some("Kept"));
        assert!(page.description.is_none());
    }

    #[tokio::test]
    async fn oversized_images_are_refused() {
        let url = serve("200 OK", "image/png", vec![7u8; 64]).await;
        let config = EnrichmentConfig {
            max_image_bytes: 16,
            ..EnrichmentConfig::default()
        };
        let result = previewer(config.clone()).load_image(&url).await;
        assert_matches!(result, Err(PreviewError::TooLarge(16)));

        let config = EnrichmentConfig {
            max_image_bytes: 64,
            ..config
        };
        let bytes = previewer(config).load_image(&url).await.expect("image");
        assert_eq!(bytes, vec![7u8; 64]);
    }
}
