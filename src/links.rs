use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use url::Url;

static LINK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r#"https?://[^\s<>"]+|(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z]{2,}(?::[0-9]{1,5})?(?:[/?#][^\s<>"]*)?"#,
    )
    .case_insensitive(true)
    .build()
    .expect("valid link pattern")
});

// Top-level domains accepted for bare `domain.tld` links. Links with a scheme
// or a `www.` prefix are accepted regardless of their TLD.
const BARE_TLDS: &[&str] = &[
    "ai", "app", "au", "be", "blog", "br", "ca", "ch", "cn", "co", "com", "cz", "de", "dev",
    "dk", "edu", "es", "eu", "fi", "fm", "fr", "gg", "gov", "id", "ie", "in", "info", "io", "it",
    "jp", "kr", "ly", "me", "mx", "net", "news", "nl", "no", "nz", "org", "pl", "pt", "ru", "rs",
    "se", "sh", "site", "so", "tech", "to", "tv", "uk", "us", "xyz", "za",
];

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '\'', '"'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLink {
    text: String,
    url: Url,
}

impl ExtractedLink {
    /// The link exactly as it appears in the source text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The parsed link; scheme-less matches are read as `http://`.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn into_url(self) -> Url {
        self.url
    }
}

pub fn extract_first_url(text: &str) -> Option<ExtractedLink> {
    links(text).next()
}

pub fn extract_urls(text: &str) -> Vec<ExtractedLink> {
    links(text).collect()
}

/// Whether `url` is still among the links found in `text`.
pub fn contains_url(text: &str, url: &Url) -> bool {
    extract_urls(text).iter().any(|link| link.url() == url)
}

fn links(text: &str) -> impl Iterator<Item = ExtractedLink> + '_ {
    LINK_PATTERN
        .find_iter(text)
        .filter_map(move |found| accept(text, found.start(), found.as_str()))
}

fn accept(text: &str, start: usize, raw: &str) -> Option<ExtractedLink> {
    let candidate = trim_trailing(raw);
    if candidate.is_empty() {
        return None;
    }
    let end = start + candidate.len();
    let has_scheme = has_http_scheme(candidate);

    if !has_scheme {
        let before = text[..start].chars().next_back();
        if matches!(before, Some(ch) if ch.is_alphanumeric() || matches!(ch, '@' | '.' | '-' | '/' | '_'))
        {
            return None;
        }
        if text[end..].starts_with('@') {
            return None;
        }
        if !accepts_bare_host(candidate) {
            return None;
        }
    }

    let parsed = if has_scheme {
        Url::parse(candidate)
    } else {
        Url::parse(&format!("http://{candidate}"))
    };
    let url = parsed.ok()?;
    if url.host_str().map_or(true, str::is_empty) {
        return None;
    }

    Some(ExtractedLink {
        text: candidate.to_string(),
        url,
    })
}

fn has_http_scheme(candidate: &str) -> bool {
    let lowered = candidate.get(..8).unwrap_or(candidate).to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}

fn accepts_bare_host(candidate: &str) -> bool {
    let host = candidate
        .split(|ch| matches!(ch, '/' | '?' | '#' | ':'))
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if host.starts_with("www.") {
        return true;
    }
    host.rsplit('.')
        .next()
        .map(|tld| BARE_TLDS.contains(&tld))
        .unwrap_or(false)
}

fn trim_trailing(raw: &str) -> &str {
    let mut candidate = raw;
    loop {
        let Some(last) = candidate.chars().next_back() else {
            return candidate;
        };
        let strip = if TRAILING_PUNCTUATION.contains(&last) {
            true
        } else {
            match last {
                ')' => unbalanced(candidate, '(', ')'),
                ']' => unbalanced(candidate, '[', ']'),
                '}' => unbalanced(candidate, '{', '}'),
                _ => false,
            }
        };
        if !strip {
            return candidate;
        }
        candidate = &candidate[..candidate.len() - last.len_utf8()];
    }
}

fn unbalanced(candidate: &str, open: char, close: char) -> bool {
    let opens = candidate.chars().filter(|&ch| ch == open).count();
    let closes = candidate.chars().filter(|&ch| ch == close).count();
    closes > opens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_explicit_http_link_exactly() {
        let link = extract_first_url("check http://example.com out").expect("link");
        assert_eq!(link.as_str(), "http://example.com");
        assert_eq!(link.url().host_str(), Some("example.com"));
    }

    #[test]
    fn plain_text_has_no_link() {
        assert!(extract_first_url("no links here").is_none());
        assert!(extract_first_url("").is_none());
        assert!(extract_first_url("version 1.2 of notes.txt").is_none());
    }

    #[test]
    fn returns_only_the_first_link() {
        let text = "first https://a.com then https://b.com";
        let link = extract_first_url(text).expect("link");
        assert_eq!(link.as_str(), "https://a.com");
        let all: Vec<_> = extract_urls(text)
            .into_iter()
            .map(|link| link.as_str().to_string())
            .collect();
        assert_eq!(all, vec!["https://a.com", "https://b.com"]);
    }

    #[test]
    fn recognises_scheme_less_links() {
        let link = extract_first_url("see www.rust-lang.org.").expect("www link");
        assert_eq!(link.as_str(), "www.rust-lang.org");
        assert_eq!(link.url().as_str(), "http://www.rust-lang.org/");

        let link = extract_first_url("docs at docs.rs/regex/latest today").expect("bare link");
        assert_eq!(link.as_str(), "docs.rs/regex/latest");
        assert_eq!(link.url().path(), "/regex/latest");
    }

    #[test]
    fn strips_trailing_punctuation_and_unbalanced_brackets() {
        let link = extract_first_url("read this: https://example.com/page?id=4!").expect("link");
        assert_eq!(link.as_str(), "https://example.com/page?id=4");

        let link = extract_first_url("(see https://example.com/docs)").expect("link");
        assert_eq!(link.as_str(), "https://example.com/docs");

        let link =
            extract_first_url("wiki https://en.wikipedia.org/wiki/Rust_(programming_language)")
                .expect("link");
        assert_eq!(
            link.as_str(),
            "https://en.wikipedia.org/wiki/Rust_(programming_language)"
        );
    }

    #[test]
    fn email_addresses_are_not_links() {
        assert!(extract_first_url("mail me at me@example.com").is_none());
        assert!(extract_first_url("first.last@example.org please").is_none());
    }

    #[test]
    fn contains_url_compares_parsed_links() {
        let link = extract_first_url("go to https://a.com/x").expect("link");
        assert!(contains_url("now https://a.com/x again", link.url()));
        assert!(!contains_url("now https://b.com/x", link.url()));
        assert!(!contains_url("nothing left", link.url()));
    }
}
