//! Link preview enrichment.
//!
//! A [`LinkPreviewer`] fetches page metadata for a URL. The [`Enricher`] runs
//! one background task per request on the tokio runtime, bounds the page
//! fetch and each image load with their own timeouts, and hands the result
//! back over a channel. It never touches the post store itself; the store
//! owner drains the [`CompletionQueue`] and decides whether to apply it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::timeout;
use url::Url;

use crate::config::EnrichmentConfig;
use crate::store::{LinkMetadata, PostId};

pub mod http;
mod images;

pub use http::HttpPreviewer;
pub use images::recompress_jpeg;

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("unsupported content type {0}")]
    UnsupportedContent(String),
    #[error("response larger than {0} bytes")]
    TooLarge(usize),
    #[error("no link metadata found at {0}")]
    NoMetadata(Url),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// What a page says about itself, before any image is downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMetadata {
    pub url: Url,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<Url>,
    pub icon: Option<Url>,
}

impl PageMetadata {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            title: None,
            description: None,
            image: None,
            icon: None,
        }
    }

    /// A page is worth previewing when it names itself or shows something.
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.image.is_none()
    }
}

#[async_trait]
pub trait LinkPreviewer: Send + Sync {
    async fn fetch_page(&self, url: &Url) -> Result<PageMetadata, PreviewError>;

    /// Raw bytes of an image referenced by a page.
    async fn load_image(&self, url: &Url) -> Result<Vec<u8>, PreviewError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentSettings {
    pub fetch_timeout: Duration,
    pub image_timeout: Duration,
    pub jpeg_quality: u8,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self::from(&EnrichmentConfig::default())
    }
}

impl From<&EnrichmentConfig> for EnrichmentSettings {
    fn from(config: &EnrichmentConfig) -> Self {
        Self {
            fetch_timeout: config.fetch_timeout(),
            image_timeout: config.image_timeout(),
            jpeg_quality: config.jpeg_quality,
        }
    }
}

/// Result of one enrichment request, addressed to the post and event that
/// asked for it.
#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub post_id: PostId,
    pub ticket: u64,
    pub link: Url,
    pub metadata: Option<LinkMetadata>,
}

pub struct CompletionQueue {
    receiver: mpsc::UnboundedReceiver<EnrichmentOutcome>,
}

impl CompletionQueue {
    pub(crate) fn try_next(&mut self) -> Option<EnrichmentOutcome> {
        self.receiver.try_recv().ok()
    }

    pub(crate) async fn next(&mut self) -> Option<EnrichmentOutcome> {
        self.receiver.recv().await
    }
}

#[derive(Clone)]
pub struct Enricher {
    previewer: Arc<dyn LinkPreviewer>,
    settings: EnrichmentSettings,
    runtime: Handle,
    results: mpsc::UnboundedSender<EnrichmentOutcome>,
}

impl Enricher {
    pub fn new(
        previewer: Arc<dyn LinkPreviewer>,
        settings: EnrichmentSettings,
        runtime: Handle,
    ) -> (Self, CompletionQueue) {
        let (results, receiver) = mpsc::unbounded_channel();
        let enricher = Self {
            previewer,
            settings,
            runtime,
            results,
        };
        (enricher, CompletionQueue { receiver })
    }

    /// Starts resolving `link` in the background. Exactly one outcome is
    /// delivered per call, including when the lookup fails or panics, unless
    /// the returned task is aborted first.
    pub fn spawn(&self, post_id: PostId, ticket: u64, link: Url) -> EnrichmentTask {
        let previewer = Arc::clone(&self.previewer);
        let settings = self.settings;
        let target = link.clone();
        let lookup = self
            .runtime
            .spawn(async move { resolve_metadata(&*previewer, &settings, &target).await });
        let lookup_abort = lookup.abort_handle();

        let results = self.results.clone();
        let report = self.runtime.spawn(async move {
            let metadata = match lookup.await {
                Ok(Ok(metadata)) => Some(metadata),
                Ok(Err(err)) => {
                    tracing::debug!(%post_id, url = %link, error = %err, "link preview unavailable");
                    None
                }
                Err(err) if err.is_cancelled() => {
                    tracing::trace!(%post_id, url = %link, "link preview cancelled");
                    return;
                }
                Err(err) => {
                    tracing::warn!(%post_id, url = %link, error = %err, "link preview task panicked");
                    None
                }
            };
            let outcome = EnrichmentOutcome {
                post_id,
                ticket,
                link,
                metadata,
            };
            if results.send(outcome).is_err() {
                tracing::trace!(%post_id, "post store dropped before enrichment finished");
            }
        });

        EnrichmentTask {
            lookup: lookup_abort,
            report,
        }
    }
}

/// A running lookup together with the task that reports its outcome.
#[derive(Debug)]
pub struct EnrichmentTask {
    lookup: AbortHandle,
    report: JoinHandle<()>,
}

impl EnrichmentTask {
    /// Stops the lookup and its report. Nothing is delivered afterwards.
    pub fn abort(&self) {
        self.lookup.abort();
        self.report.abort();
    }

    /// Waits until the outcome has been handed to the completion queue.
    pub async fn join(self) -> Result<(), JoinError> {
        self.report.await
    }
}

/// Fetches page metadata under the outer timeout, then loads the preview
/// image and site icon concurrently, each under its own timeout. A missing
/// image never fails the whole lookup.
pub async fn resolve_metadata(
    previewer: &dyn LinkPreviewer,
    settings: &EnrichmentSettings,
    link: &Url,
) -> Result<LinkMetadata, PreviewError> {
    let page = timeout(settings.fetch_timeout, previewer.fetch_page(link))
        .await
        .map_err(|_| PreviewError::TimedOut(settings.fetch_timeout))??;

    let (preview_image, site_icon) = tokio::join!(
        load_image(previewer, settings, page.image.as_ref()),
        load_image(previewer, settings, page.icon.as_ref()),
    );

    Ok(LinkMetadata {
        url: link.clone(),
        title: page.title,
        description: page.description,
        preview_image,
        site_icon,
    })
}

async fn load_image(
    previewer: &dyn LinkPreviewer,
    settings: &EnrichmentSettings,
    source: Option<&Url>,
) -> Option<Vec<u8>> {
    let source = source?;
    let raw = match timeout(settings.image_timeout, previewer.load_image(source)).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(err)) => {
            tracing::debug!(url = %source, error = %err, "image fetch failed");
            return None;
        }
        Err(_) => {
            tracing::debug!(url = %source, timeout = ?settings.image_timeout, "image fetch timed out");
            return None;
        }
    };

    let quality = settings.jpeg_quality;
    match tokio::task::spawn_blocking(move || recompress_jpeg(&raw, quality)).await {
        Ok(Ok(jpeg)) => Some(jpeg),
        Ok(Err(err)) => {
            tracing::debug!(url = %source, error = %err, "image could not be decoded");
            None
        }
        Err(err) => {
            tracing::warn!(url = %source, error = %err, "image conversion task aborted");
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::testing::{png_bytes, FixturePreviewer};
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).expect("url")
    }

    fn page_with_images() -> PageMetadata {
        let mut page = PageMetadata::new(url("https://example.com/post"));
        page.title = Some("A post".into());
        page.description = Some("About things".into());
        page.image = Some(url("https://cdn.example.com/hero.png"));
        page.icon = Some(url("https://example.com/favicon.png"));
        page
    }

    #[tokio::test]
    async fn resolves_text_and_recompresses_images() {
        let previewer = FixturePreviewer::new()
            .with_full_page(page_with_images())
            .with_image("https://cdn.example.com/hero.png", png_bytes())
            .with_image("https://example.com/favicon.png", png_bytes());

        let metadata = resolve_metadata(
            &previewer,
            &EnrichmentSettings::default(),
            &url("https://example.com/post"),
        )
        .await
        .expect("metadata");

        assert_eq!(metadata.url, url("https://example.com/post"));
        assert_eq!(metadata.title.as_deref(), Some("A post"));
        assert_eq!(metadata.description.as_deref(), Some("About things"));
        let hero = metadata.preview_image.expect("hero image");
        assert_eq!(&hero[..2], &[0xff, 0xd8], "expected JPEG output");
        assert!(metadata.site_icon.is_some());
    }

    #[tokio::test]
    async fn failed_or_undecodable_images_are_left_out() {
        let previewer = FixturePreviewer::new()
            .with_full_page(page_with_images())
            .with_image("https://cdn.example.com/hero.png", b"not an image".to_vec());

        let metadata = resolve_metadata(
            &previewer,
            &EnrichmentSettings::default(),
            &url("https://example.com/post"),
        )
        .await
        .expect("metadata");

        assert_eq!(metadata.title.as_deref(), Some("A post"));
        assert!(metadata.preview_image.is_none());
        assert!(metadata.site_icon.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_image_times_out_without_failing_lookup() {
        let previewer = FixturePreviewer::new()
            .with_full_page(page_with_images())
            .with_image("https://cdn.example.com/hero.png", png_bytes())
            .with_image("https://example.com/favicon.png", png_bytes())
            .with_slow_image("https://example.com/favicon.png", Duration::from_secs(60));

        let metadata = resolve_metadata(
            &previewer,
            &EnrichmentSettings::default(),
            &url("https://example.com/post"),
        )
        .await
        .expect("metadata");

        assert!(metadata.site_icon.is_none());
        assert_eq!(metadata.title.as_deref(), Some("A post"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_page_hits_outer_timeout() {
        let previewer = FixturePreviewer::new()
            .with_page("https://example.com/", "Example")
            .with_page_delay(Duration::from_secs(60));

        let result = resolve_metadata(
            &previewer,
            &EnrichmentSettings::default(),
            &url("https://example.com/"),
        )
        .await;

        assert_matches!(result, Err(PreviewError::TimedOut(limit)) if limit == Duration::from_secs(20));
    }

    #[tokio::test]
    async fn spawn_delivers_exactly_one_outcome() {
        let previewer = Arc::new(FixturePreviewer::new().with_page("https://example.com/", "Example"));
        let (enricher, mut queue) =
            Enricher::new(previewer, EnrichmentSettings::default(), Handle::current());

        let post_id = PostId::new_v4();
        enricher
            .spawn(post_id, 7, url("https://example.com/"))
            .join()
            .await
            .expect("task");
        enricher
            .spawn(post_id, 8, url("https://missing.example.com/"))
            .join()
            .await
            .expect("task");

        let first = queue.next().await.expect("first outcome");
        assert_eq!(first.ticket, 7);
        assert_eq!(first.post_id, post_id);
        assert_eq!(
            first.metadata.and_then(|m| m.title).as_deref(),
            Some("Example")
        );

        let second = queue.next().await.expect("second outcome");
        assert_eq!(second.ticket, 8);
        assert!(second.metadata.is_none());
        assert!(queue.try_next().is_none());
    }
}
