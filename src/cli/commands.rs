use std::io::{self, Read};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, ValueEnum};
use time::OffsetDateTime;
use tokio::runtime::{Builder, Runtime};

use super::format;
use crate::config::{AppConfig, ConfigLoader, ThemeName};
use crate::enrich::{Enricher, EnrichmentSettings, HttpPreviewer};
use crate::storage::{KeyValueStore, SqliteKeyValueStore};
use crate::store::{EditOutcome, Post, PostId, PostStore};

#[derive(Args, Debug, Clone, Default)]
pub struct ListArgs {
    /// Maximum number of scribs to print (defaults to `timeline.list_limit`)
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct PostArgs {
    /// Text of the scrib. If omitted, reads from stdin.
    #[arg()]
    pub text: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Scrib id or a unique prefix of it
    pub id: String,
    /// Replacement text. If omitted, reads from stdin.
    #[arg()]
    pub text: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Scrib id or a unique prefix of it
    pub id: String,
}

#[derive(Args, Debug, Clone)]
pub struct ShowArgs {
    /// Scrib id or a unique prefix of it
    pub id: String,
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Text to look for; an empty query lists nothing
    #[arg(default_value = "")]
    pub query: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ThemeChoice {
    Light,
    Dark,
    Toggle,
}

#[derive(Args, Debug, Clone)]
pub struct ThemeArgs {
    /// Switch to this theme; prints the current theme when omitted
    #[arg(value_enum)]
    pub choice: Option<ThemeChoice>,
}

/// One CLI invocation: the opened store plus the runtime its link lookups
/// run on. The store is declared first so it is dropped before the runtime.
pub struct Session<S: KeyValueStore = SqliteKeyValueStore> {
    config: Arc<AppConfig>,
    store: PostStore<S>,
    runtime: Runtime,
}

impl Session<SqliteKeyValueStore> {
    /// Opens the store; with `enrich` set, links in new or edited scribs are
    /// looked up over HTTP.
    pub fn open(config: Arc<AppConfig>, storage: SqliteKeyValueStore, enrich: bool) -> Result<Self> {
        let runtime = build_runtime()?;
        let mut store = PostStore::open(storage);
        if enrich {
            match HttpPreviewer::new(&config.enrichment) {
                Ok(previewer) => {
                    let (enricher, completions) = Enricher::new(
                        Arc::new(previewer),
                        EnrichmentSettings::from(&config.enrichment),
                        runtime.handle().clone(),
                    );
                    store = store.with_enrichment(enricher, completions);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "link previews disabled, http client unavailable");
                }
            }
        }
        Ok(Self {
            config,
            store,
            runtime,
        })
    }
}

impl<S: KeyValueStore> Session<S> {
    pub fn without_enrichment(config: Arc<AppConfig>, storage: S) -> Result<Self> {
        Ok(Self {
            config,
            store: PostStore::open(storage),
            runtime: build_runtime()?,
        })
    }

    pub fn store(&self) -> &PostStore<S> {
        &self.store
    }

    pub fn list(&mut self, args: ListArgs) -> Result<()> {
        let limit = args.limit.unwrap_or(self.config.timeline.list_limit);
        let posts = self.store.posts();
        let shown = if limit == 0 { posts } else { &posts[..posts.len().min(limit)] };
        print!(
            "{}",
            format::format_timeline(shown, self.config.timeline.preview_chars, now())
        );
        if shown.len() < posts.len() {
            println!("... {} older scribs not shown", posts.len() - shown.len());
        }
        Ok(())
    }

    pub fn post(&mut self, args: PostArgs) -> Result<()> {
        let text = text_or_stdin(args.text)?;
        let id = self.create(&text)?;
        if let Some(post) = self.store.get(id) {
            print!("{}", format::format_post(post, now()));
        }
        Ok(())
    }

    pub fn edit(&mut self, args: EditArgs) -> Result<()> {
        let id = resolve_id(self.store.posts(), &args.id)?;
        let text = text_or_stdin(args.text)?;
        self.update(id, &text)?;
        if let Some(post) = self.store.get(id) {
            print!("{}", format::format_post(post, now()));
        }
        Ok(())
    }

    pub fn delete(&mut self, args: DeleteArgs) -> Result<()> {
        let id = resolve_id(self.store.posts(), &args.id)?;
        self.store.delete(id);
        println!("Deleted #{}", format::short_id(id));
        Ok(())
    }

    pub fn show(&mut self, args: ShowArgs) -> Result<()> {
        let id = resolve_id(self.store.posts(), &args.id)?;
        let post = self
            .store
            .get(id)
            .ok_or_else(|| anyhow!("scrib {id} disappeared"))?;
        print!("{}", format::format_post(post, now()));
        Ok(())
    }

    pub fn search(&mut self, args: SearchArgs) -> Result<()> {
        let results = self.store.search(&args.query);
        print!(
            "{}",
            format::format_search(&results, self.config.timeline.preview_chars, now())
        );
        Ok(())
    }

    /// Creates a post and waits for its link preview, if any.
    fn create(&mut self, text: &str) -> Result<PostId> {
        let id = self.store.create(text)?;
        self.settle();
        Ok(id)
    }

    fn update(&mut self, id: PostId, text: &str) -> Result<()> {
        match self.store.edit(id, text)? {
            EditOutcome::Updated => {
                self.settle();
                Ok(())
            }
            EditOutcome::NotFound => bail!("scrib {id} not found"),
        }
    }

    fn settle(&mut self) {
        let store = &mut self.store;
        let handled = self.runtime.block_on(store.settle());
        if handled > 0 {
            tracing::debug!(handled, "link previews settled");
        }
    }
}

pub fn set_theme(loader: &ConfigLoader, config: &AppConfig, args: ThemeArgs) -> Result<()> {
    let Some(choice) = args.choice else {
        println!("{}", config.theme);
        return Ok(());
    };
    let theme = match choice {
        ThemeChoice::Light => ThemeName::Light,
        ThemeChoice::Dark => ThemeName::Dark,
        ThemeChoice::Toggle => config.theme.toggled(),
    };
    let mut updated = config.clone();
    updated.theme = theme;
    loader.save(&updated)?;
    tracing::info!(theme = %theme, "theme saved");
    println!("{theme}");
    Ok(())
}

/// Finds the post whose id is `input` or starts with it. Dashes, a leading
/// `#` and case are ignored.
pub fn resolve_id(posts: &[Post], input: &str) -> Result<PostId> {
    let wanted: String = input
        .trim()
        .trim_start_matches('#')
        .chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_ascii_lowercase();
    if wanted.is_empty() {
        bail!("scrib id cannot be empty");
    }
    let mut matches = posts
        .iter()
        .filter(|post| post.id.simple().to_string().starts_with(&wanted));
    match (matches.next(), matches.next()) {
        (Some(post), None) => Ok(post.id),
        (Some(_), Some(_)) => bail!("id `{input}` matches more than one scrib, use more characters"),
        (None, _) => bail!("no scrib with id `{input}`"),
    }
}

fn text_or_stdin(text: Option<String>) -> Result<String> {
    let text = match text {
        Some(text) => text,
        None => read_stdin()?,
    };
    if text.trim().is_empty() {
        bail!("scrib text cannot be empty");
    }
    Ok(text)
}

fn read_stdin() -> Result<String> {
    if atty::is(atty::Stream::Stdin) {
        eprintln!("Enter scrib text. Finish with Ctrl-D.");
    }
    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("reading scrib text from stdin")?;
    Ok(buffer.trim_end_matches(['\r', '\n']).to_string())
}

fn build_runtime() -> Result<Runtime> {
    Builder::new_multi_thread()
        .enable_all()
        .thread_name("scrib-enrich")
        .build()
        .context("starting async runtime")
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}
