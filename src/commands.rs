//! Subcommand entry points.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cli::{CrawlArgs, CrawlOptions, GetArgs, RecommendArgs, ServeArgs};
use crate::crawl::{CrawlSummary, Crawler, Fetcher, HttpFetcher};
use crate::model::{Entity, EntityKey};
use crate::recommend::RecommendationEngine;
use crate::sites::SiteRegistry;
use crate::store::{EntityStore, SledEntityStore};

pub async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let store = open_store(&args.store.db_path)?;
    let registry = args.sites.registry();
    let cancel = CancellationToken::new();

    let mut crawls = JoinSet::new();
    if args.scrape {
        spawn_crawls(&mut crawls, &registry, &store, &args.crawl, &cancel)?;
    } else {
        tracing::info!("scraping disabled");
    }

    let engine = RecommendationEngine::new(store.clone(), registry);
    let app = crate::api::router(engine, Some(&args.static_dir));

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("bind {}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("serve http")?;

    cancel.cancel();
    collect_summaries(&mut crawls).await;
    store.flush().await.context("flush store")?;
    Ok(())
}

pub async fn crawl(args: CrawlArgs) -> anyhow::Result<()> {
    let store = open_store(&args.store.db_path)?;
    let registry = args.sites.registry();
    let cancel = CancellationToken::new();

    let mut crawls = JoinSet::new();
    spawn_crawls(&mut crawls, &registry, &store, &args.crawl, &cancel)?;
    if crawls.is_empty() {
        anyhow::bail!("no site selected");
    }

    let watcher = tokio::spawn(shutdown_signal(cancel.clone()));
    let summaries = collect_summaries(&mut crawls).await;
    watcher.abort();
    store.flush().await.context("flush store")?;

    let mut stdout = std::io::stdout().lock();
    for summary in summaries {
        serde_json::to_writer(&mut stdout, &summary).context("write crawl summary")?;
        writeln!(stdout).context("write crawl summary")?;
    }
    Ok(())
}

pub async fn recommend(args: RecommendArgs) -> anyhow::Result<()> {
    let store = open_store(&args.store.db_path)?;
    let engine = RecommendationEngine::new(store, args.sites.registry());
    let rec = engine
        .recommend_ids(&args.id, args.limit, args.offset)
        .await
        .with_context(|| format!("recommend {}", args.id))?;

    let json = serde_json::to_string_pretty(&rec).context("serialize recommendation")?;
    println!("{json}");
    Ok(())
}

pub async fn get(args: GetArgs) -> anyhow::Result<()> {
    let key: EntityKey = args
        .key
        .parse()
        .with_context(|| format!("invalid key {:?}", args.key))?;
    let store = open_store(&args.store.db_path)?;
    let entity = store
        .get(&key)
        .await
        .with_context(|| format!("get {key}"))?;

    let json = match &entity {
        Entity::Story(story) => serde_json::to_string_pretty(story),
        Entity::User(user) => serde_json::to_string_pretty(user),
    }
    .context("serialize record")?;
    println!("{json}");
    Ok(())
}

fn open_store(path: &Path) -> anyhow::Result<Arc<SledEntityStore>> {
    let store = SledEntityStore::open(path)
        .with_context(|| format!("open store {}", path.display()))?;
    tracing::info!(path = %path.display(), records = store.record_count(), "opened store");
    Ok(Arc::new(store))
}

fn spawn_crawls(
    crawls: &mut JoinSet<CrawlSummary>,
    registry: &SiteRegistry,
    store: &Arc<SledEntityStore>,
    options: &CrawlOptions,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(options.timeout())?);
    let store: Arc<dyn EntityStore> = store.clone();
    for site in registry.iter().filter(|site| options.selected(site.site())) {
        let crawler = Crawler::new(
            Arc::clone(site),
            Arc::clone(&store),
            Arc::clone(&fetcher),
            options.config(),
        );
        crawls.spawn(crawler.run(cancel.clone()));
    }
    Ok(())
}

async fn collect_summaries(crawls: &mut JoinSet<CrawlSummary>) -> Vec<CrawlSummary> {
    let mut summaries = Vec::new();
    while let Some(joined) = crawls.join_next().await {
        match joined {
            Ok(summary) => {
                tracing::info!(
                    site = %summary.site,
                    stop = ?summary.stop,
                    dispatched = summary.dispatched,
                    saved = summary.saved,
                    absent = summary.absent,
                    failures = summary.failures,
                    "crawl finished"
                );
                summaries.push(summary);
            }
            Err(err) => tracing::error!(error = %err, "crawl task failed"),
        }
    }
    summaries
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => tracing::info!("interrupt received; shutting down"),
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for interrupts");
                cancel.cancelled().await;
                return;
            }
        },
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
