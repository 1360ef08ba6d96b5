use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::crawl::{CrawlConfig, DEFAULT_MISS_THRESHOLD};
use crate::logging::LogFormat;
use crate::model::Site;
use crate::recommend::DEFAULT_LIMIT;
use crate::sites::{SiteRegistry, SiteUrls};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, env = "FICREC_LOG_FORMAT", default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the recommendation API, crawling in the background.
    Serve(ServeArgs),
    /// Crawl sites into the store until every crawl stops.
    Crawl(CrawlArgs),
    /// Print recommendations for a story as JSON.
    Recommend(RecommendArgs),
    /// Print one stored record as JSON.
    Get(GetArgs),
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    /// Path of the sled database directory.
    #[arg(long = "db", env = "FICREC_DB_PATH", default_value = "ficrec.sled")]
    pub db_path: PathBuf,
}

#[derive(Debug, Args)]
pub struct SiteArgs {
    #[arg(long, env = "FICREC_FFNET_URL", default_value = "https://www.fanfiction.net/")]
    pub ffnet_url: Url,

    #[arg(long, env = "FICREC_FICTIONPRESS_URL", default_value = "https://www.fictionpress.com/")]
    pub fictionpress_url: Url,

    #[arg(long, env = "FICREC_AO3_URL", default_value = "https://archiveofourown.org/")]
    pub ao3_url: Url,
}

impl SiteArgs {
    pub fn registry(&self) -> SiteRegistry {
        SiteRegistry::standard(SiteUrls {
            ffnet: self.ffnet_url.clone(),
            fictionpress: self.fictionpress_url.clone(),
            ao3: self.ao3_url.clone(),
        })
    }
}

#[derive(Debug, Args)]
pub struct CrawlOptions {
    /// Sites to crawl (default: all).
    #[arg(long = "site", value_name = "SITE")]
    pub sites: Vec<Site>,

    /// Concurrent fetches per site (default: site-specific).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Consecutive missing ids before a crawl halts.
    #[arg(long, default_value_t = DEFAULT_MISS_THRESHOLD)]
    pub miss_threshold: u64,

    /// Seconds between probes of a site's newest id.
    #[arg(long, default_value_t = 600)]
    pub frontier_poll_secs: u64,

    /// HTTP request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

impl CrawlOptions {
    pub fn config(&self) -> CrawlConfig {
        CrawlConfig {
            workers: self.workers,
            miss_threshold: self.miss_threshold,
            frontier_poll: Duration::from_secs(self.frontier_poll_secs),
            ..CrawlConfig::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Selected sites, or every site when none were named.
    pub fn selected(&self, site: Site) -> bool {
        self.sites.is_empty() || self.sites.contains(&site)
    }
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, env = "FICREC_ADDR", default_value = "0.0.0.0:6060")]
    pub addr: SocketAddr,

    /// Crawl in the background while serving.
    #[arg(long, env = "FICREC_SCRAPE", default_value_t = true, action = clap::ArgAction::Set)]
    pub scrape: bool,

    /// Static web assets directory (served if it has an index.html).
    #[arg(long, env = "FICREC_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub sites: SiteArgs,

    #[command(flatten)]
    pub crawl: CrawlOptions,
}

#[derive(Debug, Args)]
pub struct CrawlArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub sites: SiteArgs,

    #[command(flatten)]
    pub crawl: CrawlOptions,
}

#[derive(Debug, Args)]
pub struct RecommendArgs {
    /// Story key or story URL; several may be joined with `|`.
    pub id: String,

    #[arg(long, default_value_t = DEFAULT_LIMIT)]
    pub limit: usize,

    #[arg(long, default_value_t = 0)]
    pub offset: usize,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub sites: SiteArgs,
}

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Entity key, e.g. `story:ao3:100` or `user:ffnet:42`.
    pub key: String,

    #[command(flatten)]
    pub store: StoreArgs,
}
