//! Per-site knowledge: how candidate ids map to pages, how pages parse into
//! entities, and how story URLs map back to keys.

mod ao3;
mod ffnet;

use std::sync::Arc;

use scraper::{ElementRef, Selector};
use url::Url;

use crate::crawl::{CrawlError, Page};
use crate::model::{Entity, EntityKey, Site, StoryKey};

pub use ao3::Ao3;
pub use ffnet::FanFiction;

pub const FFNET_POPULATION: u64 = 8_043_930;
pub const FICTIONPRESS_POPULATION: u64 = 1_067_244;
pub const DEFAULT_WORKERS: usize = 100;

/// How the producer should come up with candidate ids for a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryPlan {
    /// Walk ids upward, bounded by the newest id seen on `listing`.
    Sequential { listing: Url },
    /// Draw ids uniformly from `[0, population)`.
    Random { population: u64 },
}

/// What a fetched page turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Found { label: String, entities: Vec<Entity> },
    /// The site confirmed nothing lives at this id.
    Absent,
}

pub trait SiteCollaborator: Send + Sync {
    fn site(&self) -> Site;

    fn discovery(&self) -> DiscoveryPlan;

    fn default_workers(&self) -> usize {
        DEFAULT_WORKERS
    }

    fn candidate(&self, id: u64) -> EntityKey;

    fn page_url(&self, key: &EntityKey) -> Result<Url, CrawlError>;

    fn parse(&self, key: &EntityKey, page: &Page) -> Result<Parsed, CrawlError>;

    /// Newest id visible on the discovery listing page.
    fn latest_id(&self, listing: &Page) -> Result<u64, CrawlError> {
        Err(CrawlError::Parse(format!(
            "{} has no id listing ({})",
            self.site(),
            listing.url
        )))
    }

    fn story_key(&self, url: &Url) -> Option<StoryKey>;
}

#[derive(Debug, Clone)]
pub struct SiteUrls {
    pub ffnet: Url,
    pub fictionpress: Url,
    pub ao3: Url,
}

impl SiteUrls {
    /// The live sites.
    pub fn public() -> Result<Self, url::ParseError> {
        Ok(Self {
            ffnet: Url::parse("https://www.fanfiction.net/")?,
            fictionpress: Url::parse("https://www.fictionpress.com/")?,
            ao3: Url::parse("https://archiveofourown.org/")?,
        })
    }
}

/// Ordered set of site collaborators. Order matters for URL resolution: the
/// first site that recognizes a seed wins.
#[derive(Clone, Default)]
pub struct SiteRegistry {
    sites: Vec<Arc<dyn SiteCollaborator>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// fanfiction.net, fictionpress.com and AO3, in that order.
    pub fn standard(urls: SiteUrls) -> Self {
        Self::new()
            .with(FanFiction::ffnet(urls.ffnet, FFNET_POPULATION))
            .with(FanFiction::fictionpress(
                urls.fictionpress,
                FICTIONPRESS_POPULATION,
            ))
            .with(Ao3::new(urls.ao3))
    }

    pub fn with(mut self, site: impl SiteCollaborator + 'static) -> Self {
        self.sites.push(Arc::new(site));
        self
    }

    pub fn get(&self, site: Site) -> Option<Arc<dyn SiteCollaborator>> {
        self.sites.iter().find(|s| s.site() == site).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SiteCollaborator>> {
        self.sites.iter()
    }
}

impl std::fmt::Debug for SiteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sites.iter().map(|s| s.site()))
            .finish()
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, CrawlError> {
    Selector::parse(css).map_err(|err| CrawlError::Parse(format!("selector {css:?}: {err}")))
}

/// Matches of `sel` below `el`, never `el` itself.
pub(crate) fn descendants<'a, 'b>(
    el: ElementRef<'a>,
    sel: &'b Selector,
) -> impl Iterator<Item = ElementRef<'a>> + 'b
where
    'a: 'b,
{
    let root = el.id();
    el.select(sel).filter(move |found| found.id() != root)
}

pub(crate) fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Digits of `text` as a number, ignoring separators like `1,234`.
pub(crate) fn parse_count(text: &str) -> Option<u64> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn host_matches(url: &Url, domain: &str) -> bool {
    url.host_str().is_some_and(|host| {
        host == domain
            || host
                .strip_suffix(domain)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}
