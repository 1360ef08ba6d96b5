use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::{
    DiscoveryPlan, Parsed, SiteCollaborator, descendants, host_matches, parse_count, selector,
    text_of,
};
use crate::crawl::{CrawlError, Page};
use crate::model::{Entity, EntityKey, Site, Story, StoryKey, User, UserKey};

/// fanfiction.net and its sister site fictionpress.com. Both share one page
/// layout; user profiles list authored and favorited stories, so crawling
/// samples random user ids.
#[derive(Debug, Clone)]
pub struct FanFiction {
    site: Site,
    domain: &'static str,
    base: Url,
    population: u64,
}

impl FanFiction {
    pub fn ffnet(base: Url, population: u64) -> Self {
        Self {
            site: Site::Ffnet,
            domain: "fanfiction.net",
            base,
            population,
        }
    }

    pub fn fictionpress(base: Url, population: u64) -> Self {
        Self {
            site: Site::FictionPress,
            domain: "fictionpress.com",
            base,
            population,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Listing {
    Favorite,
    Authored,
}

impl SiteCollaborator for FanFiction {
    fn site(&self) -> Site {
        self.site
    }

    fn discovery(&self) -> DiscoveryPlan {
        DiscoveryPlan::Random {
            population: self.population,
        }
    }

    fn candidate(&self, id: u64) -> EntityKey {
        UserKey::new(self.site, id.to_string()).into()
    }

    fn page_url(&self, key: &EntityKey) -> Result<Url, CrawlError> {
        match key {
            EntityKey::User(user) => Ok(self.base.join(&format!("u/{}", user.id))?),
            EntityKey::Story(story) => Ok(self.base.join(&format!("s/{}", story.id))?),
        }
    }

    fn parse(&self, key: &EntityKey, page: &Page) -> Result<Parsed, CrawlError> {
        let EntityKey::User(user_key) = key else {
            return Err(CrawlError::Unsupported(key.to_string()));
        };
        parse_profile(user_key.clone(), &page.body)
    }

    fn story_key(&self, url: &Url) -> Option<StoryKey> {
        if !host_matches(url, self.domain) && url.host() != self.base.host() {
            return None;
        }
        let mut segments = url.path().trim_start_matches('/').split('/');
        match (segments.next(), segments.next()) {
            (Some("s"), Some(id)) => id.parse().ok().map(|id| StoryKey::new(self.site, id)),
            _ => None,
        }
    }
}

fn parse_profile(key: UserKey, body: &str) -> Result<Parsed, CrawlError> {
    let doc = Html::parse_document(body);

    // Profiles of deleted or never-created accounts have no bio block.
    if doc.select(&selector("#bio_text")?).count() != 1 {
        return Ok(Parsed::Absent);
    }

    let mut user = User::new(key.clone());
    user.exists = true;
    user.name = doc
        .select(&selector("#content_wrapper_inner span")?)
        .next()
        .map(text_of)
        .unwrap_or_default();

    let mut entities = Vec::new();
    let div = selector("div")?;
    let img = selector("img")?;
    for (css, listing) in [
        (".favstories", Listing::Favorite),
        (".mystories", Listing::Authored),
    ] {
        for el in doc.select(&selector(css)?) {
            let Some(mut story) = story_from_listing(key.site, el, &div, &img) else {
                tracing::debug!(user = %key, "skipping story listing without a usable id");
                continue;
            };
            match listing {
                Listing::Favorite => {
                    story.favorited_by.insert(key.clone());
                    user.favorite_stories.insert(story.key());
                }
                Listing::Authored => {
                    story.author = Some(key.clone());
                    user.stories.insert(story.key());
                }
            }
            entities.push(Entity::Story(story));
        }
    }

    for link in doc.select(&selector("#fa a")?) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if let Some(id) = profile_id(href) {
            user.favorite_authors.insert(UserKey::new(key.site, id));
        }
    }

    let label = user.name.clone();
    entities.push(Entity::User(user));
    Ok(Parsed::Found { label, entities })
}

fn story_from_listing(
    site: Site,
    el: ElementRef<'_>,
    div: &Selector,
    img: &Selector,
) -> Option<Story> {
    let attr = |name: &str| el.value().attr(name).unwrap_or_default();
    let number = |name: &str| attr(name).trim().parse::<u64>().unwrap_or(0);
    let timestamp = |name: &str| attr(name).trim().parse::<i64>().unwrap_or(0);

    let id = attr("data-storyid").trim().parse::<u64>().ok()?;
    let mut story = Story::new(StoryKey::new(site, id));
    story.exists = true;
    story.title = attr("data-title").to_owned();
    story.category = attr("data-category").to_owned();
    story.word_count = number("data-wordcount");
    story.date_submit = timestamp("data-datesubmit");
    story.date_update = timestamp("data-dateupdate");
    story.reviews = number("data-ratingtimes");
    story.chapters = number("data-chapters");
    story.complete = attr("data-statusid") == "2";
    story.image = descendants(el, img)
        .next()
        .and_then(|i| i.value().attr("data-original"))
        .unwrap_or_default()
        .to_owned();

    if let Some(content) = descendants(el, div).next() {
        story.desc = content.inner_html();
        let meta = descendants(content, div).map(text_of).collect::<String>();
        story.favorites = favorites_from_meta(&meta).unwrap_or(0);
    }
    Some(story)
}

/// `... - Favs: 1,024 - Follows: ...` -> 1024.
fn favorites_from_meta(meta: &str) -> Option<u64> {
    let (_, rest) = meta.split_once("Favs:")?;
    let value = rest.split('-').next()?;
    parse_count(value)
}

/// `/u/<id>/<name>` -> `<id>`.
fn profile_id(href: &str) -> Option<String> {
    let mut segments = href.trim_start_matches('/').split('/');
    match (segments.next(), segments.next()) {
        (Some("u"), Some(id)) if !id.is_empty() => Some(id.to_owned()),
        _ => None,
    }
}
