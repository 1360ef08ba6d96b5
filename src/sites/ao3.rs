use std::collections::BTreeMap;

use chrono::NaiveDate;
use scraper::Html;
use url::Url;

use super::{DiscoveryPlan, Parsed, SiteCollaborator, host_matches, parse_count, selector, text_of};
use crate::crawl::{CrawlError, Page};
use crate::model::{Entity, EntityKey, Site, Story, StoryKey, User, UserKey};

/// Archive of Our Own. Works are numbered sequentially, so discovery walks
/// ids up to the newest work on the `/works` listing.
#[derive(Debug, Clone)]
pub struct Ao3 {
    base: Url,
}

impl Ao3 {
    pub fn new(base: Url) -> Self {
        Self { base }
    }
}

impl SiteCollaborator for Ao3 {
    fn site(&self) -> Site {
        Site::Ao3
    }

    fn discovery(&self) -> DiscoveryPlan {
        let mut listing = self.base.clone();
        listing.set_path("/works");
        DiscoveryPlan::Sequential { listing }
    }

    fn candidate(&self, id: u64) -> EntityKey {
        StoryKey::new(Site::Ao3, id).into()
    }

    fn page_url(&self, key: &EntityKey) -> Result<Url, CrawlError> {
        let EntityKey::Story(story) = key else {
            return Err(CrawlError::Unsupported(key.to_string()));
        };
        let mut url = self.base.join(&format!("works/{}", story.id))?;
        // Adult works otherwise answer with an interstitial that has no title.
        url.set_query(Some("view_adult=true"));
        Ok(url)
    }

    fn parse(&self, key: &EntityKey, page: &Page) -> Result<Parsed, CrawlError> {
        let EntityKey::Story(story_key) = key else {
            return Err(CrawlError::Unsupported(key.to_string()));
        };
        parse_work(*story_key, &page.body)
    }

    fn latest_id(&self, listing: &Page) -> Result<u64, CrawlError> {
        let doc = Html::parse_document(&listing.body);
        let links = selector(".work .heading a")?;
        doc.select(&links)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(work_id_from_path)
            .max()
            .ok_or_else(|| CrawlError::Parse(format!("no works listed on {}", listing.url)))
    }

    fn story_key(&self, url: &Url) -> Option<StoryKey> {
        if !host_matches(url, "archiveofourown.org") && url.host() != self.base.host() {
            return None;
        }
        work_id_from_path(url.path()).map(|id| StoryKey::new(Site::Ao3, id))
    }
}

fn work_id_from_path(path: &str) -> Option<u64> {
    let mut segments = path.trim_start_matches('/').split('/');
    match (segments.next(), segments.next()) {
        (Some("works"), Some(id)) => id.parse().ok(),
        _ => None,
    }
}

fn parse_work(key: StoryKey, body: &str) -> Result<Parsed, CrawlError> {
    let doc = Html::parse_document(body);

    let Some(heading) = doc.select(&selector("h2.title.heading")?).next() else {
        return Ok(Parsed::Absent);
    };

    let mut story = Story::new(key);
    story.exists = true;
    story.title = text_of(heading);

    let first_text = |css: &str| -> Result<Option<String>, CrawlError> {
        Ok(doc.select(&selector(css)?).next().map(text_of))
    };

    let summary = doc
        .select(&selector(".summary p")?)
        .map(text_of)
        .collect::<Vec<_>>()
        .join("\n");
    let fandoms = doc
        .select(&selector("dd.fandom a")?)
        .map(text_of)
        .collect::<Vec<_>>();
    let stats = doc
        .select(&selector("dl.stats")?)
        .next()
        .map(|dl| dl.inner_html())
        .unwrap_or_default();
    story.desc = format!(
        "{summary}<div class='xgray'>{} - {}</div>",
        fandoms.join(", "),
        stats.trim()
    );
    story.category = fandoms.first().cloned().unwrap_or_default();

    story.word_count = first_text("dd.words")?
        .as_deref()
        .and_then(parse_count)
        .unwrap_or(0);
    story.reviews = first_text("dd.comments")?
        .as_deref()
        .and_then(parse_count)
        .unwrap_or(0);
    if let Some(chapters) = first_text("dd.chapters")? {
        let (current, total) = chapters.split_once('/').unwrap_or((chapters.as_str(), "?"));
        story.chapters = parse_count(current).unwrap_or(0);
        story.complete = total.trim().parse::<u64>().ok() == Some(story.chapters);
    }
    story.date_submit = first_text("dd.published")?
        .as_deref()
        .and_then(parse_date)
        .unwrap_or(0);
    story.date_update = first_text("dd.status")?
        .as_deref()
        .and_then(parse_date)
        .unwrap_or(story.date_submit);

    let author_links = selector(r#"a[rel="author"]"#)?;
    story.author = doc
        .select(&author_links)
        .filter_map(|a| a.value().attr("href"))
        .find_map(user_from_path)
        .map(|name| UserKey::new(Site::Ao3, name));

    // Each kudos link is a reader who favorited the work. Link text keeps the
    // display casing; the key is the lowercased login.
    let mut readers = BTreeMap::new();
    for link in doc.select(&selector("#kudos a")?) {
        let Some(login) = link.value().attr("href").and_then(user_from_path) else {
            continue;
        };
        let name = text_of(link);
        readers.entry(login).or_insert(name);
    }

    story.favorites = first_text("dd.kudos")?
        .as_deref()
        .and_then(parse_count)
        .unwrap_or(readers.len() as u64);

    let mut entities = Vec::with_capacity(readers.len() + 1);
    for (login, name) in readers {
        let mut user = User::new(UserKey::new(Site::Ao3, login));
        user.exists = true;
        user.name = name;
        user.favorite_stories.insert(key);
        story.favorited_by.insert(user.key());
        entities.push(Entity::User(user));
    }

    let label = story.title.clone();
    entities.push(Entity::Story(story));
    Ok(Parsed::Found { label, entities })
}

/// Lowercased login from `/users/<login>` or `/users/<login>/pseuds/...`.
fn user_from_path(href: &str) -> Option<String> {
    let rest = href.strip_prefix("/users/")?;
    let login = rest.split('/').next()?.trim();
    (!login.is_empty()).then(|| login.to_lowercase())
}

fn parse_date(text: &str) -> Option<i64> {
    let date = NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORK: &str = r#"
<html><body>
<div class="wrapper"><dl class="work meta group">
  <dd class="fandom tags"><ul><li><a class="tag">Harry Potter - J. K. Rowling</a></li></ul></dd>
  <dd class="stats"><dl class="stats">
    <dt class="published">Published:</dt><dd class="published">2015-03-01</dd>
    <dt class="status">Completed:</dt><dd class="status">2015-04-02</dd>
    <dt class="words">Words:</dt><dd class="words">12,345</dd>
    <dt class="chapters">Chapters:</dt><dd class="chapters">3/3</dd>
    <dt class="comments">Comments:</dt><dd class="comments">17</dd>
    <dt class="kudos">Kudos:</dt><dd class="kudos">2</dd>
  </dl></dd>
</dl></div>
<div id="workskin">
  <h2 class="title heading">  The Long Way Round </h2>
  <h3 class="byline heading"><a rel="author" href="/users/Writer/pseuds/Writer">Writer</a></h3>
  <div class="summary module"><blockquote class="userstuff"><p>First line.</p><p>Second line.</p></blockquote></div>
</div>
<div id="kudos"><p class="kudos">
  <a href="/users/ReaderOne">ReaderOne</a>, <a href="/users/readertwo">readertwo</a>
  and <a href="/works/100/kudos">1 more user</a>
</p></div>
</body></html>"#;

    fn page(body: &str) -> Page {
        Page {
            url: Url::parse("https://archiveofourown.org/works/100").unwrap(),
            status: 200,
            body: body.to_owned(),
        }
    }

    fn site() -> Ao3 {
        Ao3::new(Url::parse("https://archiveofourown.org/").unwrap())
    }

    #[test]
    fn parses_work_with_kudos_as_favorites() {
        let key = StoryKey::new(Site::Ao3, 100);
        let Parsed::Found { label, entities } = site().parse(&key.into(), &page(WORK)).unwrap()
        else {
            panic!("expected a work");
        };
        assert_eq!(label, "The Long Way Round");
        assert_eq!(entities.len(), 3);

        let Entity::Story(story) = entities.last().unwrap() else {
            panic!("story goes last");
        };
        assert!(story.exists);
        assert_eq!(story.word_count, 12_345);
        assert_eq!(story.chapters, 3);
        assert!(story.complete);
        assert_eq!(story.reviews, 17);
        assert_eq!(story.favorites, 2);
        assert_eq!(story.category, "Harry Potter - J. K. Rowling");
        assert_eq!(story.date_submit, 1_425_168_000);
        assert_eq!(story.date_update, 1_427_932_800);
        assert!(story.desc.starts_with("First line.\nSecond line.<div class='xgray'>"));
        assert_eq!(story.author, Some(UserKey::new(Site::Ao3, "writer")));
        let readers: Vec<_> = story.favorited_by.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(readers, ["readerone", "readertwo"]);

        let Entity::User(reader) = &entities[0] else {
            panic!("readers come first");
        };
        assert_eq!(reader.name, "ReaderOne");
        assert!(reader.favorite_stories.contains(&key));
    }

    #[test]
    fn missing_title_means_absent() {
        let key = StoryKey::new(Site::Ao3, 5);
        let parsed = site()
            .parse(&key.into(), &page("<html><body><h2>Error 404</h2></body></html>"))
            .unwrap();
        assert_eq!(parsed, Parsed::Absent);
    }

    #[test]
    fn latest_id_reads_listing_headings() {
        let listing = r#"<ol>
          <li class="work blurb"><h4 class="heading"><a href="/works/4100">New</a> by <a href="/users/x">x</a></h4></li>
          <li class="work blurb"><h4 class="heading"><a href="/works/4099">Older</a></h4></li>
        </ol>"#;
        assert_eq!(site().latest_id(&page(listing)).unwrap(), 4100);
        assert!(site().latest_id(&page("<p>empty</p>")).is_err());
    }

    #[test]
    fn resolves_work_urls() {
        let site = site();
        let url = Url::parse("https://archiveofourown.org/works/123/chapters/9").unwrap();
        assert_eq!(site.story_key(&url), Some(StoryKey::new(Site::Ao3, 123)));
        let url = Url::parse("https://www.fanfiction.net/s/123").unwrap();
        assert_eq!(site.story_key(&url), None);
    }

    #[test]
    fn work_pages_request_adult_view() {
        let url = site()
            .page_url(&StoryKey::new(Site::Ao3, 8).into())
            .unwrap();
        assert_eq!(url.as_str(), "https://archiveofourown.org/works/8?view_adult=true");
    }
}
