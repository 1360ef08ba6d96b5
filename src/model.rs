use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Publishing sites the crawler knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Site {
    Ffnet,
    FictionPress,
    Ao3,
}

impl Site {
    pub const ALL: [Site; 3] = [Site::Ffnet, Site::FictionPress, Site::Ao3];

    pub fn name(self) -> &'static str {
        match self {
            Site::Ffnet => "ffnet",
            Site::FictionPress => "fictionpress",
            Site::Ao3 => "ao3",
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Site {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffnet" | "fanfiction" | "fanfiction.net" => Ok(Site::Ffnet),
            "fictionpress" | "fictionpress.com" => Ok(Site::FictionPress),
            "ao3" | "archiveofourown" | "archiveofourown.org" => Ok(Site::Ao3),
            other => Err(KeyParseError(format!("unknown site: {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct KeyParseError(String);

/// Composite key of a story: `story:<site>:<id>`.
///
/// Ordering is by site, then numeric id. Recommendation ranking relies on it
/// as the tie-breaker, so it must stay a total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoryKey {
    pub site: Site,
    pub id: u64,
}

impl StoryKey {
    pub fn new(site: Site, id: u64) -> Self {
        Self { site, id }
    }
}

impl fmt::Display for StoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "story:{}:{}", self.site, self.id)
    }
}

impl FromStr for StoryKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("story:")
            .ok_or_else(|| KeyParseError(format!("story key must start with `story:`: {s:?}")))?;
        let (site, id) = rest
            .split_once(':')
            .ok_or_else(|| KeyParseError(format!("story key must be story:<site>:<id>: {s:?}")))?;
        let id = id
            .parse::<u64>()
            .map_err(|err| KeyParseError(format!("story id must be numeric in {s:?}: {err}")))?;
        Ok(Self::new(site.parse()?, id))
    }
}

impl TryFrom<String> for StoryKey {
    type Error = KeyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StoryKey> for String {
    fn from(key: StoryKey) -> Self {
        key.to_string()
    }
}

/// Composite key of a user: `user:<site>:<id>`. User ids are opaque strings
/// (numeric on fanfiction.net, lowercase names on AO3).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserKey {
    pub site: Site,
    pub id: String,
}

impl UserKey {
    pub fn new(site: Site, id: impl Into<String>) -> Self {
        Self {
            site,
            id: id.into(),
        }
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user:{}:{}", self.site, self.id)
    }
}

impl FromStr for UserKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("user:")
            .ok_or_else(|| KeyParseError(format!("user key must start with `user:`: {s:?}")))?;
        let (site, id) = rest
            .split_once(':')
            .ok_or_else(|| KeyParseError(format!("user key must be user:<site>:<id>: {s:?}")))?;
        if id.is_empty() {
            return Err(KeyParseError(format!("user id must not be empty: {s:?}")));
        }
        Ok(Self::new(site.parse()?, id))
    }
}

impl TryFrom<String> for UserKey {
    type Error = KeyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UserKey> for String {
    fn from(key: UserKey) -> Self {
        key.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKey {
    Story(StoryKey),
    User(UserKey),
}

impl EntityKey {
    pub fn site(&self) -> Site {
        match self {
            EntityKey::Story(key) => key.site,
            EntityKey::User(key) => key.site,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Story(key) => key.fmt(f),
            EntityKey::User(key) => key.fmt(f),
        }
    }
}

impl FromStr for EntityKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("story:") {
            s.parse().map(EntityKey::Story)
        } else if s.starts_with("user:") {
            s.parse().map(EntityKey::User)
        } else {
            Err(KeyParseError(format!(
                "entity key must start with `story:` or `user:`: {s:?}"
            )))
        }
    }
}

impl From<StoryKey> for EntityKey {
    fn from(key: StoryKey) -> Self {
        EntityKey::Story(key)
    }
}

impl From<UserKey> for EntityKey {
    fn from(key: UserKey) -> Self {
        EntityKey::User(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Story {
    pub site: Site,
    pub id: u64,
    #[serde(default)]
    pub exists: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub image: String,
    /// Derived by [`Story::annotate`]; never persisted.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Derived by [`Story::annotate`]; never persisted.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dl: String,
    #[serde(default)]
    pub word_count: u64,
    #[serde(default)]
    pub date_submit: i64,
    #[serde(default)]
    pub date_update: i64,
    #[serde(default)]
    pub reviews: u64,
    #[serde(default)]
    pub chapters: u64,
    #[serde(default)]
    pub favorites: u64,
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<UserKey>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub favorited_by: BTreeSet<UserKey>,
    /// Co-occurrence score; only set on recommendation results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u64>,
}

impl Story {
    /// A story with identity only and `exists = false`.
    pub fn new(key: StoryKey) -> Self {
        Self {
            site: key.site,
            id: key.id,
            exists: false,
            title: String::new(),
            desc: String::new(),
            category: String::new(),
            image: String::new(),
            url: String::new(),
            dl: String::new(),
            word_count: 0,
            date_submit: 0,
            date_update: 0,
            reviews: 0,
            chapters: 0,
            favorites: 0,
            complete: false,
            author: None,
            favorited_by: BTreeSet::new(),
            score: None,
        }
    }

    /// Marks a story confirmed absent on the source site.
    pub fn absent(key: StoryKey) -> Self {
        Self::new(key)
    }

    pub fn key(&self) -> StoryKey {
        StoryKey::new(self.site, self.id)
    }

    /// Recomputes the canonical and download URLs from `(site, id, title)`.
    pub fn annotate(&mut self) {
        match self.site {
            Site::Ffnet => {
                self.url = format!(
                    "https://www.fanfiction.net/s/{}/{}",
                    self.id,
                    title_slug(&self.title)
                );
                self.dl = ficsave_link(&self.url);
            }
            Site::FictionPress => {
                self.url = format!(
                    "https://www.fictionpress.com/s/{}/{}",
                    self.id,
                    title_slug(&self.title)
                );
                self.dl = ficsave_link(&self.url);
            }
            Site::Ao3 => {
                self.url = format!("https://archiveofourown.org/works/{}", self.id);
                self.dl = format!(
                    "https://archiveofourown.org/downloads/a/a/{}/a.epub",
                    self.id
                );
            }
        }
    }
}

fn title_slug(title: &str) -> String {
    title.replace(' ', "-")
}

fn ficsave_link(story_url: &str) -> String {
    format!("http://ficsave.com/?format=epub&e=&auto_download=yes&story_url={story_url}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct User {
    pub site: Site,
    pub id: String,
    #[serde(default)]
    pub exists: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub stories: BTreeSet<StoryKey>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub favorite_stories: BTreeSet<StoryKey>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub favorite_authors: BTreeSet<UserKey>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub favorited_by: BTreeSet<UserKey>,
}

impl User {
    pub fn new(key: UserKey) -> Self {
        Self {
            site: key.site,
            id: key.id,
            exists: false,
            name: String::new(),
            stories: BTreeSet::new(),
            favorite_stories: BTreeSet::new(),
            favorite_authors: BTreeSet::new(),
            favorited_by: BTreeSet::new(),
        }
    }

    pub fn absent(key: UserKey) -> Self {
        Self::new(key)
    }

    pub fn key(&self) -> UserKey {
        UserKey::new(self.site, self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Story(Story),
    User(User),
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        match self {
            Entity::Story(story) => EntityKey::Story(story.key()),
            Entity::User(user) => EntityKey::User(user.key()),
        }
    }

    /// Existence-only record for a key confirmed absent on its site.
    pub fn absent(key: &EntityKey) -> Self {
        match key {
            EntityKey::Story(key) => Entity::Story(Story::absent(*key)),
            EntityKey::User(key) => Entity::User(User::absent(key.clone())),
        }
    }
}

impl From<Story> for Entity {
    fn from(story: Story) -> Self {
        Entity::Story(story)
    }
}

impl From<User> for Entity {
    fn from(user: User) -> Self {
        Entity::User(user)
    }
}
