//! Co-occurrence recommendations over the favorites graph.
//!
//! For a set of seed stories, every user who favorited a seed votes once for
//! each other story they favorited. Candidates are ranked by votes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use url::Url;

use crate::model::{EntityKey, Story, StoryKey, User, UserKey};
use crate::sites::{SiteCollaborator, SiteRegistry};
use crate::store::{EntityStore, StoreError};

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum RecommendError {
    #[error("story not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stats {
    /// Distinct candidate stories before pagination.
    pub story_count: u64,
    /// Sum of all candidate scores.
    pub favorites: u64,
    /// Distinct users visited.
    pub users: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Recommendation {
    pub stories: Vec<Story>,
    pub authors: Vec<User>,
    pub story: Story,
    pub stats: Stats,
}

#[derive(Clone)]
pub struct RecommendationEngine {
    store: Arc<dyn EntityStore>,
    sites: SiteRegistry,
}

impl RecommendationEngine {
    pub fn new(store: Arc<dyn EntityStore>, sites: SiteRegistry) -> Self {
        Self { store, sites }
    }

    /// Resolves a `|`-separated list of story keys or story URLs and
    /// recommends from it.
    pub async fn recommend_ids(
        &self,
        ids: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Recommendation, RecommendError> {
        let seeds = self.resolve_seeds(ids).await?;
        self.recommend(&seeds, limit, offset).await
    }

    /// Picks the first registered site that recognizes at least one segment
    /// of `ids` as a story it has content for. Only stories with content are
    /// returned, in the order they were given.
    pub async fn resolve_seeds(&self, ids: &str) -> Result<Vec<StoryKey>, RecommendError> {
        let segments: Vec<&str> = ids
            .split('|')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .collect();
        if segments.is_empty() {
            return Err(RecommendError::NotFound("no story id given".to_owned()));
        }

        for site in self.sites.iter() {
            let mut keys = Vec::new();
            for segment in &segments {
                if let Some(key) = segment_key(site.as_ref(), segment) {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }

            let mut known = Vec::with_capacity(keys.len());
            for key in keys {
                if self.store.exists_with_title(&EntityKey::Story(key)).await? {
                    known.push(key);
                }
            }
            if !known.is_empty() {
                return Ok(known);
            }
        }

        Err(RecommendError::NotFound(ids.to_owned()))
    }

    pub async fn recommend(
        &self,
        seeds: &[StoryKey],
        limit: usize,
        offset: usize,
    ) -> Result<Recommendation, RecommendError> {
        let started = Instant::now();
        let Some(first) = seeds.first() else {
            return Err(RecommendError::NotFound("no seed stories".to_owned()));
        };

        let mut seed = match self.store.get_story(first).await {
            Ok(story) => story,
            Err(err) if err.is_not_found() => {
                return Err(RecommendError::NotFound(first.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        if !seed.exists || seed.title.is_empty() {
            return Err(RecommendError::NotFound(first.to_string()));
        }

        let mut readers: BTreeSet<UserKey> = seed.favorited_by.clone();
        for key in &seeds[1..] {
            match self.store.get_story(key).await {
                Ok(story) => readers.extend(story.favorited_by),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }

        let reader_keys: Vec<UserKey> = readers.into_iter().collect();
        let users = self.store.get_users(&reader_keys).await?;

        let mut tally: HashMap<StoryKey, u64> = HashMap::new();
        for user in &users {
            for story in &user.favorite_stories {
                *tally.entry(*story).or_default() += 1;
            }
        }
        for seed_key in seeds {
            tally.remove(seed_key);
        }

        let mut ranked: Vec<(StoryKey, u64)> = tally.into_iter().collect();
        ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let stats = Stats {
            story_count: ranked.len() as u64,
            favorites: ranked.iter().map(|(_, score)| score).sum(),
            users: users.len() as u64,
        };

        let page: Vec<(StoryKey, u64)> = ranked.into_iter().skip(offset).take(limit).collect();
        let page_keys: Vec<StoryKey> = page.iter().map(|(key, _)| *key).collect();
        let mut stories = self.store.get_stories(&page_keys).await?;
        for (story, (_, score)) in stories.iter_mut().zip(&page) {
            story.score = Some(*score);
            story.annotate();
            story.favorited_by.clear();
        }

        let authors = self.page_authors(&stories).await?;

        seed.annotate();
        seed.favorited_by.clear();

        tracing::debug!(
            seed = %first,
            seeds = seeds.len(),
            candidates = stats.story_count,
            users = stats.users,
            returned = stories.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "recommendation computed"
        );

        Ok(Recommendation {
            stories,
            authors,
            story: seed,
            stats,
        })
    }

    /// Authors of `stories` in first-seen order. Authors never written to the
    /// store are left out.
    async fn page_authors(&self, stories: &[Story]) -> Result<Vec<User>, RecommendError> {
        let mut seen = HashSet::new();
        let mut authors = Vec::new();
        for key in stories.iter().filter_map(|story| story.author.as_ref()) {
            if !seen.insert(key) {
                continue;
            }
            match self.store.get_user(key).await {
                Ok(mut user) => {
                    user.favorite_stories.clear();
                    user.favorite_authors.clear();
                    user.favorited_by.clear();
                    authors.push(user);
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(authors)
    }
}

/// A story key in persisted form, or a story URL the site recognizes. Bare
/// host paths like `archiveofourown.org/works/1` are read as https.
fn segment_key(site: &dyn SiteCollaborator, segment: &str) -> Option<StoryKey> {
    if segment.starts_with("story:") {
        return segment
            .parse::<StoryKey>()
            .ok()
            .filter(|key| key.site == site.site());
    }
    let url = Url::parse(segment)
        .ok()
        .filter(|url| url.has_host())
        .or_else(|| Url::parse(&format!("https://{segment}")).ok())?;
    site.story_key(&url)
}
