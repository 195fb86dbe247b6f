//! Lazily computed, memoized statistics for one user.
//!
//! Every accessor fetches on first use and caches the result for the lifetime
//! of the [`Stats`] value. Concurrent first callers share a single fetch: the
//! cells are [`tokio::sync::OnceCell`]s, so late arrivals wait on the
//! in-flight initialisation instead of starting their own. A failed fetch
//! leaves the cell empty.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::RepoFilter;
use crate::github::{PageCursors, RepoPage, Repository, StatsSource};

/// Per-repository requests in flight at once.
const REPO_CONCURRENCY: usize = 8;

/// Everything derived from the paginated repository listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overview {
    pub name: String,
    pub repos: Vec<String>,
    pub stargazers: u64,
    pub forks: u64,
    pub languages: BTreeMap<String, u64>,
}

impl Overview {
    /// Folds one repository in, unless it has already been seen or the filter
    /// rejects it.
    fn add(&mut self, repo: Repository, filter: &RepoFilter, seen: &mut HashSet<String>) {
        if !seen.insert(repo.name_with_owner.clone()) {
            return;
        }
        if !keep(&repo, filter) {
            debug!("Excluding {}", repo.name_with_owner);
            return;
        }

        self.stargazers = self.stargazers.saturating_add(repo.stargazers);
        self.forks = self.forks.saturating_add(repo.fork_count);
        for lang in repo.languages {
            if filter.is_excluded_lang(&lang.name) {
                continue;
            }
            let bytes = self.languages.entry(lang.name).or_default();
            *bytes = bytes.saturating_add(lang.size);
        }
        self.repos.push(repo.name_with_owner);
    }
}

/// Whether a repository counts towards any statistic.
pub fn keep(repo: &Repository, filter: &RepoFilter) -> bool {
    if filter.exclude_forks && repo.is_fork {
        return false;
    }
    if filter.is_excluded_repo(&repo.name_with_owner) {
        return false;
    }
    !repo
        .primary_language
        .as_deref()
        .is_some_and(|lang| filter.is_excluded_lang(lang))
}

/// Where a side of the overview pagination stands.
#[derive(Default)]
struct Side {
    cursor: Option<String>,
    done: bool,
}

impl Side {
    /// Takes this page's nodes if the side was still being paged, and
    /// advances the cursor.
    fn advance(&mut self, page: RepoPage) -> Vec<Repository> {
        if self.done {
            return Vec::new();
        }
        self.done = !page.page_info.has_next_page || page.page_info.end_cursor.is_none();
        if let Some(cursor) = page.page_info.end_cursor {
            self.cursor = Some(cursor);
        }
        page.nodes
    }
}

pub struct Stats<S> {
    source: S,
    username: String,
    filter: RepoFilter,
    overview: OnceCell<Overview>,
    contributions: OnceCell<u64>,
    lines_changed: OnceCell<(u64, u64)>,
    views: OnceCell<u64>,
}

impl<S: StatsSource> Stats<S> {
    pub fn new(source: S, username: impl Into<String>, filter: RepoFilter) -> Self {
        Self {
            source,
            username: username.into(),
            filter,
            overview: OnceCell::new(),
            contributions: OnceCell::new(),
            lines_changed: OnceCell::new(),
            views: OnceCell::new(),
        }
    }

    /// The overview if some accessor already fetched it. Never fetches.
    pub fn cached_overview(&self) -> Option<&Overview> {
        self.overview.get()
    }

    async fn overview(&self) -> Result<&Overview> {
        self.overview
            .get_or_try_init(|| self.fetch_overview())
            .await
    }

    /// Walks owned and contributed-to repositories page by page until both
    /// listings are exhausted.
    async fn fetch_overview(&self) -> Result<Overview> {
        let mut overview = Overview::default();
        let mut seen = HashSet::new();
        let mut owned = Side::default();
        let mut contributed = Side::default();
        let mut pages = 0usize;

        loop {
            let cursors = PageCursors {
                owned: owned.cursor.clone(),
                contributed: contributed.cursor.clone(),
            };
            let page = self
                .source
                .overview_page(&cursors)
                .await
                .with_context(|| format!("Failed to fetch repository page {}", pages + 1))?;
            pages += 1;

            if overview.name.is_empty() {
                overview.name = page
                    .name
                    .filter(|n| !n.is_empty())
                    .or_else(|| Some(page.login).filter(|l| !l.is_empty()))
                    .unwrap_or_else(|| "No Name".to_string());
            }

            for repo in owned
                .advance(page.owned)
                .into_iter()
                .chain(contributed.advance(page.contributed))
            {
                overview.add(repo, &self.filter, &mut seen);
            }

            if owned.done && contributed.done {
                break;
            }
        }

        info!(
            "Fetched {pages} repository page(s): {} of {} repositories kept",
            overview.repos.len(),
            seen.len()
        );
        Ok(overview)
    }

    /// Display name, falling back to the login.
    pub async fn name(&self) -> Result<&str> {
        Ok(&self.overview().await?.name)
    }

    pub async fn stargazers(&self) -> Result<u64> {
        Ok(self.overview().await?.stargazers)
    }

    pub async fn forks(&self) -> Result<u64> {
        Ok(self.overview().await?.forks)
    }

    /// Bytes of code per language, excluded languages left out.
    pub async fn languages(&self) -> Result<&BTreeMap<String, u64>> {
        Ok(&self.overview().await?.languages)
    }

    /// Kept repositories as `owner/name`.
    pub async fn repos(&self) -> Result<&[String]> {
        Ok(&self.overview().await?.repos)
    }

    pub async fn total_contributions(&self) -> Result<u64> {
        self.contributions
            .get_or_try_init(|| self.fetch_contributions())
            .await
            .copied()
    }

    async fn fetch_contributions(&self) -> Result<u64> {
        let years = self
            .source
            .contribution_years()
            .await
            .context("Failed to fetch contribution years")?;
        let total = self
            .source
            .contributions_in_years(&years)
            .await
            .context("Failed to fetch contribution totals")?;
        debug!("{total} contributions over {} year(s)", years.len());
        Ok(total)
    }

    /// `(additions, deletions)` authored by the user across kept repositories.
    pub async fn lines_changed(&self) -> Result<(u64, u64)> {
        self.lines_changed
            .get_or_try_init(|| self.fetch_lines_changed())
            .await
            .copied()
    }

    async fn fetch_lines_changed(&self) -> Result<(u64, u64)> {
        let repos = self.repos().await?;
        let per_repo: Vec<(u64, u64)> = stream::iter(repos)
            .map(|repo| self.repo_lines_changed(repo))
            .buffer_unordered(REPO_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(per_repo
            .into_iter()
            .fold((0u64, 0u64), |(a, d), (ra, rd)| {
                (a.saturating_add(ra), d.saturating_add(rd))
            }))
    }

    async fn repo_lines_changed(&self, repo: &str) -> Result<(u64, u64)> {
        let contributors = self
            .source
            .contributor_stats(repo)
            .await
            .with_context(|| format!("Failed to fetch contributor stats for {repo}"))?;

        let mut additions = 0u64;
        let mut deletions = 0u64;
        for contributor in contributors
            .iter()
            .filter(|c| c.author.as_deref() == Some(self.username.as_str()))
        {
            for week in &contributor.weeks {
                additions = additions.saturating_add(week.additions);
                deletions = deletions.saturating_add(week.deletions);
            }
        }
        Ok((additions, deletions))
    }

    /// Traffic views summed over kept repositories.
    pub async fn views(&self) -> Result<u64> {
        self.views.get_or_try_init(|| self.fetch_views()).await.copied()
    }

    async fn fetch_views(&self) -> Result<u64> {
        let repos = self.repos().await?;
        let per_repo: Vec<u64> = stream::iter(repos)
            .map(|repo| async move {
                self.source
                    .traffic_views(repo)
                    .await
                    .with_context(|| format!("Failed to fetch traffic for {repo}"))
            })
            .buffer_unordered(REPO_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(per_repo.into_iter().fold(0u64, u64::saturating_add))
    }
}
