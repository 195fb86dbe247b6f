use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, TimeZone, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const API_ROOT: &str = "https://api.github.com";
const USER_AGENT: &str = "github-stats";

const MAX_RETRIES: usize = 4;
/// GitHub answers 202 while it computes repository statistics in the background.
const STATS_POLL_ATTEMPTS: usize = 60;
const STATS_POLL_DELAY: Duration = Duration::from_secs(2);

/// Remote queries the aggregator is built from. [`GithubClient`] is the real
/// implementation; tests substitute their own.
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// One page of owned and contributed-to repositories.
    async fn overview_page(&self, cursors: &PageCursors) -> Result<OverviewPage>;

    async fn contribution_years(&self) -> Result<Vec<i32>>;

    /// Sum of contribution-calendar totals over the given years.
    async fn contributions_in_years(&self, years: &[i32]) -> Result<u64>;

    /// Weekly per-author statistics; empty when GitHub has none to give.
    async fn contributor_stats(&self, repo: &str) -> Result<Vec<ContributorStats>>;

    /// Total views over the traffic window; zero when traffic is not visible.
    async fn traffic_views(&self, repo: &str) -> Result<u64>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCursors {
    pub owned: Option<String>,
    pub contributed: Option<String>,
}

#[derive(Deserialize)]
struct CountObj {
    #[serde(rename = "totalCount")]
    total_count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageInfo {
    #[serde(rename = "hasNextPage")]
    pub has_next_page: bool,
    #[serde(rename = "endCursor")]
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoPage {
    #[serde(rename = "pageInfo")]
    pub page_info: PageInfo,
    #[serde(default, deserialize_with = "nodes_or_empty")]
    pub nodes: Vec<Repository>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverviewPage {
    pub login: String,
    pub name: Option<String>,
    #[serde(rename = "repositories")]
    pub owned: RepoPage,
    #[serde(rename = "repositoriesContributedTo")]
    pub contributed: RepoPage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageEdge {
    pub name: String,
    pub size: u64,
}

/// A repository as returned by the overview query.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawRepository")]
pub struct Repository {
    pub name_with_owner: String,
    pub is_fork: bool,
    pub stargazers: u64,
    pub fork_count: u64,
    pub primary_language: Option<String>,
    pub languages: Vec<LanguageEdge>,
}

#[derive(Deserialize)]
struct RawRepository {
    #[serde(rename = "nameWithOwner")]
    name_with_owner: String,
    #[serde(rename = "isFork", default)]
    is_fork: bool,
    stargazers: CountObj,
    #[serde(rename = "forkCount", default)]
    fork_count: u64,
    #[serde(rename = "primaryLanguage")]
    primary_language: Option<NamedNode>,
    languages: Option<LanguageConnection>,
}

#[derive(Deserialize)]
struct NamedNode {
    name: String,
}

#[derive(Deserialize)]
struct LanguageConnection {
    #[serde(default)]
    edges: Option<Vec<RawLanguageEdge>>,
}

#[derive(Deserialize)]
struct RawLanguageEdge {
    size: u64,
    node: NamedNode,
}

impl From<RawRepository> for Repository {
    fn from(raw: RawRepository) -> Self {
        Self {
            name_with_owner: raw.name_with_owner,
            is_fork: raw.is_fork,
            stargazers: raw.stargazers.total_count,
            fork_count: raw.fork_count,
            primary_language: raw.primary_language.map(|l| l.name),
            languages: raw
                .languages
                .and_then(|c| c.edges)
                .unwrap_or_default()
                .into_iter()
                .map(|e| LanguageEdge {
                    name: e.node.name,
                    size: e.size,
                })
                .collect(),
        }
    }
}

// GraphQL hands back `nodes: null` for inaccessible connections.
fn nodes_or_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Repository>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Option<Repository>>>::deserialize(deserializer)?
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContributorWeek {
    #[serde(rename = "a", default)]
    pub additions: u64,
    #[serde(rename = "d", default)]
    pub deletions: u64,
    #[serde(rename = "c", default)]
    pub commits: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContributorStats {
    #[serde(default, deserialize_with = "author_login")]
    pub author: Option<String>,
    #[serde(default)]
    pub weeks: Vec<ContributorWeek>,
}

fn author_login<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Author {
        login: Option<String>,
    }
    Ok(Option::<Author>::deserialize(deserializer)?.and_then(|a| a.login))
}

const OVERVIEW_QUERY: &str = r#"
query($ownedCursor: String, $contribCursor: String) {
    viewer {
        login
        name
        repositories(
            first: 100,
            ownerAffiliations: OWNER,
            orderBy: {field: UPDATED_AT, direction: DESC},
            after: $ownedCursor
        ) {
            pageInfo { hasNextPage endCursor }
            nodes { ...RepoFields }
        }
        repositoriesContributedTo(
            first: 100,
            includeUserRepositories: false,
            orderBy: {field: UPDATED_AT, direction: DESC},
            contributionTypes: [COMMIT, PULL_REQUEST, REPOSITORY, PULL_REQUEST_REVIEW],
            after: $contribCursor
        ) {
            pageInfo { hasNextPage endCursor }
            nodes { ...RepoFields }
        }
    }
}

fragment RepoFields on Repository {
    nameWithOwner
    isFork
    stargazers { totalCount }
    forkCount
    primaryLanguage { name }
    languages(first: 10, orderBy: {field: SIZE, direction: DESC}) {
        edges {
            size
            node { name }
        }
    }
}
"#;

const CONTRIBUTION_YEARS_QUERY: &str = r#"
query {
    viewer {
        contributionsCollection {
            contributionYears
        }
    }
}
"#;

/// Builds one aliased query asking for every year's calendar total at once.
fn contributions_by_year_query(years: &[i32]) -> Result<String> {
    let mut fields = String::new();
    for &year in years {
        let from = year_start(year)?;
        let to = year_start(year + 1)?;
        fields.push_str(&format!(
            r#"
        year{year}: contributionsCollection(from: "{from}", to: "{to}") {{
            contributionCalendar {{
                totalContributions
            }}
        }}"#
        ));
    }
    Ok(format!(
        r#"
query {{
    viewer {{{fields}
    }}
}}
"#
    ))
}

fn year_start(year: i32) -> Result<String> {
    let start = Utc
        .with_ymd_and_hms(year, 1, 1, 0, 0, 0)
        .single()
        .with_context(|| format!("Invalid contribution year {year}"))?;
    Ok(start.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// GitHub GraphQL + REST client sharing one connection pool.
#[derive(Clone)]
pub struct GithubClient {
    token: String,
    http: Client,
    base_url: String,
    poll_delay: Duration,
}

impl GithubClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, API_ROOT)
    }

    /// Client against another API root, e.g. a GitHub Enterprise host.
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            token: token.into(),
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_delay: STATS_POLL_DELAY,
        })
    }

    /// Delay between polls while GitHub is still computing statistics.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    /// Sends a request, retrying rate limits and server errors.
    async fn send<F>(&self, what: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0usize;

        loop {
            attempt += 1;

            let resp = build()
                .bearer_auth(&self.token)
                .send()
                .await
                .with_context(|| format!("Network error sending {what}"))?;

            let status = resp.status();

            // If rate limited, honor Retry-After header when present
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RETRIES {
                let wait_secs = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(2);
                warn!("{what} rate-limited, retrying in {wait_secs}s");
                sleep(Duration::from_secs(wait_secs)).await;
                continue;
            }

            if status.is_server_error() && attempt < MAX_RETRIES {
                let backoff = Duration::from_millis(250u64.saturating_mul(1 << (attempt - 1)));
                warn!("{what} returned HTTP {}, retrying in {backoff:?}", status.as_u16());
                sleep(backoff).await;
                continue;
            }

            return Ok(resp);
        }
    }

    /// GraphQL request with `errors` checking.
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let body = json!({ "query": query, "variables": variables });
        let resp = self
            .send("GraphQL request", || {
                self.http.post(format!("{}/graphql", self.base_url)).json(&body)
            })
            .await?;

        let status = resp.status();
        let json: Value = resp
            .json()
            .await
            .context("Failed to parse JSON from GitHub")?;

        if let Some(errors) = json.get("errors") {
            anyhow::bail!("GraphQL reported errors: {errors:#}");
        }
        if !status.is_success() {
            anyhow::bail!("GitHub API returned HTTP {}: {json:#}", status.as_u16());
        }

        json.get("data")
            .and_then(|d| d.get("viewer"))
            .cloned()
            .context("GraphQL response has no viewer data")
    }

    /// REST GET. `None` means GitHub has no data for us: still computing after
    /// every poll, no content, or not visible with this token.
    async fn rest(&self, path: &str) -> Result<Option<Value>> {
        let url = format!("{}{path}", self.base_url);

        for _ in 0..STATS_POLL_ATTEMPTS {
            let resp = self
                .send(&format!("GET {path}"), || {
                    self.http
                        .get(&url)
                        .header("Accept", "application/vnd.github+json")
                })
                .await?;

            let status = resp.status();
            if status == StatusCode::ACCEPTED {
                debug!("GET {path} still computing, polling again");
                sleep(self.poll_delay).await;
                continue;
            }
            if status == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            if status == StatusCode::FORBIDDEN || status == StatusCode::NOT_FOUND {
                warn!("GET {path} returned HTTP {}, skipping", status.as_u16());
                return Ok(None);
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("GET {path} returned HTTP {}: {body}", status.as_u16());
            }

            let json = resp
                .json()
                .await
                .with_context(|| format!("Failed to parse JSON from GET {path}"))?;
            return Ok(Some(json));
        }

        warn!("GET {path} still computing after {STATS_POLL_ATTEMPTS} polls, skipping");
        Ok(None)
    }
}

#[async_trait]
impl StatsSource for GithubClient {
    async fn overview_page(&self, cursors: &PageCursors) -> Result<OverviewPage> {
        let viewer = self
            .graphql(
                OVERVIEW_QUERY,
                json!({
                    "ownedCursor": cursors.owned,
                    "contribCursor": cursors.contributed,
                }),
            )
            .await?;
        serde_json::from_value(viewer).context("Failed to deserialize overview response")
    }

    async fn contribution_years(&self) -> Result<Vec<i32>> {
        #[derive(Deserialize)]
        struct YearsViewer {
            #[serde(rename = "contributionsCollection")]
            contributions_collection: YearsCollection,
        }
        #[derive(Deserialize)]
        struct YearsCollection {
            #[serde(rename = "contributionYears")]
            contribution_years: Vec<i32>,
        }

        let viewer = self.graphql(CONTRIBUTION_YEARS_QUERY, json!({})).await?;
        let parsed: YearsViewer = serde_json::from_value(viewer)
            .context("Failed to deserialize contribution years response")?;
        Ok(parsed.contributions_collection.contribution_years)
    }

    async fn contributions_in_years(&self, years: &[i32]) -> Result<u64> {
        #[derive(Deserialize)]
        struct YearCollection {
            #[serde(rename = "contributionCalendar")]
            contribution_calendar: Calendar,
        }
        #[derive(Deserialize)]
        struct Calendar {
            #[serde(rename = "totalContributions")]
            total_contributions: u64,
        }

        if years.is_empty() {
            return Ok(0);
        }

        let query = contributions_by_year_query(years)?;
        let viewer = self.graphql(&query, json!({})).await?;
        let by_year: HashMap<String, YearCollection> = serde_json::from_value(viewer)
            .context("Failed to deserialize contributions response")?;

        Ok(by_year
            .values()
            .map(|y| y.contribution_calendar.total_contributions)
            .sum())
    }

    async fn contributor_stats(&self, repo: &str) -> Result<Vec<ContributorStats>> {
        match self.rest(&format!("/repos/{repo}/stats/contributors")).await? {
            Some(json) => serde_json::from_value(json)
                .with_context(|| format!("Failed to deserialize contributor stats for {repo}")),
            None => Ok(Vec::new()),
        }
    }

    async fn traffic_views(&self, repo: &str) -> Result<u64> {
        #[derive(Deserialize)]
        struct Traffic {
            #[serde(default)]
            views: Vec<ViewBucket>,
        }
        #[derive(Deserialize)]
        struct ViewBucket {
            #[serde(default)]
            count: u64,
        }

        let Some(json) = self.rest(&format!("/repos/{repo}/traffic/views")).await? else {
            return Ok(0);
        };
        let traffic: Traffic = serde_json::from_value(json)
            .with_context(|| format!("Failed to deserialize traffic for {repo}"))?;
        Ok(traffic.views.iter().map(|v| v.count).sum())
    }
}
