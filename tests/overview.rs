use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use github_stats::config::{Config, ACCESS_TOKEN, GITHUB_ACTOR, OUTPUT_DIR, TEMPLATE_DIR};
use github_stats::error::ConfigError;
use github_stats::github::{
    ContributorStats, ContributorWeek, LanguageEdge, OverviewPage, PageCursors, PageInfo,
    RepoPage, Repository, StatsSource,
};
use github_stats::stats::Stats;
use github_stats::{generate_all, render_and_report, run, summary};
use tempfile::TempDir;

const TEMPLATE: &str = r#"<svg xmlns="http://www.w3.org/2000/svg">
<text>{{ name }}</text>
<text>Stars {{ stars }}</text>
<text>Lines {{ lines_changed }}</text>
<text>Contributions {{ contributions }}</text>
<text>Repos {{ repos }}</text>
<text>Views {{ views }}</text>
<text>{{ unknown }}</text>
</svg>
"#;

/// Three repositories: one excluded by name, one by language, one kept.
struct MockGithub;

fn repo(name: &str, stars: u64, lang: &str) -> Repository {
    Repository {
        name_with_owner: name.to_string(),
        is_fork: false,
        stargazers: stars,
        fork_count: 0,
        primary_language: Some(lang.to_string()),
        languages: vec![LanguageEdge {
            name: lang.to_string(),
            size: 100,
        }],
    }
}

fn contributor(login: &str, additions: u64, deletions: u64) -> ContributorStats {
    ContributorStats {
        author: Some(login.to_string()),
        weeks: vec![ContributorWeek {
            additions,
            deletions,
            commits: 1,
        }],
    }
}

#[async_trait]
impl StatsSource for MockGithub {
    async fn overview_page(&self, _cursors: &PageCursors) -> Result<OverviewPage> {
        Ok(OverviewPage {
            login: "octocat".into(),
            name: Some("Mona & Octo".into()),
            owned: RepoPage {
                page_info: PageInfo::default(),
                nodes: vec![
                    repo("octocat/secret", 1000, "Rust"),
                    repo("octocat/notebooks", 500, "Jupyter Notebook"),
                    repo("octocat/kept", 10, "Rust"),
                ],
            },
            contributed: RepoPage::default(),
        })
    }

    async fn contribution_years(&self) -> Result<Vec<i32>> {
        Ok(vec![2024, 2025])
    }

    async fn contributions_in_years(&self, years: &[i32]) -> Result<u64> {
        let by_year = HashMap::from([(2024, 30u64), (2025, 12u64)]);
        Ok(years.iter().filter_map(|y| by_year.get(y)).sum())
    }

    async fn contributor_stats(&self, repo: &str) -> Result<Vec<ContributorStats>> {
        Ok(match repo {
            "octocat/kept" => vec![contributor("octocat", 100, 50), contributor("hubot", 7, 7)],
            _ => vec![contributor("octocat", 9999, 9999)],
        })
    }

    async fn traffic_views(&self, repo: &str) -> Result<u64> {
        Ok(if repo == "octocat/kept" { 5 } else { 777 })
    }
}

/// Every remote call fails, as with a revoked token.
struct UnreachableGithub;

#[async_trait]
impl StatsSource for UnreachableGithub {
    async fn overview_page(&self, _cursors: &PageCursors) -> Result<OverviewPage> {
        anyhow::bail!("GitHub API returned HTTP 401")
    }

    async fn contribution_years(&self) -> Result<Vec<i32>> {
        anyhow::bail!("GitHub API returned HTTP 401")
    }

    async fn contributions_in_years(&self, _years: &[i32]) -> Result<u64> {
        anyhow::bail!("GitHub API returned HTTP 401")
    }

    async fn contributor_stats(&self, _repo: &str) -> Result<Vec<ContributorStats>> {
        anyhow::bail!("GitHub API returned HTTP 401")
    }

    async fn traffic_views(&self, _repo: &str) -> Result<u64> {
        anyhow::bail!("GitHub API returned HTTP 401")
    }
}

fn lookup(pairs: Vec<(&'static str, String)>) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<&'static str, String> = pairs.into_iter().collect();
    move |key| map.get(key).cloned()
}

fn dirs(tmp: &TempDir) -> (String, String) {
    let templates = tmp.path().join("templates");
    let output = tmp.path().join("out").join("generated");
    (
        templates.to_string_lossy().into_owned(),
        output.to_string_lossy().into_owned(),
    )
}

fn write_template(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("overview.svg"), TEMPLATE).unwrap();
}

#[tokio::test]
async fn overview_renders_filtered_statistics() {
    let tmp = TempDir::new().unwrap();
    let (templates, output) = dirs(&tmp);
    write_template(Path::new(&templates));

    let config = Config::from_lookup(lookup(vec![
        (ACCESS_TOKEN, "ghp_test".into()),
        (GITHUB_ACTOR, "octocat".into()),
        ("EXCLUDED", "secret".into()),
        ("EXCLUDED_LANGS", "Jupyter Notebook".into()),
        (TEMPLATE_DIR, templates),
        (OUTPUT_DIR, output.clone()),
    ]))
    .unwrap();
    let stats = Stats::new(MockGithub, config.username.as_str(), config.filter.clone());

    generate_all(&stats, &config).await.unwrap();

    let rendered = fs::read_to_string(Path::new(&output).join("overview.svg")).unwrap();
    assert!(rendered.contains("<text>Mona &amp; Octo</text>"));
    assert!(rendered.contains("Stars 10<"));
    assert!(rendered.contains("Lines 150<"));
    assert!(rendered.contains("Contributions 42<"));
    assert!(rendered.contains("Repos 1<"));
    assert!(rendered.contains("Views 5<"));
    assert!(rendered.contains("<text>{{ unknown }}</text>"));
    for token in ["name", "stars", "lines_changed", "contributions", "repos", "views"] {
        assert!(!rendered.contains(&format!("{{{{ {token} }}}}")));
    }
}

#[tokio::test]
async fn missing_template_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let (templates, output) = dirs(&tmp);

    let config = Config::from_lookup(lookup(vec![
        (ACCESS_TOKEN, "ghp_test".into()),
        (GITHUB_ACTOR, "octocat".into()),
        (TEMPLATE_DIR, templates),
        (OUTPUT_DIR, output.clone()),
    ]))
    .unwrap();
    let stats = Stats::new(MockGithub, "octocat", config.filter.clone());

    let err = generate_all(&stats, &config).await.unwrap_err();
    assert!(format!("{err:#}").contains("overview.svg"));
    assert!(!Path::new(&output).exists());
}

#[tokio::test]
async fn missing_credential_fails_before_writing_anything() {
    let tmp = TempDir::new().unwrap();
    let (templates, output) = dirs(&tmp);
    write_template(Path::new(&templates));

    let err = run(lookup(vec![
        (GITHUB_ACTOR, "octocat".into()),
        (TEMPLATE_DIR, templates),
        (OUTPUT_DIR, output.clone()),
    ]))
    .await
    .unwrap_err();

    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::MissingToken(ACCESS_TOKEN))
    );
    assert!(!Path::new(&output).exists());
}

#[tokio::test]
async fn missing_actor_fails_before_writing_anything() {
    let tmp = TempDir::new().unwrap();
    let (templates, output) = dirs(&tmp);
    write_template(Path::new(&templates));

    let err = run(lookup(vec![
        (ACCESS_TOKEN, "ghp_test".into()),
        (TEMPLATE_DIR, templates),
        (OUTPUT_DIR, output.clone()),
    ]))
    .await
    .unwrap_err();

    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::Missing(GITHUB_ACTOR))
    );
    assert!(!Path::new(&output).exists());
}

#[tokio::test]
async fn template_without_tokens_never_touches_the_network() {
    let tmp = TempDir::new().unwrap();
    let (templates, output) = dirs(&tmp);
    fs::create_dir_all(&templates).unwrap();
    fs::write(Path::new(&templates).join("overview.svg"), "<svg>no tokens</svg>").unwrap();

    let config = Config::from_lookup(lookup(vec![
        (ACCESS_TOKEN, "ghp_revoked".into()),
        (GITHUB_ACTOR, "octocat".into()),
        (TEMPLATE_DIR, templates),
        (OUTPUT_DIR, output.clone()),
    ]))
    .unwrap();
    let stats = Stats::new(UnreachableGithub, "octocat", config.filter.clone());

    render_and_report(&stats, &config).await.unwrap();

    let rendered = fs::read_to_string(Path::new(&output).join("overview.svg")).unwrap();
    assert_eq!(rendered, "<svg>no tokens</svg>");
    assert!(stats.cached_overview().is_none());
    assert_eq!(summary(&stats), None);
}

#[tokio::test]
async fn summary_reports_what_rendering_fetched() {
    let tmp = TempDir::new().unwrap();
    let (templates, output) = dirs(&tmp);
    write_template(Path::new(&templates));

    let config = Config::from_lookup(lookup(vec![
        (ACCESS_TOKEN, "ghp_test".into()),
        (GITHUB_ACTOR, "octocat".into()),
        ("EXCLUDED", "secret".into()),
        ("EXCLUDED_LANGS", "Jupyter Notebook".into()),
        (TEMPLATE_DIR, templates),
        (OUTPUT_DIR, output),
    ]))
    .unwrap();
    let stats = Stats::new(MockGithub, "octocat", config.filter.clone());

    render_and_report(&stats, &config).await.unwrap();

    assert_eq!(
        summary(&stats).as_deref(),
        Some("10 stars and 0 forks across 1 repositories; top languages: Rust")
    );
}
