pub mod config;
pub mod error;
pub mod github;
pub mod stats;
pub mod svg;

use anyhow::Result;
use futures::future::try_join_all;
use tracing::info;

use config::Config;
use github::{GithubClient, StatsSource};
use stats::Stats;

/// Artifacts rendered on every run, relative to the template and output directories.
pub const ARTIFACTS: &[&str] = &["overview.svg"];

/// Renders every artifact concurrently against one shared [`Stats`].
/// The first failure aborts the rest.
pub async fn generate_all<S: StatsSource>(stats: &Stats<S>, config: &Config) -> Result<()> {
    try_join_all(ARTIFACTS.iter().map(|artifact| {
        svg::generate_artifact(stats, &config.template_dir, &config.output_dir, artifact)
    }))
    .await?;
    Ok(())
}

/// Full run: configuration, then one client for the whole run, then rendering.
pub async fn run<F>(lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let config = Config::from_lookup(lookup)?;
    info!(user = %config.username, filter = ?config.filter, "Collecting statistics");

    let client = GithubClient::new(config.access_token.as_str())?;
    let stats = Stats::new(client, config.username.as_str(), config.filter.clone());

    render_and_report(&stats, &config).await
}

/// Renders every artifact, then logs a summary of whatever was fetched on
/// the way. Nothing is fetched just for the summary.
pub async fn render_and_report<S: StatsSource>(stats: &Stats<S>, config: &Config) -> Result<()> {
    generate_all(stats, config).await?;
    if let Some(line) = summary(stats) {
        info!("{line}");
    }
    Ok(())
}

/// One-line overview summary, if the overview is already cached.
pub fn summary<S: StatsSource>(stats: &Stats<S>) -> Option<String> {
    let overview = stats.cached_overview()?;

    let mut languages: Vec<_> = overview.languages.iter().collect();
    languages.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let top = languages
        .into_iter()
        .take(3)
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    Some(format!(
        "{} stars and {} forks across {} repositories; top languages: {top}",
        overview.stargazers,
        overview.forks,
        overview.repos.len()
    ))
}
