//! Start-up configuration.
//!
//! Everything the run needs is read once, here, and handed down by reference.
//! Deeper modules never look at the environment themselves.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use tracing::warn;

use crate::error::ConfigError;

pub const ACCESS_TOKEN: &str = "ACCESS_TOKEN";
pub const GITHUB_ACTOR: &str = "GITHUB_ACTOR";
pub const EXCLUDED: &str = "EXCLUDED";
pub const EXCLUDED_LANGS: &str = "EXCLUDED_LANGS";
pub const EXCLUDE_FORKED_REPOS: &str = "EXCLUDE_FORKED_REPOS";
pub const TEMPLATE_DIR: &str = "TEMPLATE_DIR";
pub const OUTPUT_DIR: &str = "OUTPUT_DIR";

const DEFAULT_TEMPLATE_DIR: &str = "templates";
const DEFAULT_OUTPUT_DIR: &str = "generated";

/// Which repositories are left out of every repository-derived statistic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoFilter {
    /// Either `owner/name` or bare `name`.
    pub excluded_repos: BTreeSet<String>,
    /// Stored lowercased.
    pub excluded_langs: BTreeSet<String>,
    pub exclude_forks: bool,
}

impl RepoFilter {
    pub fn new<R, L>(excluded_repos: R, excluded_langs: L, exclude_forks: bool) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        L: IntoIterator,
        L::Item: AsRef<str>,
    {
        Self {
            excluded_repos: excluded_repos.into_iter().map(Into::into).collect(),
            excluded_langs: excluded_langs
                .into_iter()
                .map(|l| l.as_ref().to_lowercase())
                .collect(),
            exclude_forks,
        }
    }

    pub fn is_excluded_repo(&self, name_with_owner: &str) -> bool {
        if self.excluded_repos.contains(name_with_owner) {
            return true;
        }
        name_with_owner
            .rsplit_once('/')
            .is_some_and(|(_, bare)| self.excluded_repos.contains(bare))
    }

    pub fn is_excluded_lang(&self, language: &str) -> bool {
        self.excluded_langs.contains(&language.to_lowercase())
    }
}

#[derive(Clone)]
pub struct Config {
    pub access_token: String,
    pub username: String,
    pub filter: RepoFilter,
    pub template_dir: PathBuf,
    pub output_dir: PathBuf,
}

// Keeps the token out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("access_token", &"<redacted>")
            .field("username", &self.username)
            .field("filter", &self.filter)
            .field("template_dir", &self.template_dir)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

impl Config {
    /// Build from any key lookup. Required settings are checked first.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let access_token = lookup(ACCESS_TOKEN)
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken(ACCESS_TOKEN))?;
        let username = lookup(GITHUB_ACTOR).ok_or(ConfigError::Missing(GITHUB_ACTOR))?;

        let excluded_repos = split_list(lookup(EXCLUDED).as_deref());
        let excluded_langs = split_list(lookup(EXCLUDED_LANGS).as_deref());
        let exclude_forks = parse_truthy(lookup(EXCLUDE_FORKED_REPOS).as_deref());

        Ok(Self {
            access_token,
            username,
            filter: RepoFilter::new(excluded_repos, excluded_langs, exclude_forks),
            template_dir: lookup(TEMPLATE_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATE_DIR)),
            output_dir: lookup(OUTPUT_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
        })
    }
}

/// Comma-separated list, entries trimmed, empty entries dropped.
fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Any non-empty value other than `false` counts as set, so `"0"` and `"no"`
/// are true as well.
fn parse_truthy(raw: Option<&str>) -> bool {
    let Some(raw) = raw else {
        return false;
    };
    if raw.is_empty() {
        return false;
    }
    let value = raw.trim().to_lowercase();
    if matches!(value.as_str(), "0" | "no" | "off") {
        warn!(
            "{EXCLUDE_FORKED_REPOS}={raw:?} is treated as true; only \"false\" disables fork exclusion"
        );
    }
    value != "false"
}
