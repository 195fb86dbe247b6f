use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use tracing::{debug, info};

use crate::github::StatsSource;
use crate::stats::Stats;

/// Matches `{{ field }}`, whitespace inside the braces optional.
static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_]+)\s*\}\}").expect("token pattern is valid")
});

/// Placeholders a template may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    LinesChanged,
    Stars,
    Contributions,
    Repos,
    Views,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::Name,
        Field::LinesChanged,
        Field::Stars,
        Field::Contributions,
        Field::Repos,
        Field::Views,
    ];

    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "name" => Field::Name,
            "lines_changed" => Field::LinesChanged,
            "stars" => Field::Stars,
            "contributions" => Field::Contributions,
            "repos" => Field::Repos,
            "views" => Field::Views,
            _ => return None,
        })
    }

    pub fn token(self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::LinesChanged => "lines_changed",
            Field::Stars => "stars",
            Field::Contributions => "contributions",
            Field::Repos => "repos",
            Field::Views => "views",
        }
    }

    /// The statistic, formatted for insertion into SVG text.
    pub async fn resolve<S: StatsSource>(self, stats: &Stats<S>) -> Result<String> {
        Ok(match self {
            Field::Name => escape_xml(stats.name().await?),
            Field::LinesChanged => {
                let (added, deleted) = stats.lines_changed().await?;
                format_number(added.saturating_add(deleted))
            }
            Field::Stars => format_number(stats.stargazers().await?),
            Field::Contributions => format_number(stats.total_contributions().await?),
            Field::Repos => format_number(stats.repos().await?.len() as u64),
            Field::Views => format_number(stats.views().await?),
        })
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// `1234567` -> `"1,234,567"`.
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Recognised fields referenced by `template`, in first-seen order.
pub fn referenced_fields(template: &str) -> Vec<Field> {
    let mut fields = Vec::new();
    for caps in TOKEN.captures_iter(template) {
        if let Some(field) = Field::from_token(&caps[1]) {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
    }
    fields
}

/// Replaces every recognised token in one pass. Unknown tokens, and known
/// ones without a value, are left as they are.
pub fn substitute(template: &str, values: &HashMap<Field, String>) -> String {
    TOKEN
        .replace_all(template, |caps: &Captures| {
            Field::from_token(&caps[1])
                .and_then(|field| values.get(&field))
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Fetches whatever the template needs, then fills it in.
pub async fn render<S: StatsSource>(template: &str, stats: &Stats<S>) -> Result<String> {
    let mut values = HashMap::new();
    for field in referenced_fields(template) {
        let value = field
            .resolve(stats)
            .await
            .with_context(|| format!("Failed to compute {{{{ {} }}}}", field.token()))?;
        debug!("{} = {value}", field.token());
        values.insert(field, value);
    }
    Ok(substitute(template, &values))
}

/// Renders `template_dir/artifact` into `output_dir/artifact`.
pub async fn generate_artifact<S: StatsSource>(
    stats: &Stats<S>,
    template_dir: &Path,
    output_dir: &Path,
    artifact: &str,
) -> Result<()> {
    let template_path = template_dir.join(artifact);
    let output_path = output_dir.join(artifact);

    let template = tokio::fs::read_to_string(&template_path)
        .await
        .with_context(|| format!("Failed to read template {}", template_path.display()))?;

    let output = render(&template, stats).await?;

    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&output_path, output)
        .await
        .with_context(|| format!("Failed to write {}", output_path.display()))?;

    info!("Generated {}", output_path.display());
    Ok(())
}
