use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::title::{CaseRule, NamespaceInfo, NamespaceTable, Title};

pub const DEFAULT_USER_AGENT: &str = "wikimove/0.1";
pub const DEFAULT_EDIT_SUMMARY: &str = "Updating links after page moves";
pub const DEFAULT_CHUNK_SIZE: usize = 50;
pub const DEFAULT_MAX_SAVE_RETRIES: usize = 3;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub url: Option<String>,
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub custom_namespaces: Vec<CustomNamespace>,
    /// Interwiki prefixes; links using them are never treated as local pages.
    #[serde(default)]
    pub interwiki: Vec<String>,
    /// Case rule of the standard namespaces. Custom namespaces carry their own.
    #[serde(default)]
    pub case: CaseRule,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CustomNamespace {
    pub name: String,
    pub id: i32,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub case: CaseRule,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSection {
    pub chunk_size: usize,
    pub max_save_retries: usize,
    pub edit_summary: String,
    pub minor_edits: bool,
    pub deletion_categories: Vec<String>,
    pub disambiguation_categories: Vec<String>,
    /// Namespaces scanned by `redirects fix`.
    pub redirect_namespaces: Vec<i32>,
    pub leave_redirects: bool,
    pub move_talk_pages: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_save_retries: DEFAULT_MAX_SAVE_RETRIES,
            edit_summary: DEFAULT_EDIT_SUMMARY.to_string(),
            minor_edits: true,
            deletion_categories: Vec::new(),
            disambiguation_categories: Vec::new(),
            redirect_namespaces: vec![0],
            leave_redirects: true,
            move_talk_pages: true,
        }
    }
}

impl WikiConfig {
    /// Resolve the wiki API URL: env WIKI_API_URL > config > None.
    pub fn api_url_owned(&self) -> Option<String> {
        if let Ok(value) = env::var("WIKI_API_URL") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
        self.wiki.api_url.clone()
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Ok(value) = env::var("WIKI_USER_AGENT") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.wiki
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Bot login from WIKI_BOT_USER / WIKI_BOT_PASS, when both are set.
    pub fn bot_credentials(&self) -> Option<(String, String)> {
        let user = env::var("WIKI_BOT_USER").ok()?.trim().to_string();
        let pass = env::var("WIKI_BOT_PASS").ok()?;
        if user.is_empty() || pass.is_empty() {
            return None;
        }
        Some((user, pass))
    }

    pub fn namespace_table(&self) -> NamespaceTable {
        let mut table = NamespaceTable::standard();
        if self.wiki.case != CaseRule::FirstLetter {
            let ids: Vec<i32> = table.ids().collect();
            for id in ids {
                if let Some(info) = table.get(id).cloned() {
                    table.insert(info.with_case(self.wiki.case));
                }
            }
        }
        for custom in &self.wiki.custom_namespaces {
            let mut info = NamespaceInfo::new(custom.id, &custom.name).with_case(custom.case);
            for alias in &custom.aliases {
                info = info.with_alias(alias);
            }
            table.insert(info);
        }
        for prefix in &self.wiki.interwiki {
            table.add_interwiki(prefix);
        }
        table
    }

    pub fn deletion_categories(&self, table: &NamespaceTable) -> Result<Vec<Title>, ConfigurationError> {
        parse_categories(&self.engine.deletion_categories, table)
    }

    pub fn disambiguation_categories(
        &self,
        table: &NamespaceTable,
    ) -> Result<Vec<Title>, ConfigurationError> {
        parse_categories(&self.engine.disambiguation_categories, table)
    }
}

fn parse_categories(values: &[String], table: &NamespaceTable) -> Result<Vec<Title>, ConfigurationError> {
    values
        .iter()
        .map(|value| {
            Title::parse_with_default(value, crate::title::NS_CATEGORY, table)
                .map_err(|source| ConfigurationError::malformed_title(value, source))
        })
        .collect()
}

/// Load and parse a WikiConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<WikiConfig> {
    if !config_path.exists() {
        return Ok(WikiConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: WikiConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::title::NS_CATEGORY;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_engine_defaults() {
        let config = WikiConfig::default();
        assert!(config.wiki.api_url.is_none());
        assert_eq!(config.engine.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.engine.max_save_retries, DEFAULT_MAX_SAVE_RETRIES);
        assert!(config.engine.minor_edits);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, WikiConfig::default());
    }

    #[test]
    fn load_config_parses_wiki_and_engine_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[wiki]
api_url = "https://example.wiki/api.php"
user_agent = "test-agent/1.0"
interwiki = ["wikipedia"]

[[wiki.custom_namespaces]]
name = "Lore"
id = 3000
aliases = ["LR"]
case = "case-sensitive"

[engine]
chunk_size = 25
edit_summary = "Bot: merge"
deletion_categories = ["Candidates for deletion"]
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.wiki.api_url.as_deref(),
            Some("https://example.wiki/api.php")
        );
        assert_eq!(config.engine.chunk_size, 25);
        assert_eq!(config.engine.edit_summary, "Bot: merge");
        assert_eq!(config.engine.max_save_retries, DEFAULT_MAX_SAVE_RETRIES);

        let table = config.namespace_table();
        assert_eq!(table.lookup("lr"), Some(3000));
        assert_eq!(table.case_rule(3000), CaseRule::CaseSensitive);
        assert!(table.is_interwiki("Wikipedia"));

        let categories = config.deletion_categories(&table).expect("categories");
        assert_eq!(categories[0].namespace(), NS_CATEGORY);
        assert_eq!(categories[0].page_name(), "Candidates for deletion");
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[wiki\nurl = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn malformed_category_is_a_configuration_error() {
        let mut config = WikiConfig::default();
        config.engine.disambiguation_categories = vec!["Bad[name]".to_string()];
        let error = config
            .disambiguation_categories(&config.namespace_table())
            .expect_err("malformed");
        assert!(matches!(error, ConfigurationError::MalformedTitle { .. }));
    }

    #[test]
    fn default_user_agent() {
        let config = WikiConfig::default();
        assert_eq!(config.user_agent(), "wikimove/0.1");
    }
}
