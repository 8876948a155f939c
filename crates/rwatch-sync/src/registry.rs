use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rwatch_storage::store_slug;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const REGISTRY_FILE: &str = "categories.yaml";

const MAJOR_LICENSES: [&str; 5] = ["mit", "apache-2.0", "gpl-3.0", "0bsd", "cc0-1.0"];

/// Tracked categories and the search filters that partition each of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRegistry {
    pub base_query: String,
    pub categories: Vec<CategoryConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub label: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Filters appended to the base query, one catalog request each.
    pub partitions: Vec<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl CategoryRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    /// Major licenses split one partition per license, everything else in one
    /// exclusion partition.
    pub fn license_split(base_query: impl Into<String>) -> Self {
        let exclusion = MAJOR_LICENSES
            .iter()
            .map(|key| format!("-license:{key}"))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            base_query: base_query.into(),
            categories: vec![
                CategoryConfig {
                    label: "Major".to_string(),
                    display_name: "Major licenses".to_string(),
                    enabled: true,
                    partitions: MAJOR_LICENSES
                        .iter()
                        .map(|key| format!("license:{key}"))
                        .collect(),
                },
                CategoryConfig {
                    label: "Other".to_string(),
                    display_name: "Other or no license".to_string(),
                    enabled: true,
                    partitions: vec![exclusion],
                },
            ],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            bail!("registry declares no categories");
        }
        let mut slugs = BTreeSet::new();
        for category in &self.categories {
            if category.label.trim().is_empty() {
                bail!("category with empty label");
            }
            if category.partitions.is_empty() {
                bail!("category {} declares no partitions", category.label);
            }
            // Labels map onto store file names; two labels must not share one.
            if !slugs.insert(store_slug(&category.label)) {
                bail!("category {} collides with another label", category.label);
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &CategoryConfig> {
        self.categories.iter().filter(|c| c.enabled)
    }

    pub fn get(&self, label: &str) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| c.label == label)
    }
}
