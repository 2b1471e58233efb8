/*
 * Meeting Minutes Pipeline - Hotword Registry
 * Copyright (c) 2024 Meeting Minutes Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};

/// Maximum length of the rendered hotword blob handed to ASR providers.
pub const RENDER_CAP: usize = 4_096;

#[derive(Debug, Clone, Default)]
pub struct HotwordCategory {
    pub name: String,
    pub words: Vec<String>,
}

/// Alias substitutions for one category, alias → canonical.
#[derive(Debug, Clone, Default)]
pub struct HotwordMapping {
    pub category: String,
    pub aliases: Vec<(String, String)>,
}

/// Immutable snapshot of the hotword file. Readers hold an `Arc` to a
/// snapshot; reload builds a new table and swaps the pointer, so no
/// reader ever observes a partial table.
#[derive(Debug, Clone, Default)]
pub struct HotwordTable {
    pub categories: Vec<HotwordCategory>,
    pub mappings: Vec<HotwordMapping>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadStats {
    pub categories: usize,
    pub total_words: usize,
    pub dropped_duplicates: usize,
}

impl HotwordTable {
    /// Parse the hotword JSON document: top-level keys are categories
    /// (arrays of words); the optional `mappings` key holds
    /// category → alias → canonical tables.
    pub fn parse(text: &str) -> PipelineResult<Self> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| PipelineError::BadInput(format!("hotword file is not valid JSON: {e}")))?;
        let object = root
            .as_object()
            .ok_or_else(|| PipelineError::BadInput("hotword file must be a JSON object".into()))?;

        let mut table = HotwordTable::default();
        for (key, value) in object {
            if key == "mappings" {
                let Some(map_obj) = value.as_object() else {
                    return Err(PipelineError::BadInput(
                        "hotword mappings must be an object".into(),
                    ));
                };
                for (category, aliases) in map_obj {
                    let Some(alias_obj) = aliases.as_object() else {
                        continue;
                    };
                    let aliases = alias_obj
                        .iter()
                        .filter_map(|(alias, canonical)| {
                            canonical
                                .as_str()
                                .map(|c| (alias.clone(), c.to_string()))
                        })
                        .collect();
                    table.mappings.push(HotwordMapping {
                        category: category.clone(),
                        aliases,
                    });
                }
                continue;
            }

            let Some(items) = value.as_array() else {
                return Err(PipelineError::BadInput(format!(
                    "hotword category '{key}' must be an array"
                )));
            };
            let words = items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            table.categories.push(HotwordCategory {
                name: key.clone(),
                words,
            });
        }
        Ok(table)
    }

    /// Count of distinct words across all categories.
    pub fn total_words(&self) -> usize {
        let mut seen = HashSet::new();
        self.categories
            .iter()
            .flat_map(|c| c.words.iter())
            .filter(|w| seen.insert(w.as_str()))
            .count()
    }

    /// Space-separated distinct words in first-seen order, capped at
    /// [`RENDER_CAP`] characters (truncated at a word boundary).
    pub fn render(&self) -> String {
        let mut seen = HashSet::new();
        let mut out = String::new();
        for word in self.categories.iter().flat_map(|c| c.words.iter()) {
            if !seen.insert(word.as_str()) {
                continue;
            }
            let extra = word.len() + if out.is_empty() { 0 } else { 1 };
            if out.len() + extra > RENDER_CAP {
                tracing::warn!("hotword blob truncated at {} characters", out.len());
                break;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(word);
        }
        out
    }

    /// Substitute aliases with their canonical forms, longest alias first
    /// so nested aliases resolve deterministically.
    pub fn apply_mappings(&self, text: &str) -> String {
        let mut pairs: Vec<(&str, &str)> = self
            .mappings
            .iter()
            .flat_map(|m| m.aliases.iter())
            .map(|(alias, canonical)| (alias.as_str(), canonical.as_str()))
            .collect();
        pairs.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));

        let mut out = text.to_string();
        for (alias, canonical) in pairs {
            if out.contains(alias) {
                out = out.replace(alias, canonical);
            }
        }
        out
    }
}

/// Process-wide hotword registry with atomic reload.
pub struct HotwordRegistry {
    path: PathBuf,
    table: RwLock<Arc<HotwordTable>>,
}

impl HotwordRegistry {
    /// Load the registry from disk. A missing or unreadable file yields an
    /// empty table; recognition proceeds without hotword biasing.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let table = match Self::read_table(&path) {
            Ok(table) => {
                tracing::info!(
                    "loaded {} hotword categories ({} words) from {}",
                    table.categories.len(),
                    table.total_words(),
                    path.display()
                );
                table
            }
            Err(e) => {
                tracing::warn!("hotword file unavailable ({e}); starting with an empty table");
                HotwordTable::default()
            }
        };
        Self {
            path,
            table: RwLock::new(Arc::new(table)),
        }
    }

    fn read_table(path: &Path) -> PipelineResult<HotwordTable> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::BadInput(format!("cannot read hotword file {}: {e}", path.display()))
        })?;
        HotwordTable::parse(&text)
    }

    /// Current table; the returned snapshot stays consistent even if a
    /// reload happens while it is in use.
    pub fn snapshot(&self) -> Arc<HotwordTable> {
        self.table.read().clone()
    }

    /// Re-parse the file and swap the table in one step.
    pub fn reload(&self) -> PipelineResult<ReloadStats> {
        let table = Self::read_table(&self.path)?;
        let raw_count: usize = table.categories.iter().map(|c| c.words.len()).sum();
        let total_words = table.total_words();
        let stats = ReloadStats {
            categories: table.categories.len(),
            total_words,
            dropped_duplicates: raw_count - total_words,
        };
        *self.table.write() = Arc::new(table);
        tracing::info!(
            "hotword reload: {} categories, {} words",
            stats.categories,
            stats.total_words
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "产品": ["灰度发布", "迭代", "路线图"],
        "人名": ["张三", "李四", "迭代"],
        "mappings": {
            "产品": {"灰度": "灰度发布", "road map": "路线图"}
        }
    }"#;

    #[test]
    fn parse_keeps_category_order_and_counts_distinct_words() {
        let table = HotwordTable::parse(SAMPLE).unwrap();
        assert_eq!(table.categories.len(), 2);
        assert_eq!(table.categories[0].name, "产品");
        // "迭代" appears in both categories but counts once.
        assert_eq!(table.total_words(), 5);
    }

    #[test]
    fn render_deduplicates_in_first_seen_order() {
        let table = HotwordTable::parse(SAMPLE).unwrap();
        assert_eq!(table.render(), "灰度发布 迭代 路线图 张三 李四");
    }

    #[test]
    fn render_respects_length_cap() {
        let words: Vec<String> = (0..2000).map(|i| format!("word{i:04}")).collect();
        let table = HotwordTable {
            categories: vec![HotwordCategory {
                name: "big".into(),
                words,
            }],
            mappings: Vec::new(),
        };
        let rendered = table.render();
        assert!(rendered.len() <= RENDER_CAP);
        assert!(!rendered.ends_with(' '));
    }

    #[test]
    fn mappings_substitute_longest_alias_first() {
        let table = HotwordTable::parse(SAMPLE).unwrap();
        let fixed = table.apply_mappings("关于灰度的 road map 讨论");
        assert_eq!(fixed, "关于灰度发布的 路线图 讨论");
    }

    #[test]
    fn reload_swaps_table_and_reports_stats() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"a": ["x", "y"]}}"#).unwrap();
        file.flush().unwrap();

        let registry = HotwordRegistry::load(file.path());
        assert_eq!(registry.snapshot().total_words(), 2);

        let before = registry.snapshot();
        std::fs::write(file.path(), r#"{"a": ["x", "y", "z", "w", "v"]}"#).unwrap();
        let stats = registry.reload().unwrap();
        assert_eq!(stats.total_words, 5);
        assert_eq!(registry.snapshot().total_words(), 5);
        // The old snapshot is unaffected by the swap.
        assert_eq!(before.total_words(), 2);
    }

    #[test]
    fn missing_file_yields_empty_table() {
        let registry = HotwordRegistry::load("/nonexistent/hotwords.json");
        assert_eq!(registry.snapshot().total_words(), 0);
        assert!(registry.reload().is_err());
    }
}
