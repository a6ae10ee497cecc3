use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::profiles::next_record_id;
use crate::storage::{KeyValueStorage, StorageError, TEMPLATES_KEY};

pub const DEFAULT_CATEGORY: &str = "custom";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryTemplate {
    pub id: String,
    pub name: String,
    pub query: String,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

#[derive(Debug, Error)]
pub enum TemplatesError {
    #[error("template name cannot be empty")]
    EmptyName,
    #[error("template query cannot be empty")]
    EmptyQuery,
    #[error("failed to serialize templates: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to persist templates: {0}")]
    Storage(#[from] StorageError),
}

fn builtin(id: &str, name: &str, query: &str, category: &str) -> QueryTemplate {
    QueryTemplate {
        id: id.to_string(),
        name: name.to_string(),
        query: query.to_string(),
        category: category.to_string(),
    }
}

/// Built-in templates. They are never persisted and cannot be removed.
#[must_use]
pub fn default_templates() -> Vec<QueryTemplate> {
    vec![
        builtin(
            "builtin-tables",
            "List tables",
            "SELECT table_name FROM information_schema.tables WHERE table_schema = DATABASE();",
            "schema",
        ),
        builtin(
            "builtin-columns",
            "Describe columns",
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = 'your_table';",
            "schema",
        ),
        builtin(
            "builtin-first-rows",
            "First 100 rows",
            "SELECT * FROM table_name LIMIT 100;",
            "common",
        ),
        builtin(
            "builtin-count",
            "Count rows",
            "SELECT COUNT(*) FROM table_name;",
            "common",
        ),
        builtin(
            "builtin-distinct",
            "Distinct values",
            "SELECT DISTINCT column_name FROM table_name;",
            "common",
        ),
        builtin(
            "builtin-sorted",
            "Sorted by column",
            "SELECT * FROM table_name ORDER BY column_name DESC LIMIT 100;",
            "common",
        ),
        builtin(
            "builtin-find",
            "Structured find",
            r#"{"table": "table_name", "operation": "find", "filter": {"id": {"$gt": 0}}}"#,
            "structured",
        ),
        builtin(
            "builtin-find-one",
            "Structured findOne",
            r#"{"table": "table_name", "operation": "findOne", "filter": {"id": 1}}"#,
            "structured",
        ),
        builtin(
            "builtin-structured-count",
            "Structured count",
            r#"{"table": "table_name", "operation": "count"}"#,
            "structured",
        ),
    ]
}

#[derive(Debug)]
pub struct TemplateStore<S: KeyValueStorage> {
    storage: S,
    custom: Vec<QueryTemplate>,
}

impl<S: KeyValueStorage> TemplateStore<S> {
    pub fn load(storage: S) -> Self {
        let custom = match storage.read(TEMPLATES_KEY) {
            Ok(Some(raw)) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .unwrap_or_else(|error| {
                    warn!(%error, "discarding malformed saved templates");
                    Vec::new()
                }),
            Ok(_) => Vec::new(),
            Err(error) => {
                warn!(%error, "saved templates are unreadable");
                Vec::new()
            }
        };
        debug!(count = custom.len(), "loaded query templates");

        Self { storage, custom }
    }

    /// Built-ins first, then user templates in creation order.
    #[must_use]
    pub fn all(&self) -> Vec<QueryTemplate> {
        let mut templates = default_templates();
        templates.extend(self.custom.iter().cloned());
        templates
    }

    #[must_use]
    pub fn custom(&self) -> &[QueryTemplate] {
        &self.custom
    }

    #[must_use]
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = Vec::new();
        for template in self.all() {
            if !categories.contains(&template.category) {
                categories.push(template.category);
            }
        }
        categories
    }

    pub fn add(
        &mut self,
        name: &str,
        query: &str,
        category: Option<&str>,
    ) -> Result<QueryTemplate, TemplatesError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TemplatesError::EmptyName);
        }
        if query.trim().is_empty() {
            return Err(TemplatesError::EmptyQuery);
        }
        let category = category
            .map(str::trim)
            .filter(|category| !category.is_empty())
            .unwrap_or(DEFAULT_CATEGORY);

        let template = QueryTemplate {
            id: next_record_id(),
            name: name.to_string(),
            query: query.to_string(),
            category: category.to_string(),
        };
        self.custom.push(template.clone());
        Ok(template)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let original_len = self.custom.len();
        self.custom.retain(|template| template.id != id);
        self.custom.len() != original_len
    }

    pub fn save(&self) -> Result<(), TemplatesError> {
        let rendered = serde_json::to_string(&self.custom)
            .map_err(|source| TemplatesError::Serialize { source })?;
        self.storage.write(TEMPLATES_KEY, &rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{default_templates, TemplateStore, TemplatesError, DEFAULT_CATEGORY};
    use crate::storage::{MemoryStorage, TEMPLATES_KEY};

    #[test]
    fn builtins_come_first_and_cannot_be_removed() {
        let mut store = TemplateStore::load(MemoryStorage::new());
        let builtin_count = default_templates().len();
        assert_eq!(store.all().len(), builtin_count);
        assert!(!store.remove("builtin-count"));

        let added = store
            .add("Active users", "SELECT * FROM users WHERE active", None)
            .expect("valid template");
        let all = store.all();
        assert_eq!(all.len(), builtin_count + 1);
        assert_eq!(all.last(), Some(&added));
        assert_eq!(added.category, DEFAULT_CATEGORY);
        assert!(store.categories().contains(&"structured".to_string()));
    }

    #[test]
    fn schema_builtins_target_the_current_database() {
        let templates = default_templates();
        let tables = templates
            .iter()
            .find(|template| template.id == "builtin-tables")
            .expect("list tables builtin");
        assert!(tables.query.contains("table_schema = DATABASE()"));
        assert!(templates
            .iter()
            .all(|template| !template.query.contains("'public'")));
    }

    #[test]
    fn blank_name_or_query_is_rejected() {
        let mut store = TemplateStore::load(MemoryStorage::new());
        assert!(matches!(
            store.add("  ", "SELECT 1", None),
            Err(TemplatesError::EmptyName)
        ));
        assert!(matches!(
            store.add("one", "", Some("misc")),
            Err(TemplatesError::EmptyQuery)
        ));
        assert!(store.custom().is_empty());
    }

    #[test]
    fn save_persists_only_custom_templates() {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = TemplateStore::load(Arc::clone(&storage));
        let added = store
            .add("Orders", "SELECT * FROM orders", Some("reports"))
            .expect("valid template");
        store.save().expect("save should succeed");

        let reloaded = TemplateStore::load(Arc::clone(&storage));
        assert_eq!(reloaded.custom(), &[added.clone()]);

        let raw = storage.get(TEMPLATES_KEY).expect("templates written");
        assert!(!raw.contains("builtin-"));

        let mut reloaded = reloaded;
        assert!(reloaded.remove(&added.id));
        assert!(reloaded.custom().is_empty());
    }

    #[test]
    fn malformed_saved_templates_fall_back_to_builtins() {
        let store = TemplateStore::load(MemoryStorage::with_entry(TEMPLATES_KEY, "[{]"));
        assert!(store.custom().is_empty());
        assert_eq!(store.all(), default_templates());
    }
}
