use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

/// A registered blueprint: a parameterizable description of a task chain,
/// keyed by `(category, name)`.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateDescriptor {
    pub category: String,
    pub name: String,
    /// Blueprint class name, published alongside the template body.
    pub class: String,
    /// Template body. The `steps` array drives the chain runtime.
    pub template: Value,
}

impl TemplateDescriptor {
    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// Template silo identifier: the category with its `template_` prefix
    /// stripped, joined with the name.
    pub fn silo_key(&self) -> String {
        let short = self
            .category
            .strip_prefix("template_")
            .unwrap_or(&self.category);
        format!("{}/{}", short, self.name)
    }

    /// The task kinds this blueprint executes, consulted by the admission
    /// restriction filter.
    pub fn task_kinds(&self) -> BTreeSet<String> {
        let mut kinds = BTreeSet::new();
        if let Some(steps) = self.template.get("steps").and_then(Value::as_array) {
            for step in steps {
                if let Some(kind) = step.get("task").and_then(Value::as_str) {
                    kinds.insert(kind.to_string());
                }
            }
        }
        kinds
    }

    /// The record published to the template silo: the template body plus a
    /// `class` field.
    pub fn to_record(&self) -> Map<String, Value> {
        let mut record = match &self.template {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("template".to_string(), other.clone());
                map
            }
        };
        record.insert("class".to_string(), Value::String(self.class.clone()));
        record
    }
}

/// Explicit catalog of blueprints, built during plugin load. Lookup is by
/// `(category, name)` dispatch; there is no subclass hierarchy behind it.
#[derive(Default)]
pub struct TemplateRegistry {
    entries: BTreeMap<(String, String), TemplateDescriptor>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, descriptor: TemplateDescriptor) {
        self.entries.insert(
            (descriptor.category.clone(), descriptor.name.clone()),
            descriptor,
        );
    }

    pub fn find(&self, category: &str, name: &str) -> Option<&TemplateDescriptor> {
        self.entries
            .get(&(category.to_string(), name.to_string()))
    }

    /// Sorted names registered under a category.
    pub fn names_in_category(&self, category: &str) -> Vec<String> {
        self.entries
            .keys()
            .filter(|(cat, _)| cat == category)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Descriptors in a category, in name order.
    pub fn in_category(&self, category: &str) -> Vec<&TemplateDescriptor> {
        self.entries
            .iter()
            .filter(|((cat, _), _)| cat == category)
            .map(|(_, descriptor)| descriptor)
            .collect()
    }

    /// All template blueprints: entries whose category carries the
    /// `template_` prefix.
    pub fn templates(&self) -> Vec<&TemplateDescriptor> {
        self.entries
            .values()
            .filter(|d| d.category.starts_with("template_"))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(category: &str, name: &str) -> TemplateDescriptor {
        TemplateDescriptor {
            category: category.to_string(),
            name: name.to_string(),
            class: "SequentialChain".to_string(),
            template: json!({
                "steps": [
                    {"task": "log", "message": "starting"},
                    {"task": "delay", "seconds": 1},
                ]
            }),
        }
    }

    #[test]
    fn test_find_is_by_category_and_name() {
        let mut registry = TemplateRegistry::new();
        registry.insert(descriptor("template_reports", "inventory"));
        registry.insert(descriptor("template_services", "inventory"));

        assert!(registry.find("template_reports", "inventory").is_some());
        assert!(registry.find("template_reports", "missing").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_silo_key_strips_template_prefix() {
        let d = descriptor("template_reports", "inventory");
        assert_eq!(d.silo_key(), "reports/inventory");
        assert_eq!(d.key(), "template_reports/inventory");

        let bare = descriptor("reports", "inventory");
        assert_eq!(bare.silo_key(), "reports/inventory");
    }

    #[test]
    fn test_task_kinds_collected_from_steps() {
        let kinds = descriptor("template_reports", "inventory").task_kinds();
        assert!(kinds.contains("log"));
        assert!(kinds.contains("delay"));
        assert_eq!(kinds.len(), 2);
    }

    #[test]
    fn test_record_carries_class_field() {
        let record = descriptor("template_reports", "inventory").to_record();
        assert_eq!(record["class"], json!("SequentialChain"));
        assert!(record.contains_key("steps"));
    }

    #[test]
    fn test_templates_filter() {
        let mut registry = TemplateRegistry::new();
        registry.insert(descriptor("task", "delay"));
        registry.insert(descriptor("chain", "sequential"));
        registry.insert(descriptor("template_reports", "inventory"));

        let templates = registry.templates();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].category, "template_reports");
    }
}
