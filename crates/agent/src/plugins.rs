use serde_json::json;

use crate::registry::{TemplateDescriptor, TemplateRegistry};

/// A plugin contributes blueprints to the template registry during startup
/// and whenever the registry is reloaded.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn register(&self, registry: &mut TemplateRegistry);
}

/// Built-in task kinds, the sequential chain, and the diagnostic templates.
/// Always installed, so a node with no configured plugins still has a
/// non-empty capability catalog.
pub struct BuiltinPlugin;

impl Plugin for BuiltinPlugin {
    fn name(&self) -> &str {
        "builtin"
    }

    fn register(&self, registry: &mut TemplateRegistry) {
        for (name, class) in [
            ("delay", "DelayTask"),
            ("log", "LogTask"),
            ("noop", "NoopTask"),
        ] {
            registry.insert(TemplateDescriptor {
                category: "task".to_string(),
                name: name.to_string(),
                class: class.to_string(),
                template: json!({"task": name}),
            });
        }

        registry.insert(TemplateDescriptor {
            category: "chain".to_string(),
            name: "sequential".to_string(),
            class: "SequentialChain".to_string(),
            template: json!({"steps": []}),
        });

        registry.insert(TemplateDescriptor {
            category: "template_diagnostics".to_string(),
            name: "echo".to_string(),
            class: "SequentialChain".to_string(),
            template: json!({
                "description": "Log a message and return.",
                "steps": [
                    {"task": "log", "name": "announce", "message": "echo"},
                ],
            }),
        });

        registry.insert(TemplateDescriptor {
            category: "template_diagnostics".to_string(),
            name: "slow_burn".to_string(),
            class: "SequentialChain".to_string(),
            template: json!({
                "description": "Sleep for `seconds`, exercising timeout and terminate paths.",
                "steps": [
                    {"task": "log", "name": "announce", "message": "slow burn starting"},
                    {"task": "delay", "name": "burn"},
                ],
            }),
        });
    }
}

/// Resolve the configured plugin list. The built-in plugin is always first;
/// names with no local implementation are logged and skipped (plugin
/// installation proper belongs to the coordinator tooling).
pub fn install(names: &[String]) -> Vec<Box<dyn Plugin>> {
    let mut plugins: Vec<Box<dyn Plugin>> = vec![Box::new(BuiltinPlugin)];

    for name in names {
        if name == "builtin" {
            continue;
        }
        tracing::warn!(plugin = %name, "Plugin is not installed locally, skipping");
    }

    plugins
}

/// Build the template registry from the installed plugin set.
pub fn populate(plugins: &[Box<dyn Plugin>]) -> TemplateRegistry {
    let mut registry = TemplateRegistry::new();
    for plugin in plugins {
        plugin.register(&mut registry);
        tracing::debug!(plugin = plugin.name(), "Plugin registered");
    }
    tracing::info!(entries = registry.len(), "Template registry populated");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let registry = populate(&install(&[]));

        assert_eq!(
            registry.names_in_category("task"),
            vec!["delay", "log", "noop"]
        );
        assert_eq!(registry.names_in_category("chain"), vec!["sequential"]);
        assert!(registry
            .find("template_diagnostics", "slow_burn")
            .is_some());

        let templates = registry.templates();
        assert_eq!(templates.len(), 2);
    }

    #[test]
    fn test_unknown_plugins_are_skipped() {
        let plugins = install(&["does_not_exist".to_string()]);
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name(), "builtin");
    }
}
