//! # Module Directory
//!
//! Known modules, their priorities and where to reach them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Modules queried when a request names none
pub const DEFAULT_MODULES: [&str; 4] = ["finbot", "mubot", "dese", "observability"];

/// Built-in modules: (name, priority, port)
///
/// Higher priority wins under the `priority` merge strategy.
pub const BUILTIN_MODULES: [(&str, u8, u16); 10] = [
    ("finbot", 9, 5555),
    ("mubot", 8, 5556),
    ("dese", 1, 5557),
    ("observability", 1, 5558),
    ("seo", 2, 5559),
    ("service", 3, 5560),
    ("crm", 7, 5561),
    ("inventory", 6, 5562),
    ("hr", 5, 5563),
    ("iot", 4, 5564),
];

/// Topics each built-in module offers to real-time clients
pub fn builtin_topics(module: &str) -> &'static [&'static str] {
    match module {
        "finbot" => &["accounts", "transactions", "budgets", "analytics"],
        "mubot" => &["ingestion", "quality", "accounting"],
        "dese" => &["anomalies", "correlations", "alerts"],
        "observability" => &["metrics", "logs", "traces"],
        _ => &[],
    }
}

/// One module server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub base_url: String,
    pub priority: u8,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, priority: u8) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            priority,
        }
    }

    /// URL of the module's context endpoint
    pub fn context_url(&self) -> String {
        format!("{}/{}/context", self.base_url.trim_end_matches('/'), self.name)
    }
}

/// Registry of modules, built at startup
#[derive(Debug, Clone)]
pub struct ModuleDirectory {
    modules: BTreeMap<String, ModuleDescriptor>,
    defaults: Vec<String>,
}

impl ModuleDirectory {
    pub fn new(modules: Vec<ModuleDescriptor>, defaults: Vec<String>) -> Self {
        Self {
            modules: modules.into_iter().map(|m| (m.name.clone(), m)).collect(),
            defaults,
        }
    }

    /// Built-in modules on `host` with their standard ports
    pub fn builtin(host: &str) -> Self {
        let modules = BUILTIN_MODULES
            .iter()
            .map(|(name, priority, port)| {
                ModuleDescriptor::new(*name, format!("http://{}:{}", host, port), *priority)
            })
            .collect();
        Self::new(modules, DEFAULT_MODULES.iter().map(|m| m.to_string()).collect())
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Priority of `name`, 0 if unknown
    pub fn priority(&self, name: &str) -> u8 {
        self.modules.get(name).map(|m| m.priority).unwrap_or(0)
    }

    pub fn defaults(&self) -> &[String] {
        &self.defaults
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.modules.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_directory() {
        let directory = ModuleDirectory::builtin("localhost");
        assert_eq!(directory.priority("finbot"), 9);
        assert_eq!(directory.priority("observability"), 1);
        assert_eq!(directory.priority("unknown"), 0);
        assert_eq!(directory.defaults().len(), 4);
        assert_eq!(
            directory.get("crm").unwrap().context_url(),
            "http://localhost:5561/crm/context"
        );
    }

    #[test]
    fn test_builtin_topics() {
        assert!(builtin_topics("finbot").contains(&"transactions"));
        assert!(builtin_topics("hr").is_empty());
    }
}
