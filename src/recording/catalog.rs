//! Static metadata of event sites
//!
//! The instrumentation layer assigns dense site ids and hands their metadata
//! over through [`SiteCatalog::on_created`]. The serializer walks the catalog
//! so every known site shows up in a trace, recorded or not.

use crate::recording::value::ValueKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Metadata describing one event site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub site_id: usize,
    pub class_name: String,
    pub method_name: String,
    pub method_desc: String,
    pub method_hash: String,
    pub line: i32,
    pub instruction_index: i32,
    /// Free-form attributes, in insertion order
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
    /// Event type name, e.g. `PUT_FIELD` or `METHOD_ENTRY`
    pub event_kind: String,
    pub value_kind: ValueKind,
}

impl SiteInfo {
    pub fn new(
        site_id: usize,
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        event_kind: impl Into<String>,
        value_kind: ValueKind,
    ) -> Self {
        Self {
            site_id,
            class_name: class_name.into(),
            method_name: method_name.into(),
            method_desc: String::new(),
            method_hash: String::new(),
            line: 0,
            instruction_index: 0,
            attributes: Vec::new(),
            event_kind: event_kind.into(),
            value_kind,
        }
    }

    /// Placeholder for a recorded site the catalog never heard of
    pub fn unknown(site_id: usize, value_kind: ValueKind) -> Self {
        Self::new(site_id, "", "", "", value_kind)
    }

    pub fn with_method_desc(mut self, desc: impl Into<String>) -> Self {
        self.method_desc = desc.into();
        self
    }

    pub fn with_method_hash(mut self, hash: impl Into<String>) -> Self {
        self.method_hash = hash.into();
        self
    }

    pub fn with_location(mut self, line: i32, instruction_index: i32) -> Self {
        self.line = line;
        self.instruction_index = instruction_index;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Attributes as a single `key=value,...` cell
    pub fn attributes_cell(&self) -> String {
        self.attributes
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Void sites carry no value array in structured output
    pub fn skips_values(&self) -> bool {
        self.value_kind == ValueKind::Void
    }
}

/// Site metadata indexed by site id
#[derive(Debug, Default)]
pub struct SiteCatalog {
    sites: RwLock<Vec<Option<SiteInfo>>>,
}

impl SiteCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register sites as the instrumentation layer creates them
    ///
    /// A site registered twice keeps its latest metadata.
    pub fn on_created(&self, created: impl IntoIterator<Item = SiteInfo>) {
        let mut sites = self.sites.write();
        for info in created {
            let id = info.site_id;
            if sites.len() <= id {
                sites.resize(id + 1, None);
            }
            sites[id] = Some(info);
        }
    }

    pub fn get(&self, site: usize) -> Option<SiteInfo> {
        self.sites.read().get(site).and_then(|s| s.clone())
    }

    /// One past the highest known site id
    pub fn len(&self) -> usize {
        self.sites.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.read().iter().all(Option::is_none)
    }

    /// Known sites in id order
    pub fn sites(&self) -> Vec<SiteInfo> {
        self.sites.read().iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_created_indexes_by_site_id() {
        let catalog = SiteCatalog::new();
        assert!(catalog.is_empty());

        catalog.on_created(vec![
            SiteInfo::new(2, "Foo", "bar", "PUT_FIELD", ValueKind::Int),
            SiteInfo::new(0, "Foo", "<init>", "METHOD_ENTRY", ValueKind::Void),
        ]);

        assert_eq!(catalog.len(), 3);
        assert!(catalog.get(1).is_none());
        assert_eq!(catalog.get(2).unwrap().method_name, "bar");
        let ids: Vec<_> = catalog.sites().iter().map(|s| s.site_id).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn test_attributes_cell_keeps_order() {
        let info = SiteInfo::new(0, "A", "m", "GET_FIELD", ValueKind::Object)
            .with_attribute("owner", "A")
            .with_attribute("name", "f");
        assert_eq!(info.attributes_cell(), "owner=A,name=f");
        assert!(!info.skips_values());
        assert!(SiteInfo::unknown(4, ValueKind::Void).skips_values());
    }
}
