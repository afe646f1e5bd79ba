use std::{
    sync::Arc,
    time::SystemTime,
};

use serde::Serialize;
use strata_core::{ModuleName, Tier};
use strata_lang::{ClassDef, Namespace, Provenance, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Backed by `Name.<ext>` files.
    Regular,
    /// Backed by `Name/__init__.<ext>` files.
    Package,
    /// Only directories exist for the name; no symbols of its own.
    VirtualPackage,
}

/// The merged result of executing every tier's unit for one module name.
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub name: ModuleName,
    pub kind: ModuleKind,
    pub namespace: Namespace,
    /// Contributing tiers, lowest first.
    pub sources: Vec<Provenance>,
    /// Assigned by the cache on insert; 0 until then.
    pub generation: u64,
    pub loaded_at: SystemTime,
}

impl ResolvedModule {
    pub fn new(
        name: ModuleName,
        kind: ModuleKind,
        namespace: Namespace,
        sources: Vec<Provenance>,
    ) -> Self {
        Self {
            name,
            kind,
            namespace,
            sources,
            generation: 0,
            loaded_at: SystemTime::now(),
        }
    }

    pub fn class(&self, name: &str) -> Option<&Arc<ClassDef>> {
        self.namespace.class(name)
    }

    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.namespace.get(name).map(|b| &b.symbol)
    }

    /// Tier that supplied the current binding for `name`.
    pub fn provenance(&self, name: &str) -> Option<&Provenance> {
        self.namespace.get(name).map(|b| &b.provenance)
    }

    pub fn tiers(&self) -> Vec<&Tier> {
        self.sources.iter().map(|p| &p.tier).collect()
    }

    pub fn origins(&self) -> Vec<&str> {
        self.sources.iter().map(|p| p.origin.as_ref()).collect()
    }

    /// Comma-separated origins, as shown in error messages.
    pub fn origin_summary(&self) -> String {
        self.origins().join(", ")
    }

    pub fn is_virtual_package(&self) -> bool {
        self.kind == ModuleKind::VirtualPackage
    }

    pub fn class_names(&self) -> Vec<&str> {
        self.namespace
            .iter()
            .filter(|(_, b)| matches!(b.symbol, Symbol::Class(_)))
            .map(|(name, _)| name)
            .collect()
    }
}
