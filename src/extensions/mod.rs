// ABOUTME: Bundled extensions and the boot-time discovery catalog.
// ABOUTME: Extensions are enumerated here by name; config selects which ones load.

pub mod about;
pub mod audit;

use crate::manager::ExtensionCatalog;

/// The discovery set of extensions this binary ships with.
pub fn builtin_catalog() -> ExtensionCatalog {
    let mut catalog = ExtensionCatalog::new();
    catalog.insert("about", Box::new(|| Box::new(about::About)));
    catalog.insert("audit", Box::new(|| Box::new(audit::Audit)));
    catalog
}
