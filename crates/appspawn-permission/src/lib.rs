//! Named sandbox permissions and their bitmap encoding
//!
//! Bit `i` of a permission code is the `i`-th name of the loaded set in
//! lexicographic order. Codes are only meaningful against the load that issued
//! them; [`PermissionRegistry::unload`] invalidates every code handed out.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use appspawn_core::ConfigLocator;
use appspawn_msg::FlagBitmap;
use serde_json::Value;

/// Field of a sandbox fragment that lists permission names
pub const PERMISSION_FIELD: &str = "permission";

/// Sorted, duplicate-free list of permission names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    names: Vec<String>,
}

impl PermissionSet {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unique: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        Self {
            names: unique.into_iter().collect(),
        }
    }

    /// Merge the permission names found in each parsed fragment
    pub fn from_fragments<'a>(fragments: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut names = Vec::new();
        for fragment in fragments {
            if let Some(field) = fragment.get(PERMISSION_FIELD) {
                collect_names(field, &mut names);
            }
        }
        Self::from_names(names)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names
            .binary_search_by(|probe| probe.as_str().cmp(name))
            .ok()
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.names.iter().enumerate() {
            writeln!(f, "{:>4} {}", i, name)?;
        }
        Ok(())
    }
}

/// Names may be listed as strings, as objects keyed by name, or as arrays of
/// either
fn collect_names(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(name) => out.push(name.clone()),
        Value::Array(items) => {
            for item in items {
                collect_names(item, out);
            }
        }
        Value::Object(map) => out.extend(map.keys().cloned()),
        other => log::warn!("ignoring permission entry {}", other),
    }
}

/// Process-wide permission set, loaded at most once
#[derive(Debug, Default)]
pub struct PermissionRegistry {
    set: OnceLock<PermissionSet>,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry already holding `set`
    pub fn with_set(set: PermissionSet) -> Self {
        let registry = Self::new();
        let _ = registry.set.set(set);
        registry
    }

    /// Load every fragment named `fragment`; later calls are no-ops
    pub fn load(&self, locator: &ConfigLocator, fragment: &str) -> &PermissionSet {
        self.set.get_or_init(|| {
            let parsed = locator.load_json(fragment);
            let set = PermissionSet::from_fragments(parsed.iter().map(|(_, v)| v));
            log::info!(
                "loaded {} permissions from {} fragment(s)",
                set.len(),
                parsed.len()
            );
            set
        })
    }

    /// Load from already parsed fragments; later calls are no-ops
    pub fn load_values(&self, fragments: &[Value]) -> &PermissionSet {
        self.set
            .get_or_init(|| PermissionSet::from_fragments(fragments.iter()))
    }

    pub fn is_loaded(&self) -> bool {
        self.set.get().is_some()
    }

    pub fn set(&self) -> Option<&PermissionSet> {
        self.set.get()
    }

    /// Drop the loaded set; codes issued before are no longer valid
    pub fn unload(&mut self) {
        if self.set.take().is_some() {
            log::debug!("permission set unloaded");
        }
    }

    /// Bitmap with the bit of every known name in `requested` set
    ///
    /// Unknown names are ignored. Before a load the code is empty.
    pub fn gen_permission_code<I, S>(&self, requested: I) -> FlagBitmap
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(set) = self.set.get() else {
            log::warn!("permission code requested before the permission set was loaded");
            return FlagBitmap::default();
        };
        let mut code = FlagBitmap::with_capacity(set.len());
        for name in requested {
            match set.index_of(name.as_ref()) {
                Some(index) => code.set(index),
                None => log::debug!("unknown permission {}", name.as_ref()),
            }
        }
        code
    }

    /// Whether `name` is granted by `code`; false when unloaded or unknown
    pub fn is_set(&self, code: &FlagBitmap, name: &str) -> bool {
        self.set
            .get()
            .and_then(|set| set.index_of(name))
            .is_some_and(|index| code.is_set(index))
    }

    /// Names granted by `code`
    pub fn granted<'a>(&'a self, code: &FlagBitmap) -> Vec<&'a str> {
        let Some(set) = self.set.get() else {
            return Vec::new();
        };
        code.iter_set().filter_map(|i| set.name_at(i)).collect()
    }
}
