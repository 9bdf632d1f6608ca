//! `<Variable>` substitution in path templates

use std::collections::BTreeMap;
use std::fmt;

use appspawn_core::util::user_id_of;
use appspawn_core::{Result, SpawnError};
use appspawn_msg::is_safe_name;

use crate::request::SandboxRequest;

type Resolver = Box<dyn Fn(&SandboxRequest) -> Option<String> + Send + Sync>;

/// Named resolvers, keyed by the text between the angle brackets
pub struct VariableTable {
    resolvers: BTreeMap<String, Resolver>,
}

impl VariableTable {
    /// Table with no variables at all
    pub fn empty() -> Self {
        Self {
            resolvers: BTreeMap::new(),
        }
    }

    /// Table with the builtin variables
    pub fn new() -> Self {
        let mut table = Self::empty();
        // bundle names become path components, so anything else resolves to nothing
        table.register("PackageName", |req| {
            is_safe_name(&req.bundle_name).then(|| req.bundle_name.clone())
        });
        table.register("PackageName_index", |req| {
            if !is_safe_name(&req.bundle_name) {
                return None;
            }
            Some(if req.bundle_index == 0 {
                req.bundle_name.clone()
            } else {
                format!("{}_{}", req.bundle_name, req.bundle_index)
            })
        });
        table.register("currentUserId", |req| Some(user_id_of(req.uid).to_string()));
        table.register("hostUserId", |req| Some(req.uid.to_string()));
        table.register("lib", |_| {
            Some(if cfg!(target_pointer_width = "64") { "lib64" } else { "lib" }.to_string())
        });
        table
    }

    /// Builtins plus one constant variable per alias
    pub fn with_aliases(aliases: &BTreeMap<String, String>) -> Self {
        let mut table = Self::new();
        for (name, path) in aliases {
            let path = path.clone();
            table.register(name.trim_matches(|c| c == '<' || c == '>'), move |_| {
                Some(path.clone())
            });
        }
        table
    }

    /// Add or replace a variable
    pub fn register<F>(&mut self, name: &str, resolver: F)
    where
        F: Fn(&SandboxRequest) -> Option<String> + Send + Sync + 'static,
    {
        self.resolvers.insert(name.to_string(), Box::new(resolver));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    /// Replace every `<name>` in `template`
    ///
    /// Unknown names, names that resolve to nothing and unterminated `<` are
    /// errors.
    pub fn resolve(&self, template: &str, req: &SandboxRequest) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('<') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('>').ok_or_else(|| {
                SpawnError::Config(format!("unterminated variable in {}", template))
            })?;
            let name = &after[..close];
            let resolver = self.resolvers.get(name).ok_or_else(|| {
                SpawnError::Config(format!("unknown variable <{}> in {}", name, template))
            })?;
            let value = resolver(req).ok_or_else(|| {
                SpawnError::Config(format!("variable <{}> has no value", name))
            })?;
            out.push_str(&value);
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl Default for VariableTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VariableTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.resolvers.keys()).finish()
    }
}
