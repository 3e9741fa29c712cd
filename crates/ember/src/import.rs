//! Module search: turning a dotted import name into candidate source
//! locations, and the host-supplied callback contract that actually
//! resolves them.
//!
//! Reading files and shipping a native registry is an embedding concern —
//! the host owns a filesystem, this crate does not — so this module only
//! computes *which* paths to try and in *what order*; the host's
//! [`ImportHost`] impl does the actual lookup.

use crate::native::NativeExtension;

/// What a successful [`ImportHost::resolve`] hands back: source to compile,
/// the path it came from (used in tracebacks and `__package__` resolution),
/// and an optional native extension registry to attach to the module.
pub struct ImportSource {
    pub code: Vec<u8>,
    pub path: String,
    pub native_registry: Option<NativeExtension>,
}

/// Host-implemented module resolution. Given a fully dotted module name
/// (`"a.b.c"`), returns its source if found.
pub trait ImportHost {
    fn resolve(&mut self, dotted_name: &str) -> Option<ImportSource>;
}

/// Splits `"a.b.c"` into `["a", "b", "c"]` — used to walk parent packages so
/// each one receives a binding for the leaf it resolved through.
#[must_use]
pub fn split_dotted(name: &str) -> Vec<&str> {
    name.split('.').collect()
}

/// The ordered list of root directories searched for modules not already
/// registered and not found in a built-in name table.
#[derive(Debug, Default, Clone)]
pub struct SearchPaths(Vec<String>);

impl SearchPaths {
    #[must_use]
    pub fn new(paths: Vec<String>) -> Self {
        Self(paths)
    }

    pub fn push(&mut self, path: impl Into<String>) {
        self.0.push(path.into());
    }

    /// For `"a.b.c"`, yields, per search-path entry in order: the
    /// package-form candidate (`<path>/a/b/c/__package__.jsr`) followed by
    /// the flat-form candidate (`<path>/a/b/c.jsr`). The host tries each in
    /// turn and returns the first that exists.
    #[must_use]
    pub fn candidates(&self, dotted_name: &str) -> Vec<String> {
        let parts = split_dotted(dotted_name);
        let rel = parts.join("/");
        let mut out = Vec::with_capacity(self.0.len() * 2);
        for root in &self.0 {
            out.push(format!("{root}/{rel}/__package__.jsr"));
            out.push(format!("{root}/{rel}.jsr"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_dotted_names() {
        assert_eq!(split_dotted("a.b.c"), vec!["a", "b", "c"]);
        assert_eq!(split_dotted("leaf"), vec!["leaf"]);
    }

    #[test]
    fn candidates_try_package_form_before_flat_form_per_path() {
        let mut paths = SearchPaths::default();
        paths.push("/lib");
        paths.push("/opt/pkgs");
        let candidates = paths.candidates("a.b");
        assert_eq!(
            candidates,
            vec![
                "/lib/a/b/__package__.jsr".to_string(),
                "/lib/a/b.jsr".to_string(),
                "/opt/pkgs/a/b/__package__.jsr".to_string(),
                "/opt/pkgs/a/b.jsr".to_string(),
            ]
        );
    }
}
