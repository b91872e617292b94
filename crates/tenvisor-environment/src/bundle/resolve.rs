// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relative import resolution against an in-memory file map.

use std::collections::BTreeMap;

/// Directories searched, in order, for a specifier with its leading
/// `./`/`../` segments stripped.
pub const PREFIXES: &[&str] = &[
    "",
    "src/",
    "components/",
    "src/components/",
    "lib/",
    "src/lib/",
    "utils/",
    "src/utils/",
    "hooks/",
    "src/hooks/",
    "pages/",
    "src/pages/",
];

/// Suffixes tried on every candidate path, in order.
pub const EXTENSIONS: &[&str] = &[
    "",
    ".tsx",
    ".ts",
    ".jsx",
    ".js",
    ".mjs",
    ".json",
    ".css",
    "/index.tsx",
    "/index.ts",
    "/index.jsx",
    "/index.js",
];

/// Whether `specifier` refers to a tenant file rather than a library.
pub fn is_relative(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier.starts_with('/')
}

/// Collapse `.`/`..` segments and duplicate slashes. Leading `..` that would
/// escape the root are dropped.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Directory part of a file path (`src/App.jsx` → `src`).
fn parent_dir(path: &str) -> &str {
    path.rfind('/').map(|idx| &path[..idx]).unwrap_or("")
}

/// Remove every leading `./`, `../` and `/`.
fn strip_relative(specifier: &str) -> &str {
    let mut rest = specifier;
    loop {
        if let Some(r) = rest.strip_prefix("./") {
            rest = r;
        } else if let Some(r) = rest.strip_prefix("../") {
            rest = r;
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
        } else {
            return rest;
        }
    }
}

/// Resolves relative specifiers to keys of a tenant file map.
pub struct FileResolver<'a> {
    files: &'a BTreeMap<String, String>,
}

impl<'a> FileResolver<'a> {
    /// Resolver over `files`, whose keys are normalized relative paths.
    pub fn new(files: &'a BTreeMap<String, String>) -> Self {
        Self { files }
    }

    /// Candidate base paths for `specifier` imported from `importer`, in
    /// priority order and without duplicates.
    pub fn candidates(importer: &str, specifier: &str) -> Vec<String> {
        let joined = if specifier.starts_with('/') {
            normalize(specifier)
        } else {
            normalize(&format!("{}/{}", parent_dir(importer), specifier))
        };
        let stripped = normalize(strip_relative(specifier));

        let mut bases = vec![joined];
        for prefix in PREFIXES {
            let base = format!("{}{}", prefix, stripped);
            if !bases.contains(&base) {
                bases.push(base);
            }
        }
        bases
    }

    /// Resolve `specifier` from `importer`. First existing candidate wins.
    pub fn resolve(&self, importer: &str, specifier: &str) -> Option<String> {
        for base in Self::candidates(importer, specifier) {
            for ext in EXTENSIONS {
                let candidate = format!("{}{}", base, ext);
                if self.files.contains_key(&candidate) {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(paths: &[&str]) -> BTreeMap<String, String> {
        paths
            .iter()
            .map(|p| (p.to_string(), String::new()))
            .collect()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("src/./components/../App.jsx"), "src/App.jsx");
        assert_eq!(normalize("../../x.js"), "x.js");
        assert_eq!(normalize("a//b/"), "a/b");
    }

    #[test]
    fn test_relative_detection() {
        assert!(is_relative("./Button"));
        assert!(is_relative("../lib/api"));
        assert!(is_relative("/src/App"));
        assert!(!is_relative("react"));
        assert!(!is_relative("@scope/pkg"));
    }

    #[test]
    fn test_joined_path_with_extension() {
        let map = files(&["src/App.tsx", "src/components/Button.tsx"]);
        let resolver = FileResolver::new(&map);
        assert_eq!(
            resolver.resolve("src/App.tsx", "./components/Button"),
            Some("src/components/Button.tsx".to_string())
        );
    }

    #[test]
    fn test_joined_path_beats_prefix_search() {
        let map = files(&["src/utils/format.js", "utils/format.js"]);
        let resolver = FileResolver::new(&map);
        assert_eq!(
            resolver.resolve("src/App.jsx", "./utils/format"),
            Some("src/utils/format.js".to_string())
        );
    }

    #[test]
    fn test_stripped_path_under_common_prefixes() {
        let map = files(&["src/hooks/useTodos.ts"]);
        let resolver = FileResolver::new(&map);
        // Importer sits at the root but the hook lives under src/hooks/.
        assert_eq!(
            resolver.resolve("App.jsx", "../useTodos"),
            Some("src/hooks/useTodos.ts".to_string())
        );
    }

    #[test]
    fn test_index_files_and_extension_order() {
        let map = files(&["components/Card/index.jsx", "lib/api.ts", "lib/api.js"]);
        let resolver = FileResolver::new(&map);
        assert_eq!(
            resolver.resolve("App.jsx", "./components/Card"),
            Some("components/Card/index.jsx".to_string())
        );
        // .ts is tried before .js
        assert_eq!(
            resolver.resolve("App.jsx", "./lib/api"),
            Some("lib/api.ts".to_string())
        );
    }

    #[test]
    fn test_exact_path_with_css() {
        let map = files(&["styles.css"]);
        let resolver = FileResolver::new(&map);
        assert_eq!(
            resolver.resolve("src/App.jsx", "../styles.css"),
            Some("styles.css".to_string())
        );
    }

    #[test]
    fn test_unresolved() {
        let map = files(&["App.jsx"]);
        let resolver = FileResolver::new(&map);
        assert_eq!(resolver.resolve("App.jsx", "./Missing"), None);
    }

    #[test]
    fn test_candidate_order() {
        let candidates = FileResolver::candidates("src/pages/Home.jsx", "../api");
        assert_eq!(candidates[0], "src/api");
        assert_eq!(candidates[1], "api");
        assert_eq!(candidates[2], "components/api");
        // "src/" + "api" duplicates the joined path and is not repeated
        assert_eq!(candidates.len(), PREFIXES.len());
        assert_eq!(candidates.iter().filter(|c| *c == "src/api").count(), 1);
    }
}
