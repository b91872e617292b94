// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resolution table for bare library specifiers in the client target.

use std::collections::BTreeMap;

/// Fallback used for packages missing from the table.
pub const ESM_FALLBACK: &str = "https://esm.sh/";

/// Maps bare specifiers (`react`, `react-dom/client`) to fetchable URLs.
///
/// Lookup is by exact match first, then by the longest mapped package prefix
/// (`lodash/debounce` → `<lodash url>/debounce`), then the esm.sh fallback.
#[derive(Debug, Clone)]
pub struct ImportMap {
    entries: BTreeMap<String, String>,
    fallback: String,
}

impl Default for ImportMap {
    fn default() -> Self {
        let mut map = Self::empty();
        map.insert("react", "https://esm.sh/react@18.3.1");
        map.insert("react/jsx-runtime", "https://esm.sh/react@18.3.1/jsx-runtime");
        map.insert("react-dom", "https://esm.sh/react-dom@18.3.1");
        map.insert("react-dom/client", "https://esm.sh/react-dom@18.3.1/client");
        map.insert("react-dom/server", "https://esm.sh/react-dom@18.3.1/server");
        map
    }
}

impl ImportMap {
    /// Table with no entries; everything goes through the fallback.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            fallback: ESM_FALLBACK.to_string(),
        }
    }

    /// Add or replace a mapping.
    pub fn insert(&mut self, specifier: impl Into<String>, url: impl Into<String>) {
        self.entries.insert(specifier.into(), url.into());
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, specifier: impl Into<String>, url: impl Into<String>) -> Self {
        self.insert(specifier, url);
        self
    }

    /// Replace the fallback URL prefix.
    pub fn with_fallback(mut self, prefix: impl Into<String>) -> Self {
        self.fallback = prefix.into();
        self
    }

    /// Resolve a bare specifier.
    pub fn resolve(&self, specifier: &str) -> String {
        if specifier.starts_with("http://") || specifier.starts_with("https://") {
            return specifier.to_string();
        }
        if let Some(url) = self.entries.get(specifier) {
            return url.clone();
        }

        let mut prefix = specifier;
        while let Some(idx) = prefix.rfind('/') {
            prefix = &prefix[..idx];
            if let Some(url) = self.entries.get(prefix) {
                return format!("{}{}", url, &specifier[idx..]);
            }
        }

        format!("{}{}", self.fallback, specifier)
    }

    /// Number of explicit mappings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no explicit mappings.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let map = ImportMap::default();
        assert_eq!(map.resolve("react"), "https://esm.sh/react@18.3.1");
        assert_eq!(
            map.resolve("react-dom/client"),
            "https://esm.sh/react-dom@18.3.1/client"
        );
    }

    #[test]
    fn test_longest_prefix_keeps_subpath() {
        let map = ImportMap::empty()
            .with("lodash", "https://cdn.example/lodash@4")
            .with("lodash/fp", "https://cdn.example/lodash-fp");
        assert_eq!(
            map.resolve("lodash/debounce"),
            "https://cdn.example/lodash@4/debounce"
        );
        assert_eq!(map.resolve("lodash/fp/map"), "https://cdn.example/lodash-fp/map");
    }

    #[test]
    fn test_fallback_and_absolute_urls() {
        let map = ImportMap::default();
        assert_eq!(map.resolve("date-fns"), "https://esm.sh/date-fns");
        assert_eq!(map.resolve("@scope/pkg/sub"), "https://esm.sh/@scope/pkg/sub");
        assert_eq!(
            map.resolve("https://unpkg.com/x.js"),
            "https://unpkg.com/x.js"
        );

        let custom = ImportMap::empty().with_fallback("https://cdn.jsdelivr.net/npm/");
        assert_eq!(custom.resolve("zod"), "https://cdn.jsdelivr.net/npm/zod");
        assert!(custom.is_empty());
    }
}
