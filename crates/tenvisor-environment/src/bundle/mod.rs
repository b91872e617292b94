// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant artifact linking.
//!
//! A tenant's [`SourceArtifact`] is linked into two targets:
//!
//! - the **server** target: the resolved module graph, kept inside the
//!   execution unit and used for pre-rendering and handler selection;
//! - the **client** target: a single self-contained ES module served at
//!   `/app.js`. Bare library specifiers are rewritten through the
//!   [`ImportMap`]; tenant files are inlined as base64 `data:` module URLs so
//!   the browser never fetches a tenant-private file.
//!
//! Relative imports resolve against the in-memory file map (see
//! [`resolve`]). An import that resolves to nothing fails the whole compile.
//! Cycles are tolerated in the server graph but fail the client target, since
//! a `data:` URL cannot reference itself.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::{Captures, Regex};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tenvisor_core::SourceArtifact;
use thiserror::Error;

pub mod import_map;
pub mod resolve;

pub use import_map::ImportMap;
pub use resolve::FileResolver;

/// Static `import`/`export … from` statements. Group 2 is the specifier.
static IMPORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:\bimport\s*(?:[^'";]*?\bfrom\s*)?|\bexport\s*[^'";]*?\bfrom\s*)(['"])([^'"\n]+)['"]"#,
    )
    .expect("import regex is valid")
});

/// `export const NAME = "literal"` declarations.
static STRING_EXPORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bexport\s+const\s+([A-Za-z_$][\w$]*)\s*=\s*(?:"([^"\n]*)"|'([^'\n]*)')"#)
        .expect("string export regex is valid")
});

/// Entry module names, tried at the root and under `src/`.
const ENTRY_NAMES: &[&str] = &["App", "app", "index", "main"];
const ENTRY_EXTENSIONS: &[&str] = &[".tsx", ".jsx", ".ts", ".js"];

/// Path given to a single-module artifact.
pub const SINGLE_MODULE_PATH: &str = "index.js";

/// Compile failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum BundleError {
    /// The artifact has no code at all.
    #[error("Source artifact is empty")]
    EmptySource,

    /// A multi-file artifact has no recognizable entry module.
    #[error("No entry module found (expected App, index or main under the root or src/)")]
    NoEntry,

    /// A relative import matched no file.
    #[error("Cannot resolve import '{specifier}' from '{importer}'")]
    UnresolvedImport {
        /// File containing the import.
        importer: String,
        /// Specifier as written.
        specifier: String,
    },

    /// Tenant files import each other in a cycle.
    #[error("Circular import: {}", .0.join(" -> "))]
    CircularImport(Vec<String>),

    /// The module names a handler the loader does not know.
    #[error("Unknown handler '{0}'")]
    UnknownHandler(String),

    /// The loader rejected the module.
    #[error("Failed to load module: {0}")]
    Load(String),
}

/// Where an import points after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportTarget {
    /// Another tenant file (normalized path).
    Local(String),
    /// A library URL from the import map.
    External(String),
}

/// One import of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImport {
    /// Specifier as written in the source.
    pub specifier: String,
    /// Resolution result.
    pub target: ImportTarget,
}

/// A tenant file with its resolved imports.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    /// Normalized path inside the artifact.
    pub path: String,
    /// Original source text.
    pub source: String,
    /// Imports in source order.
    pub imports: Vec<ResolvedImport>,
}

/// Server target: every file reachable from the entry, in discovery order.
#[derive(Debug, Clone)]
pub struct ServerModule {
    /// Entry path.
    pub entry: String,
    /// Reachable modules, entry first.
    pub modules: Vec<ModuleRecord>,
}

impl ServerModule {
    /// Look up a module by path.
    pub fn module(&self, path: &str) -> Option<&ModuleRecord> {
        self.modules.iter().find(|m| m.path == path)
    }

    /// Distinct external URLs the graph depends on.
    pub fn external_urls(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = self
            .modules
            .iter()
            .flat_map(|m| m.imports.iter())
            .filter_map(|i| match &i.target {
                ImportTarget::External(url) => Some(url.as_str()),
                ImportTarget::Local(_) => None,
            })
            .collect();
        urls.sort_unstable();
        urls.dedup();
        urls
    }
}

/// Client target: one self-contained module.
#[derive(Debug, Clone)]
pub struct ClientModule {
    /// Module text served at `/app.js`.
    pub source: String,
    /// Quoted SHA-256 of `source`, used as the HTTP ETag.
    pub etag: String,
}

/// Output of [`Bundler::compile`].
#[derive(Debug, Clone)]
pub struct CompiledModule {
    /// Entry path.
    pub entry: String,
    /// Server target.
    pub server: ServerModule,
    /// Client target.
    pub client: ClientModule,
    /// String constants exported by the entry module.
    pub exports: BTreeMap<String, String>,
    /// SHA-256 over every file of the artifact.
    pub content_hash: String,
    /// Total artifact size.
    pub size_bytes: usize,
}

impl CompiledModule {
    /// Value of a string export on the entry module.
    pub fn export(&self, name: &str) -> Option<&str> {
        self.exports.get(name).map(String::as_str)
    }

    /// Custom handler requested by `export const handler = "<name>"`.
    pub fn handler_name(&self) -> Option<&str> {
        self.export("handler")
    }
}

/// Links source artifacts.
#[derive(Debug, Clone, Default)]
pub struct Bundler {
    import_map: ImportMap,
}

impl Bundler {
    /// Bundler using `import_map` for bare specifiers.
    pub fn new(import_map: ImportMap) -> Self {
        Self { import_map }
    }

    /// Import map in use.
    pub fn import_map(&self) -> &ImportMap {
        &self.import_map
    }

    /// Link `artifact` into its server and client targets.
    pub fn compile(&self, artifact: &SourceArtifact) -> Result<CompiledModule, BundleError> {
        let files = normalize_files(artifact)?;
        let entry = find_entry(&files)?;
        let server = self.link_server(&files, &entry)?;
        let client = self.link_client(&server)?;

        let exports = server
            .module(&entry)
            .map(|m| string_exports(&m.source))
            .unwrap_or_default();

        Ok(CompiledModule {
            entry,
            server,
            client,
            exports,
            content_hash: content_hash(&files),
            size_bytes: artifact.size_bytes(),
        })
    }

    /// Walk the graph breadth-first from `entry`, resolving every import.
    fn link_server(
        &self,
        files: &BTreeMap<String, String>,
        entry: &str,
    ) -> Result<ServerModule, BundleError> {
        let resolver = FileResolver::new(files);
        let mut modules = Vec::new();
        let mut seen: Vec<String> = vec![entry.to_string()];
        let mut queue = VecDeque::from([entry.to_string()]);

        while let Some(path) = queue.pop_front() {
            let source = files.get(&path).cloned().unwrap_or_default();
            let mut imports = Vec::new();

            if is_script(&path) {
                for specifier in scan_imports(&source) {
                    let target = if resolve::is_relative(&specifier) {
                        let resolved = resolver.resolve(&path, &specifier).ok_or_else(|| {
                            BundleError::UnresolvedImport {
                                importer: path.clone(),
                                specifier: specifier.clone(),
                            }
                        })?;
                        if !seen.contains(&resolved) {
                            seen.push(resolved.clone());
                            queue.push_back(resolved.clone());
                        }
                        ImportTarget::Local(resolved)
                    } else {
                        ImportTarget::External(self.import_map.resolve(&specifier))
                    };
                    imports.push(ResolvedImport { specifier, target });
                }
            }

            modules.push(ModuleRecord {
                path,
                source,
                imports,
            });
        }

        Ok(ServerModule {
            entry: entry.to_string(),
            modules,
        })
    }

    fn link_client(&self, server: &ServerModule) -> Result<ClientModule, BundleError> {
        let graph: HashMap<&str, &ModuleRecord> = server
            .modules
            .iter()
            .map(|m| (m.path.as_str(), m))
            .collect();

        let mut linker = ClientLinker {
            graph,
            urls: HashMap::new(),
            stack: Vec::new(),
        };
        let source = linker.emit(&server.entry)?;
        let etag = format!("\"{:x}\"", Sha256::digest(source.as_bytes()));

        Ok(ClientModule { source, etag })
    }
}

/// Depth-first inliner for the client target.
struct ClientLinker<'a> {
    graph: HashMap<&'a str, &'a ModuleRecord>,
    /// Finished `data:` URLs by path.
    urls: HashMap<String, String>,
    /// Paths currently being emitted, for cycle detection.
    stack: Vec<String>,
}

impl ClientLinker<'_> {
    /// Module text for `path` with every import rewritten.
    fn emit(&mut self, path: &str) -> Result<String, BundleError> {
        if let Some(pos) = self.stack.iter().position(|p| p == path) {
            let mut cycle = self.stack[pos..].to_vec();
            cycle.push(path.to_string());
            return Err(BundleError::CircularImport(cycle));
        }
        let Some(record) = self.graph.get(path).copied() else {
            return Ok(String::new());
        };

        if path.ends_with(".css") {
            return Ok(css_module(&record.source));
        }
        if path.ends_with(".json") {
            return Ok(format!("export default {};\n", record.source.trim()));
        }

        self.stack.push(path.to_string());
        let mut replacements: HashMap<&str, String> = HashMap::new();
        for import in &record.imports {
            let url = match &import.target {
                ImportTarget::Local(dep) => self.data_url(dep)?,
                ImportTarget::External(url) => url.clone(),
            };
            replacements.insert(import.specifier.as_str(), url);
        }
        self.stack.pop();

        Ok(rewrite_imports(&record.source, &replacements))
    }

    fn data_url(&mut self, path: &str) -> Result<String, BundleError> {
        if let Some(url) = self.urls.get(path) {
            return Ok(url.clone());
        }
        let source = self.emit(path)?;
        let url = format!(
            "data:text/javascript;base64,{}",
            BASE64.encode(source.as_bytes())
        );
        self.urls.insert(path.to_string(), url.clone());
        Ok(url)
    }
}

fn normalize_files(artifact: &SourceArtifact) -> Result<BTreeMap<String, String>, BundleError> {
    let files: BTreeMap<String, String> = match artifact {
        SourceArtifact::Module(source) => {
            BTreeMap::from([(SINGLE_MODULE_PATH.to_string(), source.clone())])
        }
        SourceArtifact::Files(files) => files
            .iter()
            .map(|(path, source)| (resolve::normalize(path), source.clone()))
            .filter(|(path, _)| !path.is_empty())
            .collect(),
    };

    if files.values().all(|source| source.trim().is_empty()) {
        return Err(BundleError::EmptySource);
    }
    Ok(files)
}

fn find_entry(files: &BTreeMap<String, String>) -> Result<String, BundleError> {
    if files.len() == 1 {
        if let Some(path) = files.keys().next() {
            return Ok(path.clone());
        }
    }
    for dir in ["", "src/"] {
        for name in ENTRY_NAMES {
            for ext in ENTRY_EXTENSIONS {
                let candidate = format!("{}{}{}", dir, name, ext);
                if files.contains_key(&candidate) {
                    return Ok(candidate);
                }
            }
        }
    }
    Err(BundleError::NoEntry)
}

fn is_script(path: &str) -> bool {
    !(path.ends_with(".css") || path.ends_with(".json"))
}

/// Specifiers of every static import in `source`, in order, deduplicated.
pub fn scan_imports(source: &str) -> Vec<String> {
    let mut specifiers: Vec<String> = Vec::new();
    for caps in IMPORT_REGEX.captures_iter(source) {
        let specifier = caps[2].trim().to_string();
        if !specifiers.contains(&specifier) {
            specifiers.push(specifier);
        }
    }
    specifiers
}

/// String constants exported from `source`.
pub fn string_exports(source: &str) -> BTreeMap<String, String> {
    STRING_EXPORT_REGEX
        .captures_iter(source)
        .filter_map(|caps| {
            let value = caps.get(2).or_else(|| caps.get(3))?;
            Some((caps[1].to_string(), value.as_str().to_string()))
        })
        .collect()
}

/// Replace import specifiers, leaving the rest of each statement intact.
fn rewrite_imports(source: &str, replacements: &HashMap<&str, String>) -> String {
    IMPORT_REGEX
        .replace_all(source, |caps: &Captures| {
            let (Some(whole), Some(spec)) = (caps.get(0), caps.get(2)) else {
                return caps[0].to_string();
            };
            match replacements.get(spec.as_str().trim()) {
                Some(url) => format!(
                    "{}{}{}",
                    &source[whole.start()..spec.start()],
                    url,
                    &source[spec.end()..whole.end()]
                ),
                None => whole.as_str().to_string(),
            }
        })
        .into_owned()
}

/// Style-injecting module for a CSS file.
fn css_module(css: &str) -> String {
    let literal = Value::String(css.to_string()).to_string();
    format!(
        "const css = {literal};\n\
         if (typeof document !== \"undefined\") {{\n\
         \x20 const style = document.createElement(\"style\");\n\
         \x20 style.textContent = css;\n\
         \x20 document.head.appendChild(style);\n\
         }}\n\
         export default css;\n"
    )
}

fn content_hash(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, source) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}
