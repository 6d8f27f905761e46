/// Module loader.
///
/// Finds the project manifest (`prism.toml`) in the nearest ancestor
/// directory, then resolves `use a.b.C` imports: project-prefixed paths map
/// to `<project-root>/src/a/b/C.prism`, everything else to
/// `<stdlib-root>/a/b/C.prism` (the stdlib root comes from `PRISM_HOME`,
/// default `~/.prism/std`). A `loaded` set keyed by canonical absolute path
/// prevents duplicate parsing and makes cyclic imports harmless.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::ast::File;
use crate::errors::{Diagnostics, LoadError};
use crate::parser::parse_source;

pub const SOURCE_EXT: &str = "prism";
pub const MANIFEST_NAME: &str = "prism.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub namespace: String,
    #[serde(default)]
    pub project: Option<ProjectMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Walk up from `start` to the nearest directory holding a manifest.
pub fn find_manifest(start: &Path) -> Result<(PathBuf, Manifest), LoadError> {
    let mut dir = if start.is_dir() {
        start.to_path_buf()
    } else {
        start.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
    };
    loop {
        let candidate = dir.join(MANIFEST_NAME);
        if candidate.is_file() {
            let text = std::fs::read_to_string(&candidate).map_err(|e| LoadError::Io {
                path: candidate.display().to_string(),
                source: e,
            })?;
            let manifest: Manifest = toml::from_str(&text).map_err(|e| LoadError::BadManifest {
                path: candidate.display().to_string(),
                detail: e.to_string(),
            })?;
            return Ok((dir, manifest));
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => {
                return Err(LoadError::ManifestNotFound { start: start.display().to_string() })
            }
        }
    }
}

fn default_stdlib_root() -> PathBuf {
    if let Ok(home) = std::env::var("PRISM_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".prism").join("std");
        }
    }
    PathBuf::from(".prism").join("std")
}

pub struct Loader {
    pub root: PathBuf,
    pub namespace: String,
    pub stdlib_root: PathBuf,
    /// Canonical paths already parsed; cyclic `use` hits this and stops.
    loaded: HashSet<PathBuf>,
    pub diagnostics: Diagnostics,
    next_source_id: u32,
}

impl Loader {
    /// Set up for an entry file. A missing manifest is only an error once an
    /// import actually needs resolving.
    pub fn for_entry(entry: &Path) -> Self {
        let (root, namespace) = match find_manifest(entry) {
            Ok((root, manifest)) => (root, manifest.namespace),
            Err(_) => {
                let dir = entry.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
                (dir, String::new())
            }
        };
        Loader {
            root,
            namespace,
            stdlib_root: default_stdlib_root(),
            loaded: HashSet::new(),
            diagnostics: Diagnostics::new(),
            next_source_id: 0,
        }
    }

    /// Resolve a dotted `use` path to a file on disk.
    pub fn resolve(&self, path: &[String]) -> Result<PathBuf, LoadError> {
        let rel: PathBuf = path.iter().collect();
        let rel = rel.with_extension(SOURCE_EXT);

        let candidate = if !self.namespace.is_empty()
            && path.first().map(String::as_str) == Some(self.namespace.as_str())
        {
            self.root.join("src").join(&rel)
        } else {
            self.stdlib_root.join(&rel)
        };

        if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(LoadError::ModuleNotFound {
                name: path.join("."),
                tried: candidate.display().to_string(),
            })
        }
    }

    /// Parse the entry file and every transitively `use`d module. The result
    /// is dependency-first with the entry file last; only the entry file's
    /// top-level statements execute.
    pub fn load_program(&mut self, entry: &Path) -> Result<Vec<File>, LoadError> {
        let mut files = Vec::new();
        self.load_file(entry, &mut files)?;
        Ok(files)
    }

    fn load_file(&mut self, path: &Path, out: &mut Vec<File>) -> Result<(), LoadError> {
        let canonical = path
            .canonicalize()
            .map_err(|e| LoadError::Io { path: path.display().to_string(), source: e })?;
        if !self.loaded.insert(canonical.clone()) {
            // Already parsed (or currently being parsed): cycles stop here.
            return Ok(());
        }
        debug!(path = %canonical.display(), "loading module");

        let source = std::fs::read_to_string(&canonical)
            .map_err(|e| LoadError::Io { path: canonical.display().to_string(), source: e })?;
        let source_id = self.next_source_id;
        self.next_source_id += 1;

        let (file, lex_errors, parse_errors) = parse_source(&source, source_id);
        for e in &lex_errors {
            self.diagnostics.push_lex(e);
        }
        for e in &parse_errors {
            self.diagnostics.push_parse(e);
        }

        for use_decl in &file.uses {
            match self.resolve(&use_decl.path) {
                Ok(dep) => self.load_file(&dep, out)?,
                Err(e) => {
                    self.diagnostics.error("LoadError", e.to_string(), use_decl.span);
                }
            }
        }

        out.push(file);
        Ok(())
    }
}

/// Merge dependency files into one compilation unit: declarations from every
/// module, top-level statements from the entry file only.
pub fn merge_files(files: Vec<File>) -> File {
    let mut merged = File::default();
    let count = files.len();
    for (i, mut f) in files.into_iter().enumerate() {
        merged.decls.append(&mut f.decls);
        if i + 1 == count {
            merged.namespace = f.namespace;
            merged.stmts = f.stmts;
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    #[test]
    fn manifest_discovered_in_ancestor() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(&dir.path().join(MANIFEST_NAME), "namespace = \"app\"\n");
        let entry = dir.path().join("src").join("deep").join("main.prism");
        write(&entry, "echo 1;");
        let (root, manifest) = find_manifest(&entry).expect("manifest found");
        assert_eq!(root, dir.path());
        assert_eq!(manifest.namespace, "app");
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entry = dir.path().join("main.prism");
        write(&entry, "echo 1;");
        // No manifest anywhere under the temp root: walking up eventually
        // fails (unless a manifest exists above the temp dir, which would
        // be an environmental accident).
        let result = find_manifest(&entry);
        if let Ok((root, _)) = &result {
            assert!(!root.starts_with(dir.path()));
        }
    }

    #[test]
    fn project_import_resolves_under_src() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(&dir.path().join(MANIFEST_NAME), "namespace = \"app\"\n");
        write(
            &dir.path().join("src/app/util/Strings.prism"),
            "function shout(string $s): string { return $s + \"!\"; }",
        );
        let entry = dir.path().join("src/app/main.prism");
        write(&entry, "use app.util.Strings;\necho shout(\"hi\");");

        let mut loader = Loader::for_entry(&entry);
        assert_eq!(loader.namespace, "app");
        let files = loader.load_program(&entry).expect("loads");
        assert!(loader.diagnostics.is_empty(), "{:?}", loader.diagnostics.iter().collect::<Vec<_>>());
        assert_eq!(files.len(), 2);
        // Dependency first, entry last.
        assert_eq!(files[0].decls.len(), 1);
        assert_eq!(files[1].stmts.len(), 1);
    }

    #[test]
    fn cyclic_imports_terminate() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(&dir.path().join(MANIFEST_NAME), "namespace = \"app\"\n");
        write(&dir.path().join("src/app/A.prism"), "use app.B;\nfunction fa(): int { return 1; }");
        write(&dir.path().join("src/app/B.prism"), "use app.A;\nfunction fb(): int { return 2; }");
        let entry = dir.path().join("src/app/main.prism");
        write(&entry, "use app.A;\necho fa() + fb();");

        let mut loader = Loader::for_entry(&entry);
        let files = loader.load_program(&entry).expect("loads despite the cycle");
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn duplicate_imports_parse_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(&dir.path().join(MANIFEST_NAME), "namespace = \"app\"\n");
        write(&dir.path().join("src/app/Shared.prism"), "function s(): int { return 9; }");
        write(&dir.path().join("src/app/A.prism"), "use app.Shared;\nfunction fa(): int { return s(); }");
        let entry = dir.path().join("src/app/main.prism");
        write(&entry, "use app.A;\nuse app.Shared;\necho fa();");

        let mut loader = Loader::for_entry(&entry);
        let files = loader.load_program(&entry).expect("loads");
        // Shared appears once even though two files import it.
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn unknown_import_reports_candidates() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(&dir.path().join(MANIFEST_NAME), "namespace = \"app\"\n");
        let entry = dir.path().join("src/app/main.prism");
        write(&entry, "use app.not.There;\necho 1;");

        let mut loader = Loader::for_entry(&entry);
        loader.load_program(&entry).expect("entry still loads");
        assert!(loader.diagnostics.has_errors());
        let msgs: Vec<String> = loader.diagnostics.iter().map(|d| d.message.clone()).collect();
        assert!(msgs.iter().any(|m| m.contains("app.not.There")), "{:?}", msgs);
    }

    #[test]
    fn merged_unit_keeps_entry_statements_only() {
        let dep = File {
            decls: vec![],
            stmts: vec![crate::ast::Stmt::Break(crate::errors::Span::default())],
            ..File::default()
        };
        let entry = File { namespace: Some("app".into()), ..File::default() };
        let merged = merge_files(vec![dep, entry]);
        assert!(merged.stmts.is_empty());
        assert_eq!(merged.namespace.as_deref(), Some("app"));
    }
}
