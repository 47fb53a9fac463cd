//! Splits a checked-out repository into components.
//!
//! Sub-directories of the conventional source roots (`src`, `lib`,
//! `packages`, ...) become components; failing that, top-level directories
//! do; failing that, the whole repository is one component.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::model::{DetectedComponent, DetectedFile};

const COMMON_ROOTS: &[&str] = &["src", "lib", "packages", "apps", "pkg", "cmd", "internal"];

const SKIP_DIRS: &[&str] = &[
    "node_modules", ".git", ".svn", ".hg", "__pycache__", ".pytest_cache", ".mypy_cache",
    ".tox", ".nox", "venv", ".venv", "env", ".env", "dist", "build", "target", "vendor",
    ".cargo", ".rustup", "coverage", ".coverage", "htmlcov", ".nyc_output", ".idea",
    ".vscode", ".vs", "eggs", "site-packages",
];

const EXTENSIONS: &[(&str, &str)] = &[
    ("py", "python"), ("pyx", "python"), ("pyi", "python"),
    ("js", "javascript"), ("jsx", "javascript"), ("mjs", "javascript"), ("cjs", "javascript"),
    ("ts", "typescript"), ("tsx", "typescript"),
    ("go", "go"),
    ("rs", "rust"),
    ("java", "java"),
    ("c", "c"), ("h", "c"),
    ("cpp", "cpp"), ("hpp", "cpp"), ("cc", "cpp"), ("cxx", "cpp"), ("hxx", "cpp"),
    ("rb", "ruby"),
    ("php", "php"),
    ("sh", "shell"), ("bash", "shell"), ("zsh", "shell"),
    ("yml", "yaml"), ("yaml", "yaml"),
    ("json", "json"),
    ("md", "markdown"), ("markdown", "markdown"),
];

/// Languages worth sending to the model; data and prose formats are not.
pub fn is_code_language(language: &str) -> bool {
    !matches!(language, "yaml" | "json" | "markdown" | "unknown")
}

pub fn language_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, language)| *language)
}

fn is_skipped_dir(name: &str) -> bool {
    name.starts_with('.') || SKIP_DIRS.contains(&name) || name.ends_with(".egg-info")
}

fn keep_entry(entry: &DirEntry) -> bool {
    entry.depth() == 0
        || !entry.file_type().is_dir()
        || !is_skipped_dir(&entry.file_name().to_string_lossy())
}

#[derive(Debug, Clone)]
pub struct ComponentDetector {
    max_file_size: u64,
    max_files: usize,
}

impl ComponentDetector {
    pub fn new(max_file_size_kb: u64, max_files_per_component: usize) -> Self {
        Self {
            max_file_size: max_file_size_kb * 1024,
            max_files: max_files_per_component.max(1),
        }
    }

    /// Blocking; run it off the async executor.
    pub fn detect(&self, repo: &Path, root_name: &str) -> Result<Vec<DetectedComponent>> {
        let mut components = Vec::new();
        for dir in candidates(repo)? {
            if let Some(component) = self.analyze_dir(repo, &dir, None)? {
                components.push(component);
            }
        }

        if components.is_empty()
            && let Some(root) = self.analyze_dir(repo, repo, Some(root_name))?
        {
            components.push(root);
        }

        debug!(count = components.len(), "components detected");
        Ok(components)
    }

    fn analyze_dir(&self, repo: &Path, dir: &Path, name: Option<&str>) -> Result<Option<DetectedComponent>> {
        let mut files = Vec::new();
        let mut languages: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut line_count = 0u64;

        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(keep_entry);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(language) = language_for(entry.path()) else {
                continue;
            };
            *languages.entry(language).or_default() += 1;

            let size = entry
                .metadata()
                .with_context(|| format!("failed to stat {}", entry.path().display()))?
                .len();
            if size > self.max_file_size {
                debug!(path = %entry.path().display(), size, "file too large; skipped");
                continue;
            }
            let lines = count_lines(entry.path());
            line_count += lines;

            let relative = entry.path().strip_prefix(repo).unwrap_or(entry.path());
            files.push(DetectedFile {
                path: relative.to_string_lossy().replace('\\', "/"),
                language: language.to_string(),
                size_bytes: size,
                line_count: lines,
            });
        }

        if files.is_empty() {
            return Ok(None);
        }

        let language = languages
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map_or("unknown", |(language, _)| language)
            .to_string();
        let relative = dir.strip_prefix(repo).unwrap_or(dir);
        let path = if relative.as_os_str().is_empty() {
            ".".to_string()
        } else {
            relative.to_string_lossy().replace('\\', "/")
        };
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let component_type = component_type(&dir_name, &files).to_string();
        files.truncate(self.max_files);

        Ok(Some(DetectedComponent {
            name: name.map_or(dir_name, str::to_string),
            path,
            component_type,
            language,
            line_count,
            files,
        }))
    }
}

fn candidates(repo: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    for root in COMMON_ROOTS {
        let dir = repo.join(root);
        if dir.is_dir() {
            out.extend(subdirs(&dir)?);
        }
    }
    if out.is_empty() {
        out = subdirs(repo)?;
    }
    Ok(out)
}

fn subdirs(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && !is_skipped_dir(&entry.file_name().to_string_lossy()) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn count_lines(path: &Path) -> u64 {
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => 0,
        Ok(bytes) => {
            let newlines = bytes.iter().filter(|b| **b == b'\n').count() as u64;
            if bytes.last() == Some(&b'\n') { newlines } else { newlines + 1 }
        }
        Err(_) => 0,
    }
}

fn is_test_name(file_name: &str) -> bool {
    let stem = file_name.rsplit_once('.').map_or(file_name, |(stem, _)| stem);
    ["test_", "_test", ".test", ".spec", "tests"]
        .iter()
        .any(|p| stem.contains(p))
}

fn component_type(dir_name: &str, files: &[DetectedFile]) -> &'static str {
    match dir_name.to_ascii_lowercase().as_str() {
        "api" | "routes" | "handlers" | "controllers" | "endpoints" => return "api",
        "models" | "entities" | "schemas" | "types" => return "model",
        "utils" | "helpers" | "common" | "shared" | "lib" => return "util",
        _ => {}
    }

    let names: Vec<String> = files
        .iter()
        .map(|f| {
            f.path
                .rsplit('/')
                .next()
                .unwrap_or(&f.path)
                .to_ascii_lowercase()
        })
        .collect();
    let has = |markers: &[&str]| names.iter().any(|n| markers.iter().any(|m| n.contains(m)));

    if has(&["main.py", "main.go", "main.rs", "index.ts", "index.js", "app.py", "server.py"]) {
        "service"
    } else if has(&["__init__.py", "lib.rs", "mod.rs"]) {
        "library"
    } else if has(&["config.py", "config.ts", "config.go", "settings.py"]) {
        "config"
    } else if names.iter().filter(|n| is_test_name(n)).count() * 2 > names.len() {
        "test"
    } else {
        "module"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn subdirectories_of_src_become_components() {
        let repo = tempfile::tempdir().unwrap();
        write(repo.path(), "src/api/routes.py", "def index():\n    return 1\n");
        write(repo.path(), "src/core/lib.rs", "pub fn f() {}\n");
        write(repo.path(), "src/core/node_modules/x.js", "ignored");
        write(repo.path(), "README.md", "# readme\n");

        let components = ComponentDetector::new(500, 50).detect(repo.path(), "demo").unwrap();
        let names: Vec<&str> = components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["api", "core"]);

        let api = &components[0];
        assert_eq!(api.path, "src/api");
        assert_eq!(api.component_type, "api");
        assert_eq!(api.language, "python");
        assert_eq!(api.files[0].path, "src/api/routes.py");
        assert_eq!(api.line_count, 2);

        let core = &components[1];
        assert_eq!(core.component_type, "library");
        assert_eq!(core.files.len(), 1);
    }

    #[test]
    fn falls_back_to_top_level_then_root() {
        let repo = tempfile::tempdir().unwrap();
        write(repo.path(), "tools/run.sh", "echo hi\n");
        write(repo.path(), ".github/workflows/ci.yml", "on: push\n");
        let components = ComponentDetector::new(500, 50).detect(repo.path(), "demo").unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "tools");
        assert_eq!(components[0].language, "shell");

        let flat = tempfile::tempdir().unwrap();
        write(flat.path(), "main.go", "package main\n");
        let components = ComponentDetector::new(500, 50).detect(flat.path(), "flat").unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "flat");
        assert_eq!(components[0].path, ".");
        assert_eq!(components[0].component_type, "service");
    }

    #[test]
    fn large_files_and_file_cap_are_enforced() {
        let repo = tempfile::tempdir().unwrap();
        write(repo.path(), "src/big/huge.py", &"x = 1\n".repeat(400));
        for i in 0..5 {
            write(repo.path(), &format!("src/big/m{i}.py"), "y = 2\n");
        }
        let components = ComponentDetector::new(1, 3).detect(repo.path(), "demo").unwrap();
        let big = &components[0];
        assert_eq!(big.files.len(), 3);
        assert!(big.files.iter().all(|f| !f.path.ends_with("huge.py")));
    }

    #[test]
    fn mostly_tests_is_a_test_component() {
        let files: Vec<DetectedFile> = ["test_a.py", "test_b.py", "helper.py"]
            .iter()
            .map(|n| DetectedFile {
                path: format!("suite/{n}"),
                language: "python".into(),
                size_bytes: 1,
                line_count: 1,
            })
            .collect();
        assert_eq!(component_type("suite", &files), "test");
    }

    #[test]
    fn code_languages() {
        assert_eq!(language_for(Path::new("a/B.TS")), Some("typescript"));
        assert_eq!(language_for(Path::new("Makefile")), None);
        assert!(is_code_language("rust"));
        assert!(!is_code_language("markdown"));
    }
}
