use crate::models::FileMap;
use once_cell::sync::Lazy;
use regex::RegexSet;

/// Scaffold files generated output may never replace.
static PROTECTED_PATHS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"^package\.json$",
        r"^tsconfig.*\.json$",
        r"^vite\.config\.(ts|js)$",
        r"^postcss\.config\.(js|cjs)$",
        r"^tailwind\.config\.(js|ts)$",
        r"^src/main\.(tsx|jsx)$",
        r"^src/index\.css$",
        r"^src/lib/utils\.(ts|js)$",
        r"^src/components/app/",
        r"^src/components/ui/",
        r"^src/preview/",
        r"^index\.html$",
    ])
    .expect("valid protected path regex")
});

/// Locations generated business code is allowed to write to.
static WRITABLE_PATHS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"^src/pages/",
        r"^src/features/",
        r"^src/components/generated/",
        r"^src/lib/generated/",
        r"^src/hooks/generated/",
        r"^src/__tests__/",
        r"^tests/",
        r"^src/(components|lib|hooks)/generated/.*\.module\.css$",
        r"^vibe\.meta\.json$",
    ])
    .expect("valid writable path regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathVerdict {
    Allowed,
    Protected,
    Unauthorized,
}

pub fn check_path(path: &str) -> PathVerdict {
    if PROTECTED_PATHS.is_match(path) {
        PathVerdict::Protected
    } else if WRITABLE_PATHS.is_match(path) && !path.split('/').any(|segment| segment == "..") {
        PathVerdict::Allowed
    } else {
        PathVerdict::Unauthorized
    }
}

/// Keeps only generated files that land in writable locations. Leading `/`
/// is stripped from every key.
pub fn filter_generated_files(files: &FileMap) -> FileMap {
    let mut allowed = FileMap::new();
    let mut protected = 0usize;
    let mut blocked = 0usize;

    for (path, contents) in files {
        let clean = path.trim_start_matches('/');
        match check_path(clean) {
            PathVerdict::Allowed => {
                allowed.insert(clean.to_string(), contents.clone());
            }
            PathVerdict::Protected => {
                tracing::warn!(path = clean, "blocked generated write to protected file");
                protected += 1;
            }
            PathVerdict::Unauthorized => {
                tracing::warn!(path = clean, "blocked generated write outside writable paths");
                blocked += 1;
            }
        }
    }

    tracing::info!(
        allowed = allowed.len(),
        protected,
        blocked,
        "generated file filtering complete"
    );
    allowed
}

#[cfg(test)]
mod tests {
    use super::{check_path, filter_generated_files, PathVerdict};
    use crate::models::FileMap;

    #[test]
    fn classifies_paths() {
        assert_eq!(check_path("src/pages/Index.tsx"), PathVerdict::Allowed);
        assert_eq!(check_path("src/components/generated/Board.module.css"), PathVerdict::Allowed);
        assert_eq!(check_path("vibe.meta.json"), PathVerdict::Allowed);
        assert_eq!(check_path("src/components/ui/button.tsx"), PathVerdict::Protected);
        assert_eq!(check_path("tsconfig.node.json"), PathVerdict::Protected);
        assert_eq!(check_path("src/App.tsx"), PathVerdict::Unauthorized);
        assert_eq!(check_path("src/pages/../../etc/passwd"), PathVerdict::Unauthorized);
    }

    #[test]
    fn filter_strips_leading_slash_and_drops_blocked() {
        let mut files = FileMap::new();
        files.insert("/src/features/todo/store.ts".to_string(), "export {}".to_string());
        files.insert("/vite.config.ts".to_string(), "evil".to_string());
        files.insert("README.md".to_string(), "# hi".to_string());

        let filtered = filter_generated_files(&files);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("src/features/todo/store.ts"));
    }
}
