use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

/// The one service whose tag lives at a nested path inside a shared values
/// folder instead of its own.
pub const NESTED_TAG_SERVICE: &str = "fe-web-mvc";
pub const NESTED_TAG_FOLDER: &str = "web-mvc";

/// Registry entry for one deployable service, read from the GitOps working
/// copy.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    /// Folder in the GitOps repo holding this service's values file.
    pub folder: String,
    /// Tag currently deployed per the values file.
    pub current_tag: String,
    /// Image tag prefix, e.g. `pre-release-tw-`.
    pub tag_prefix: String,
    /// Pre-release branch this service merges to, derived from the prefix.
    pub target_branch: String,
    /// Repository name on the CI build server.
    pub ci_repo: String,
}

/// Per-service registry scanned from the GitOps working copy. Rebuilt (after
/// a repo sync) whenever fresh `current_tag` values are needed.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    entries: HashMap<String, ServiceInfo>,
    default_branch: String,
}

impl ServiceRegistry {
    /// Scan `repo_path` for `<folder>/values-staging-<country>.yaml` files.
    pub fn scan(repo_path: &Path, country: &str, default_branch: &str) -> Self {
        let values_file = format!("values-staging-{country}.yaml");
        let mut entries = HashMap::new();

        let dirs = match std::fs::read_dir(repo_path) {
            Ok(d) => d,
            Err(e) => {
                warn!("scan {}: {e}", repo_path.display());
                return Self {
                    entries,
                    default_branch: default_branch.to_string(),
                };
            }
        };

        for entry in dirs.flatten() {
            let folder = entry.file_name().to_string_lossy().into_owned();
            let vf = entry.path().join(&values_file);
            if !vf.is_file() {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(&vf) else {
                continue;
            };
            let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(&raw) else {
                warn!("unparseable values file {}", vf.display());
                continue;
            };

            if folder == NESTED_TAG_FOLDER {
                if let Some(tag) = read_tag(&doc, &["global", "image", "fe_web_mvc", "tag"]) {
                    entries.insert(
                        NESTED_TAG_SERVICE.to_string(),
                        Self::make_info(NESTED_TAG_SERVICE, &folder, &tag, default_branch),
                    );
                }
            }
            if let Some(tag) = read_tag(&doc, &["global", "image", "tag"]) {
                entries.insert(
                    folder.clone(),
                    Self::make_info(&folder, &folder, &tag, default_branch),
                );
            }
        }

        Self {
            entries,
            default_branch: default_branch.to_string(),
        }
    }

    fn make_info(name: &str, folder: &str, tag: &str, default_branch: &str) -> ServiceInfo {
        let tag_prefix =
            derive_prefix(tag).unwrap_or_else(|| format!("{default_branch}-"));
        let target_branch = tag_prefix.trim_end_matches('-').to_string();
        ServiceInfo {
            name: name.to_string(),
            folder: folder.to_string(),
            current_tag: tag.to_string(),
            tag_prefix,
            target_branch,
            ci_repo: name.to_string(),
        }
    }

    pub fn get(&self, service: &str) -> Option<&ServiceInfo> {
        self.entries.get(service)
    }

    pub fn tag_prefix(&self, service: &str) -> String {
        self.entries
            .get(service)
            .map(|i| i.tag_prefix.clone())
            .unwrap_or_else(|| format!("{}-", self.default_branch))
    }

    /// Target pre-release branch for a service, with the global default as
    /// fallback.
    pub fn target_branch(&self, service: &str) -> String {
        self.entries
            .get(service)
            .map(|i| i.target_branch.clone())
            .unwrap_or_else(|| self.default_branch.clone())
    }

    /// Expected artifact tag: `{prefix}{sha[:10]}`.
    pub fn expected_tag(&self, service: &str, sha: &str) -> String {
        let sha10: String = sha.chars().take(10).collect();
        format!("{}{}", self.tag_prefix(service), sha10)
    }

    pub fn ci_repo(&self, service: &str) -> String {
        self.entries
            .get(service)
            .map(|i| i.ci_repo.clone())
            .unwrap_or_else(|| service.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Relative path of a service's values file, plus the YAML path of its tag.
pub fn values_location(service: &str, values_file: &str) -> (String, PathBuf, Vec<&'static str>) {
    if service == NESTED_TAG_SERVICE {
        (
            NESTED_TAG_FOLDER.to_string(),
            Path::new(NESTED_TAG_FOLDER).join(values_file),
            vec!["global", "image", "fe_web_mvc", "tag"],
        )
    } else {
        (
            service.to_string(),
            Path::new(service).join(values_file),
            vec!["global", "image", "tag"],
        )
    }
}

/// Walk a YAML document down `path` and return the string at the leaf.
pub fn read_tag(doc: &serde_yaml::Value, path: &[&str]) -> Option<String> {
    let mut node = doc;
    for key in path {
        node = node.get(key)?;
    }
    match node {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Derive the tag prefix from a deployed tag shaped like `<prefix><sha10>`:
/// everything before a trailing hex run of at least 6 characters.
fn derive_prefix(tag: &str) -> Option<String> {
    let (prefix, suffix) = tag.rsplit_once('-')?;
    if suffix.len() >= 6 && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("{prefix}-"))
    } else {
        None
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_values(dir: &Path, folder: &str, yaml: &str) {
        let d = dir.join(folder);
        std::fs::create_dir_all(&d).unwrap();
        std::fs::write(d.join("values-staging-ug.yaml"), yaml).unwrap();
    }

    #[test]
    fn scan_reads_current_tags_and_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        write_values(
            dir.path(),
            "alive",
            "global:\n  image:\n    tag: \"pre-release-tw-abc123def4\"\n",
        );
        write_values(
            dir.path(),
            "wallet",
            "global:\n  image:\n    tag: staging-ug-00ff00ff00\n",
        );

        let reg = ServiceRegistry::scan(dir.path(), "ug", "pre-release-tw");
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get("alive").unwrap().current_tag, "pre-release-tw-abc123def4");
        assert_eq!(reg.tag_prefix("alive"), "pre-release-tw-");
        assert_eq!(reg.target_branch("alive"), "pre-release-tw");
        assert_eq!(reg.tag_prefix("wallet"), "staging-ug-");
        assert_eq!(reg.target_branch("wallet"), "staging-ug");
    }

    #[test]
    fn unknown_service_falls_back_to_default_branch() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ServiceRegistry::scan(dir.path(), "ug", "pre-release-tw");
        assert_eq!(reg.tag_prefix("ghost"), "pre-release-tw-");
        assert_eq!(reg.target_branch("ghost"), "pre-release-tw");
    }

    #[test]
    fn expected_tag_truncates_sha_to_ten() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ServiceRegistry::scan(dir.path(), "ug", "pre-release-tw");
        assert_eq!(
            reg.expected_tag("ghost", "abc123def4567890abcd"),
            "pre-release-tw-abc123def4"
        );
    }

    #[test]
    fn nested_tag_service_is_registered_from_shared_folder() {
        let dir = tempfile::tempdir().unwrap();
        write_values(
            dir.path(),
            "web-mvc",
            "global:\n  image:\n    tag: pre-release-tw-1111111111\n    fe_web_mvc:\n      tag: pre-release-tw-2222222222\n",
        );
        let reg = ServiceRegistry::scan(dir.path(), "ug", "pre-release-tw");
        assert_eq!(
            reg.get("fe-web-mvc").unwrap().current_tag,
            "pre-release-tw-2222222222"
        );
        assert_eq!(reg.get("web-mvc").unwrap().current_tag, "pre-release-tw-1111111111");
    }

    #[test]
    fn values_location_handles_the_nested_exception() {
        let (folder, path, tag_path) = values_location("alive", "values-staging-ug.yaml");
        assert_eq!(folder, "alive");
        assert_eq!(path, Path::new("alive").join("values-staging-ug.yaml"));
        assert_eq!(tag_path, vec!["global", "image", "tag"]);

        let (folder, path, tag_path) = values_location("fe-web-mvc", "values-staging-ug.yaml");
        assert_eq!(folder, "web-mvc");
        assert_eq!(path, Path::new("web-mvc").join("values-staging-ug.yaml"));
        assert_eq!(tag_path, vec!["global", "image", "fe_web_mvc", "tag"]);
    }

    #[test]
    fn prefix_derivation_requires_hex_suffix() {
        assert_eq!(derive_prefix("pre-release-tw-abc123def4"), Some("pre-release-tw-".into()));
        assert_eq!(derive_prefix("latest"), None);
        assert_eq!(derive_prefix("release-notahex"), None);
    }
}
