use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::Utc;
use grantops_types::{GrantOpsError, Result, SectionStatus};
use regex::Regex;

use crate::atomic::{write_atomic, write_new};
use crate::diff::{diff_lines, SectionDiff};
use crate::lock::FileLock;
use crate::model::{content_hash, word_count, Section, SectionSnapshot, Version, VersionManifest};

fn section_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").unwrap())
}

/// Reject ids that could escape the section directory or collide with `all`.
pub fn validate_section_id(id: &str) -> Result<()> {
    if id == "all" || !section_id_pattern().is_match(id) {
        return Err(GrantOpsError::InvalidSectionId {
            section: id.to_string(),
        });
    }
    Ok(())
}

fn version_stem(number: u32) -> String {
    format!("v{number:04}")
}

fn parse_version_stem(name: &str) -> Option<u32> {
    name.strip_prefix('v')?.strip_suffix(".json")?.parse().ok()
}

/// Sole owner of section histories under a root directory.
///
/// Commits, restores and status changes for one section are serialised by a
/// per-section async lock within the process and by `<root>/.locks/<id>.lock`
/// across processes, so version numbers form a total order per section no
/// matter how many tasks or stores commit concurrently.
pub struct VersionStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl VersionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn section_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn section_path(&self, id: &str) -> PathBuf {
        self.section_dir(id).join("section.json")
    }

    fn versions_dir(&self, id: &str) -> PathBuf {
        self.section_dir(id).join("versions")
    }

    fn section_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Hold both the in-process and the cross-process writer lock for `id`.
    async fn lock_writer(
        &self,
        id: &str,
    ) -> Result<(tokio::sync::OwnedMutexGuard<()>, FileLock)> {
        let local = self.section_lock(id).lock_owned().await;
        let path = self.root.join(".locks").join(format!("{id}.lock"));
        let file = FileLock::exclusive(&path).await?;
        Ok((local, file))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Load a section head record, `None` if it was never committed.
    pub async fn section(&self, id: &str) -> Result<Option<Section>> {
        validate_section_id(id)?;
        let path = self.section_path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn require_section(&self, id: &str) -> Result<Section> {
        self.section(id)
            .await?
            .ok_or_else(|| GrantOpsError::SectionNotFound {
                section: id.to_string(),
            })
    }

    /// All sections with at least one committed version, sorted by id.
    pub async fn list_sections(&self) -> Result<Vec<Section>> {
        let mut sections = Vec::new();
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(sections);
        }
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_section_id(&name).is_err() {
                continue;
            }
            if let Some(section) = self.section(&name).await? {
                sections.push(section);
            }
        }
        sections.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sections)
    }

    async fn manifest(&self, id: &str, number: u32) -> Result<Option<VersionManifest>> {
        let path = self
            .versions_dir(id)
            .join(format!("{}.json", version_stem(number)));
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Published version numbers of a section, ascending.
    async fn published_numbers(&self, id: &str) -> Result<Vec<u32>> {
        let dir = self.versions_dir(id);
        let mut numbers = Vec::new();
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(numbers);
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(n) = parse_version_stem(&entry.file_name().to_string_lossy()) {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Manifests of every published version, oldest first.
    ///
    /// An unreadable manifest is logged and left out rather than failing the
    /// whole listing; `get` on that number still reports the error.
    pub async fn versions(&self, id: &str) -> Result<Vec<VersionManifest>> {
        validate_section_id(id)?;
        let mut manifests = Vec::new();
        for number in self.published_numbers(id).await? {
            match self.manifest(id, number).await {
                Ok(Some(m)) => manifests.push(m),
                Ok(None) => {}
                Err(GrantOpsError::Json(e)) => {
                    tracing::warn!(section = %id, version = number, error = %e, "Skipping unreadable manifest");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(manifests)
    }

    /// Read one version, verifying its content against the recorded hash.
    pub async fn get(&self, id: &str, number: u32) -> Result<Version> {
        validate_section_id(id)?;
        let manifest =
            self.manifest(id, number)
                .await?
                .ok_or_else(|| GrantOpsError::VersionNotFound {
                    section: id.to_string(),
                    version: number,
                })?;
        let content_path = self
            .versions_dir(id)
            .join(format!("{}.md", version_stem(number)));
        let content = tokio::fs::read_to_string(&content_path).await?;
        if content_hash(&content) != manifest.content_hash {
            return Err(GrantOpsError::Other(format!(
                "content of {id}-v{number} does not match its recorded hash"
            )));
        }
        Ok(Version {
            section: id.to_string(),
            manifest,
            content,
        })
    }

    /// The version the section pointer references, if the section exists.
    pub async fn current(&self, id: &str) -> Result<Option<Version>> {
        match self.section(id).await? {
            Some(section) => Ok(Some(self.get(id, section.current_version).await?)),
            None => Ok(None),
        }
    }

    /// Read-only view for condition evaluation. Missing sections are not an error.
    pub async fn snapshot(&self, id: &str) -> Result<SectionSnapshot> {
        let Some(section) = self.section(id).await? else {
            return Ok(SectionSnapshot::missing(id));
        };
        let word_count = self
            .manifest(id, section.current_version)
            .await?
            .map(|m| m.word_count)
            .unwrap_or(0);
        Ok(SectionSnapshot {
            id: section.id,
            exists: true,
            status: section.status,
            current_version: section.current_version,
            word_count,
        })
    }

    /// Line-level diff between two versions of a section.
    pub async fn diff(&self, id: &str, from: u32, to: u32) -> Result<SectionDiff> {
        let old = self.get(id, from).await?;
        let new = self.get(id, to).await?;
        let (added, removed, text) = diff_lines(&old.content, &new.content);
        Ok(SectionDiff {
            section: id.to_string(),
            from,
            to,
            added,
            removed,
            text,
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Append a new version with `content` and advance the section pointer.
    ///
    /// Locked sections are rejected with [`GrantOpsError::SectionLocked`]
    /// before anything is written.
    pub async fn commit(
        &self,
        id: &str,
        content: &str,
        producing_step: Option<&str>,
    ) -> Result<Version> {
        validate_section_id(id)?;
        let _guard = self.lock_writer(id).await?;
        self.commit_locked(id, content, producing_step, None).await
    }

    /// Append a copy of version `number` as a new version.
    ///
    /// History is never rewritten: the restored content becomes the next
    /// version and records which version it came from.
    pub async fn restore(&self, id: &str, number: u32) -> Result<Version> {
        validate_section_id(id)?;
        let _guard = self.lock_writer(id).await?;
        let source = self.get(id, number).await?;
        let version = self
            .commit_locked(id, &source.content, None, Some(number))
            .await?;
        tracing::info!(
            section = %id,
            restored_from = number,
            version = version.number(),
            "Section restored"
        );
        Ok(version)
    }

    /// Move a section through draft/review/final/locked.
    pub async fn set_status(&self, id: &str, status: SectionStatus) -> Result<Section> {
        validate_section_id(id)?;
        let _guard = self.lock_writer(id).await?;
        let mut section = self.require_section(id).await?;
        let previous = section.status;
        section.status = status;
        section.updated_at = Utc::now();
        write_atomic(&self.section_path(id), &serde_json::to_vec_pretty(&section)?).await?;
        tracing::info!(section = %id, from = %previous, to = %status, "Section status changed");
        Ok(section)
    }

    async fn commit_locked(
        &self,
        id: &str,
        content: &str,
        producing_step: Option<&str>,
        restored_from: Option<u32>,
    ) -> Result<Version> {
        let existing = self.section(id).await?;
        if existing.as_ref().map(|s| s.status) == Some(SectionStatus::Locked) {
            return Err(GrantOpsError::SectionLocked {
                section: id.to_string(),
            });
        }

        // A manifest published by a commit that crashed before moving the
        // pointer still owns its number.
        let highest = self.published_numbers(id).await?.last().copied().unwrap_or(0);
        let current = existing.as_ref().map(|s| s.current_version).unwrap_or(0);
        let number = highest.max(current) + 1;
        let now = Utc::now();

        let manifest = VersionManifest {
            number,
            timestamp: now,
            producing_step: producing_step.map(String::from),
            content_hash: content_hash(content),
            parent: (current > 0).then_some(current),
            restored_from,
            word_count: word_count(content),
        };

        let versions_dir = self.versions_dir(id);
        let stem = version_stem(number);
        // The manifest marks a version as published. Content without one was
        // left by a crashed commit and is replaced; published files are only
        // ever created, never overwritten.
        let content_path = versions_dir.join(format!("{stem}.md"));
        match tokio::fs::remove_file(&content_path).await {
            Ok(()) => tracing::warn!(section = %id, version = number, "Discarded unpublished content"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GrantOpsError::storage(&content_path, e)),
        }
        write_new(&content_path, content.as_bytes()).await?;
        write_new(
            &versions_dir.join(format!("{stem}.json")),
            &serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;

        let section = match existing {
            Some(mut section) => {
                section.current_version = number;
                section.updated_at = now;
                section
            }
            None => Section {
                id: id.to_string(),
                status: SectionStatus::Draft,
                current_version: number,
                created_at: now,
                updated_at: now,
            },
        };
        write_atomic(&self.section_path(id), &serde_json::to_vec_pretty(&section)?).await?;

        let short_hash = &manifest.content_hash[..12];
        tracing::info!(
            section = %id,
            version = number,
            step = producing_step.unwrap_or("-"),
            hash = %short_hash,
            "Version committed"
        );
        Ok(Version {
            section: id.to_string(),
            manifest,
            content: content.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, VersionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(dir.path().join("sections"));
        (dir, store)
    }

    #[tokio::test]
    async fn first_commit_creates_section_at_version_one() {
        let (_dir, store) = store();
        let v = store
            .commit("narrative", "# Narrative\n", Some("draft_narrative"))
            .await
            .unwrap();

        assert_eq!(v.number(), 1);
        assert_eq!(v.manifest.parent, None);
        assert_eq!(v.label(), "narrative-v1");

        let section = store.section("narrative").await.unwrap().unwrap();
        assert_eq!(section.current_version, 1);
        assert_eq!(section.status, SectionStatus::Draft);
    }

    #[tokio::test]
    async fn numbers_increase_without_gaps_and_link_parents() {
        let (_dir, store) = store();
        for i in 1..=4 {
            let v = store
                .commit("budget", &format!("rev {i}\n"), Some("draft"))
                .await
                .unwrap();
            assert_eq!(v.number(), i);
        }
        let manifests = store.versions("budget").await.unwrap();
        let numbers: Vec<_> = manifests.iter().map(|m| m.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(manifests[3].parent, Some(3));
    }

    #[tokio::test]
    async fn locked_section_rejects_commit_without_mutation() {
        let (_dir, store) = store();
        store.commit("summary", "v1\n", None).await.unwrap();
        store.set_status("summary", SectionStatus::Locked).await.unwrap();

        let err = store.commit("summary", "v2\n", None).await.unwrap_err();
        assert!(matches!(err, GrantOpsError::SectionLocked { .. }));
        assert!(err.is_conflict());

        assert_eq!(store.versions("summary").await.unwrap().len(), 1);
        let section = store.section("summary").await.unwrap().unwrap();
        assert_eq!(section.current_version, 1);

        let err = store.restore("summary", 1).await.unwrap_err();
        assert!(matches!(err, GrantOpsError::SectionLocked { .. }));
    }

    #[tokio::test]
    async fn unlock_allows_commits_again() {
        let (_dir, store) = store();
        store.commit("summary", "v1\n", None).await.unwrap();
        store.set_status("summary", SectionStatus::Locked).await.unwrap();
        store.set_status("summary", SectionStatus::Draft).await.unwrap();
        assert_eq!(store.commit("summary", "v2\n", None).await.unwrap().number(), 2);
    }

    #[tokio::test]
    async fn restore_appends_copy_and_keeps_original() {
        let (_dir, store) = store();
        store.commit("aims", "original aims\n", Some("draft")).await.unwrap();
        store.commit("aims", "revised aims\n", Some("draft")).await.unwrap();

        let restored = store.restore("aims", 1).await.unwrap();
        assert_eq!(restored.number(), 3);
        assert_eq!(restored.content, "original aims\n");
        assert_eq!(restored.manifest.restored_from, Some(1));
        assert_eq!(restored.manifest.parent, Some(2));

        store.commit("aims", "later edit\n", Some("draft")).await.unwrap();

        let v1 = store.get("aims", 1).await.unwrap();
        assert_eq!(v1.content, "original aims\n");
        assert_eq!(store.versions("aims").await.unwrap().len(), 4);
        assert_eq!(
            store.current("aims").await.unwrap().unwrap().content,
            "later edit\n"
        );
    }

    #[tokio::test]
    async fn restore_of_unknown_version_is_not_found() {
        let (_dir, store) = store();
        store.commit("aims", "x\n", None).await.unwrap();
        let err = store.restore("aims", 9).await.unwrap_err();
        assert!(matches!(err, GrantOpsError::VersionNotFound { version: 9, .. }));
    }

    #[tokio::test]
    async fn concurrent_commits_form_a_total_order() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .commit("shared", &format!("writer {i}\n"), Some("parallel"))
                    .await
                    .unwrap()
                    .number()
            }));
        }
        let mut numbers = Vec::new();
        for h in handles {
            numbers.push(h.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=8).collect::<Vec<_>>());

        let manifests = store.versions("shared").await.unwrap();
        for pair in manifests.windows(2) {
            assert_eq!(pair[1].parent, Some(pair[0].number));
        }
    }

    #[tokio::test]
    async fn diff_reports_line_changes() {
        let (_dir, store) = store();
        store.commit("plan", "a\nb\n", None).await.unwrap();
        store.commit("plan", "a\nc\n", None).await.unwrap();

        let diff = store.diff("plan", 1, 2).await.unwrap();
        assert_eq!(diff.added, 1);
        assert_eq!(diff.removed, 1);
        assert!(diff.to_string().contains("+++ plan-v2"));
        assert!(store.diff("plan", 1, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_of_missing_section() {
        let (_dir, store) = store();
        let snap = store.snapshot("nothing_yet").await.unwrap();
        assert!(!snap.exists);
        assert_eq!(snap.current_version, 0);

        store.commit("nothing_yet", "three small words", None).await.unwrap();
        let snap = store.snapshot("nothing_yet").await.unwrap();
        assert!(snap.exists);
        assert_eq!(snap.current_version, 1);
        assert_eq!(snap.word_count, 3);
    }

    #[tokio::test]
    async fn invalid_ids_are_rejected() {
        let (_dir, store) = store();
        for bad in ["../escape", "all", "", "with space"] {
            let err = store.commit(bad, "x", None).await.unwrap_err();
            assert!(matches!(err, GrantOpsError::InvalidSectionId { .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn tampered_content_is_detected() {
        let (_dir, store) = store();
        store.commit("budget", "honest\n", None).await.unwrap();
        let path = store.versions_dir("budget").join("v0001.md");
        tokio::fs::write(&path, "tampered\n").await.unwrap();
        assert!(store.get("budget", 1).await.is_err());
    }

    #[tokio::test]
    async fn orphaned_manifest_keeps_its_number() {
        let (_dir, store) = store();
        store.commit("budget", "v1\n", None).await.unwrap();

        // Simulate a crash after publishing v2 but before moving the pointer.
        let orphan = VersionManifest {
            number: 2,
            timestamp: Utc::now(),
            producing_step: None,
            content_hash: content_hash("v2\n"),
            parent: Some(1),
            restored_from: None,
            word_count: 1,
        };
        let dir = store.versions_dir("budget");
        tokio::fs::write(dir.join("v0002.md"), "v2\n").await.unwrap();
        tokio::fs::write(dir.join("v0002.json"), serde_json::to_vec(&orphan).unwrap())
            .await
            .unwrap();

        let v = store.commit("budget", "v3\n", None).await.unwrap();
        assert_eq!(v.number(), 3);
        assert_eq!(v.manifest.parent, Some(1));
    }

    #[tokio::test]
    async fn unpublished_content_is_replaced_by_next_commit() {
        let (_dir, store) = store();
        store.commit("budget", "v1\n", None).await.unwrap();
        let dir = store.versions_dir("budget");
        tokio::fs::write(dir.join("v0002.md"), "half writt").await.unwrap();

        let v = store.commit("budget", "v2\n", None).await.unwrap();
        assert_eq!(v.number(), 2);
        assert_eq!(store.get("budget", 2).await.unwrap().content, "v2\n");
    }

    #[tokio::test]
    async fn torn_manifest_is_skipped_and_its_number_kept() {
        let (_dir, store) = store();
        store.commit("budget", "v1\n", None).await.unwrap();
        let dir = store.versions_dir("budget");
        tokio::fs::write(dir.join("v0002.md"), "v2\n").await.unwrap();
        tokio::fs::write(dir.join("v0002.json"), "").await.unwrap();

        let numbers: Vec<_> = store
            .versions("budget")
            .await
            .unwrap()
            .iter()
            .map(|m| m.number)
            .collect();
        assert_eq!(numbers, vec![1]);
        assert!(store.get("budget", 2).await.is_err());

        let v = store.commit("budget", "v3\n", None).await.unwrap();
        assert_eq!(v.number(), 3);
        assert_eq!(store.versions("budget").await.unwrap().len(), 2);
        assert_eq!(store.current("budget").await.unwrap().unwrap().content, "v3\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn separate_stores_on_one_root_never_reuse_a_number() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("sections");
        VersionStore::new(&root).commit("aims", "seed\n", None).await.unwrap();

        let a = Arc::new(VersionStore::new(&root));
        let b = Arc::new(VersionStore::new(&root));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..6 {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            tasks.spawn(async move {
                if i % 3 == 0 {
                    store.restore("aims", 1).await
                } else {
                    store.commit("aims", &format!("writer {i}\n"), None).await
                }
            });
        }
        let mut published = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            published.push(joined.unwrap().unwrap());
        }

        let numbers: Vec<_> = a.versions("aims").await.unwrap().iter().map(|m| m.number).collect();
        assert_eq!(numbers, (1..=7).collect::<Vec<_>>());
        for v in published {
            assert_eq!(a.get("aims", v.number()).await.unwrap().content, v.content);
        }
        assert!(root.join(".locks").join("aims.lock").exists());
        let ids: Vec<_> = a.list_sections().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["aims"]);
    }

    #[tokio::test]
    async fn list_sections_sorted() {
        let (_dir, store) = store();
        assert!(store.list_sections().await.unwrap().is_empty());
        store.commit("zeta", "z", None).await.unwrap();
        store.commit("alpha", "a", None).await.unwrap();
        let ids: Vec<_> = store
            .list_sections()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn set_status_requires_existing_section() {
        let (_dir, store) = store();
        let err = store
            .set_status("ghost", SectionStatus::Review)
            .await
            .unwrap_err();
        assert!(matches!(err, GrantOpsError::SectionNotFound { .. }));
    }
}
