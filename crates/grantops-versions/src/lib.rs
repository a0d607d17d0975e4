//! Append-only version history for generated sections.
//!
//! Every section owns a numbered sequence of immutable snapshots on disk.
//! [`VersionStore::commit`] appends, [`VersionStore::restore`] appends a copy of
//! an older snapshot, and nothing ever deletes or rewrites a published version.
//!
//! # Layout
//! ```text
//! <root>/<section>/section.json        current pointer + status
//! <root>/<section>/versions/v0001.md   snapshot content
//! <root>/<section>/versions/v0001.json manifest (publication point)
//! <root>/.locks/<section>.lock         cross-process writer lock
//! ```

pub mod atomic;
pub mod diff;
pub mod lock;
pub mod model;
pub mod store;

pub use atomic::{write_atomic, write_new};
pub use diff::{diff_lines, SectionDiff};
pub use lock::FileLock;
pub use model::{content_hash, word_count, Section, SectionSnapshot, Version, VersionManifest};
pub use store::{validate_section_id, VersionStore};
