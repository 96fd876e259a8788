//! Dataset source reading an evaluation set from the local filesystem.
//!
//! Layout: `<eval_dir>/<eval_set>/<input_dir>/<file>`. Every input
//! directory feeds the workflow node titled `Load <input_dir> Image`, and
//! each file name present in all directories forms one record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pixaris_core::dataset::DatasetSource;
use pixaris_core::error::CoreError;
use pixaris_core::types::{DatasetRecord, InputArtifact};

/// Reads `<eval_dir>/<eval_set>`.
#[derive(Debug, Clone)]
pub struct LocalDatasetSource {
    root: PathBuf,
}

impl LocalDatasetSource {
    pub fn new(eval_dir: impl AsRef<Path>, eval_set: &str) -> Self {
        Self {
            root: eval_dir.as_ref().join(eval_set),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Workflow node an input directory is bound to.
pub fn target_for_dir(dir_name: &str) -> String {
    format!("Load {dir_name} Image")
}

#[async_trait]
impl DatasetSource for LocalDatasetSource {
    async fn load_dataset(&self) -> Result<Vec<DatasetRecord>, CoreError> {
        let input_dirs = list_sorted(&self.root, EntryKind::Dir).await?;
        let Some((first_dir, other_dirs)) = input_dirs.split_first() else {
            return Err(CoreError::Validation(format!(
                "Evaluation set {} has no input directories",
                self.root.display()
            )));
        };

        let file_names = list_sorted(&self.root.join(first_dir), EntryKind::File).await?;
        for dir in other_dirs {
            let names = list_sorted(&self.root.join(dir), EntryKind::File).await?;
            if names != file_names {
                return Err(CoreError::Validation(format!(
                    "The file names in each input directory must be the same: {first_dir} does not match {dir}"
                )));
            }
        }

        let records = file_names
            .iter()
            .map(|file| {
                DatasetRecord::new(
                    input_dirs
                        .iter()
                        .map(|dir| InputArtifact::new(target_for_dir(dir), self.root.join(dir).join(file)))
                        .collect(),
                )
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            root = %self.root.display(),
            inputs = input_dirs.len(),
            records = records.len(),
            "Dataset loaded",
        );
        Ok(records)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
}

/// Names of the non-hidden entries of `kind` in `dir`, sorted.
async fn list_sorted(dir: &Path, kind: EntryKind) -> Result<Vec<String>, CoreError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CoreError::Io(format!("cannot list {}: {e}", dir.display())))?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        let matches = match kind {
            EntryKind::Dir => file_type.is_dir(),
            EntryKind::File => file_type.is_file(),
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if matches && !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
