//! Checkpoint naming.
//!
//! Every persisted model file is named
//! `<artifact>_<dataset>_split_<i>_<tag>.<ext>`, or
//! `<artifact>_<dataset>_full_<tag>.<ext>` for models trained on the whole
//! dataset. Fields are validated at construction so a name can never contain
//! a path separator or an extra `_`, which keeps [`ArtifactName::parse`] an
//! exact inverse of rendering.
//!
//! ```rust
//! use deup_train::artifact::ArtifactName;
//!
//! let name = ArtifactName::new("mafmog", "cifar", 2, "new", "ot").unwrap();
//! assert_eq!(name.to_string(), "mafmog_cifar_split_2_new.ot");
//! assert_eq!(ArtifactName::parse("mafmog_cifar_split_2_new.ot").unwrap(), name);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ArtifactError;

/// Validated checkpoint file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactName {
    artifact: String,
    dataset: String,
    split: Option<usize>,
    tag: String,
    ext: String,
}

impl ArtifactName {
    /// Name for an artifact trained on split `split`.
    pub fn new(artifact: &str, dataset: &str, split: usize, tag: &str, ext: &str) -> Result<Self, ArtifactError> {
        Self::build(artifact, dataset, Some(split), tag, ext)
    }

    /// Name for an artifact trained on the full dataset.
    pub fn full(artifact: &str, dataset: &str, tag: &str, ext: &str) -> Result<Self, ArtifactError> {
        Self::build(artifact, dataset, None, tag, ext)
    }

    fn build(artifact: &str, dataset: &str, split: Option<usize>, tag: &str, ext: &str) -> Result<Self, ArtifactError> {
        check_field("artifact", artifact, true)?;
        check_field("dataset", dataset, true)?;
        check_field("tag", tag, true)?;
        check_field("ext", ext, false)?;
        Ok(ArtifactName {
            artifact: artifact.to_string(),
            dataset: dataset.to_string(),
            split,
            tag: tag.to_string(),
            ext: ext.to_string(),
        })
    }

    /// Parse a rendered file name.
    pub fn parse(name: &str) -> Result<Self, ArtifactError> {
        let malformed = |reason: &str| ArtifactError::Malformed { name: name.to_string(), reason: reason.to_string() };

        let (stem, ext) = name.rsplit_once('.').ok_or_else(|| malformed("missing extension"))?;
        let parts: Vec<&str> = stem.split('_').collect();
        match parts.as_slice() {
            [artifact, dataset, "split", idx, tag] => {
                let split = idx.parse::<usize>().map_err(|_| malformed("split index is not a number"))?;
                Self::new(artifact, dataset, split, tag, ext)
            }
            [artifact, dataset, "full", tag] => Self::full(artifact, dataset, tag, ext),
            _ => Err(malformed("expected <artifact>_<dataset>_split_<i>_<tag> or <artifact>_<dataset>_full_<tag>")),
        }
    }

    /// Join the file name onto `base`.
    pub fn path_in(&self, base: &Path) -> PathBuf {
        base.join(self.to_string())
    }

    /// Artifact kind, e.g. `"resnet18"`.
    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    /// Dataset name.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Split index, `None` for full-dataset artifacts.
    pub fn split(&self) -> Option<usize> {
        self.split
    }

    /// Run tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// File extension without the dot.
    pub fn ext(&self) -> &str {
        &self.ext
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.split {
            Some(i) => write!(f, "{}_{}_split_{}_{}.{}", self.artifact, self.dataset, i, self.tag, self.ext),
            None => write!(f, "{}_{}_full_{}.{}", self.artifact, self.dataset, self.tag, self.ext),
        }
    }
}

fn check_field(field: &'static str, value: &str, allow_dash: bool) -> Result<(), ArtifactError> {
    if value.is_empty() {
        return Err(ArtifactError::EmptyField { field });
    }
    if let Some(ch) = value.chars().find(|&c| !(c.is_ascii_alphanumeric() || (allow_dash && c == '-'))) {
        return Err(ArtifactError::InvalidCharacter { field, value: value.to_string(), ch });
    }
    Ok(())
}
