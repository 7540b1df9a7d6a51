use crate::result::Result;
use anyhow::Context;
use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Manifest errors.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// A line could not be parsed.
    #[error("{path:?} line {line}: {reason}")]
    Malformed {
        /// The manifest.
        path: PathBuf,
        /// The line number, starting at 1.
        line: usize,
        /// What was wrong.
        reason: String,
    },
    /// A label was not less than the number of classes.
    #[error("{path:?} line {line}: label {label} out of range for {num_classes} classes")]
    Label {
        /// The manifest.
        path: PathBuf,
        /// The line number, starting at 1.
        line: usize,
        /// The label.
        label: u32,
        /// The number of classes.
        num_classes: usize,
    },
}

/// An entry in a [`Manifest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestEntry {
    /// Path of the clip, relative to the clips directory.
    pub path: String,
    /// The number of frames, if listed.
    pub frames: Option<usize>,
    /// The class, 0 = truthful, 1 = deceptive.
    pub label: u32,
}

impl Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.path)?;
        if let Some(frames) = self.frames {
            write!(f, " {frames}")?;
        }
        write!(f, " {}", self.label)
    }
}

/// An ordered list of clips and labels.
///
/// One entry per line, whitespace separated: `path [frames] label`. Blank lines are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Creates a manifest from `entries`.
    pub fn from_entries(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }
    /// Reads and parses the manifest at `path`.
    ///
    /// **Errors**
    /// - The file could not be read.
    /// - A line is malformed or a label is not less than `num_classes`.
    pub fn from_path(path: &Path, num_classes: usize) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {path:?}!"))?;
        Ok(Self::parse(&text, path, num_classes)?)
    }
    /// Parses `text`. `path` is used for errors.
    pub fn parse(text: &str, path: &Path, num_classes: usize) -> Result<Self, ManifestError> {
        let mut entries = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line_number = i + 1;
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let malformed = |reason: String| ManifestError::Malformed {
                path: path.to_owned(),
                line: line_number,
                reason,
            };
            let (clip, frames, label) = match tokens.as_slice() {
                [] => continue,
                [clip, label] => (*clip, None, *label),
                [clip, frames, label] => {
                    let frames = frames
                        .parse::<usize>()
                        .map_err(|_| malformed(format!("invalid frame count {frames:?}")))?;
                    (*clip, Some(frames), *label)
                }
                _ => {
                    return Err(malformed(format!(
                        "expected `path [frames] label`, found {} fields",
                        tokens.len()
                    )))
                }
            };
            let label = label
                .parse::<u32>()
                .map_err(|_| malformed(format!("invalid label {label:?}")))?;
            if label as usize >= num_classes {
                return Err(ManifestError::Label {
                    path: path.to_owned(),
                    line: line_number,
                    label,
                    num_classes,
                });
            }
            entries.push(ManifestEntry {
                path: clip.to_string(),
                frames,
                label,
            });
        }
        Ok(Self { entries })
    }
    /// The entries.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }
    /// The number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// The labels, in order.
    pub fn labels(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|entry| entry.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_and_without_frames() {
        let text = "trial_lie_001.mp4 120 1\n\ntrial_truth_002.mp4 0\n";
        let manifest = Manifest::parse(text, Path::new("fold.txt"), 2).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(
            manifest.entries()[0],
            ManifestEntry {
                path: "trial_lie_001.mp4".into(),
                frames: Some(120),
                label: 1,
            }
        );
        assert_eq!(manifest.entries()[1].frames, None);
        assert_eq!(manifest.labels().collect::<Vec<_>>(), [1, 0]);
    }

    #[test]
    fn parse_rejects_bad_label() {
        let err = Manifest::parse("a.mp4 10 2\n", Path::new("fold.txt"), 2).unwrap_err();
        assert!(matches!(err, ManifestError::Label { line: 1, label: 2, .. }));
        let err = Manifest::parse("a.mp4 x\n", Path::new("fold.txt"), 2).unwrap_err();
        assert!(matches!(err, ManifestError::Malformed { line: 1, .. }));
    }

    #[test]
    fn parse_rejects_extra_fields() {
        let err = Manifest::parse("ok.mp4 1\na b c d\n", Path::new("f.txt"), 2).unwrap_err();
        assert!(matches!(err, ManifestError::Malformed { line: 2, .. }));
    }

    #[test]
    fn missing_file() {
        assert!(Manifest::from_path(Path::new("does/not/exist.txt"), 2).is_err());
    }
}
