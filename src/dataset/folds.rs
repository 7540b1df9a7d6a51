use super::Manifest;
use crate::result::Result;
use anyhow::{bail, ensure, Context};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

/// The training and test manifests for one fold.
#[derive(Debug, Clone)]
pub struct FoldSplit {
    /// The index of the held out fold.
    pub index: usize,
    /// Every other fold.
    pub train: Manifest,
    /// The held out fold.
    pub test: Manifest,
}

/// Fold manifests on disk.
///
/// Fold `i` is read from `<root>/<prefix><i>.txt`. The training manifest for fold `i` is written to
/// `<root>/train_with_<prefix><i>_as_test.txt`.
#[derive(Debug, Clone)]
pub struct FoldFiles {
    root: PathBuf,
    prefix: String,
    count: usize,
    num_classes: usize,
}

impl FoldFiles {
    /// Creates a new [`FoldFiles`].
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>, count: usize) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
            count,
            num_classes: 2,
        }
    }
    /// The number of classes labels are checked against. Defaults to 2.
    pub fn num_classes(self, num_classes: usize) -> Self {
        Self {
            num_classes,
            ..self
        }
    }
    /// The manifest of fold `index`.
    pub fn fold_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("{}{index}.txt", self.prefix))
    }
    /// The assembled training manifest with fold `index` held out.
    pub fn train_path(&self, index: usize) -> PathBuf {
        self.root
            .join(format!("train_with_{}{index}_as_test.txt", self.prefix))
    }
    /// Writes the training manifest for fold `index`, concatenating every other fold file in order
    /// with a blank line after each.
    ///
    /// Returns the path of the training manifest.
    ///
    /// **Errors**
    /// - `index` is out of range.
    /// - A fold file could not be read, or the output could not be written.
    pub fn assemble_train(&self, index: usize) -> Result<PathBuf> {
        ensure!(
            index < self.count,
            "Fold {index} out of range for {} folds!",
            self.count
        );
        let mut text = String::new();
        for i in (0..self.count).filter(|i| *i != index) {
            let path = self.fold_path(i);
            let fold = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read fold {path:?}!"))?;
            text.push_str(&fold);
            text.push('\n');
        }
        let train_path = self.train_path(index);
        fs::write(&train_path, text)
            .with_context(|| format!("Failed to write {train_path:?}!"))?;
        Ok(train_path)
    }
    /// Loads the manifest of fold `index`.
    pub fn load_fold(&self, index: usize) -> Result<Manifest> {
        Manifest::from_path(&self.fold_path(index), self.num_classes)
    }
    /// Assembles and loads the split with fold `index` held out.
    ///
    /// **Errors**
    /// - See [`.assemble_train()`](Self::assemble_train).
    /// - A manifest is malformed.
    /// - A clip appears in both the training and test manifests.
    pub fn split(&self, index: usize) -> Result<FoldSplit> {
        let train_path = self.assemble_train(index)?;
        let train = Manifest::from_path(&train_path, self.num_classes)?;
        let test = self.load_fold(index)?;
        let test_paths: HashSet<&str> = test.entries().iter().map(|x| x.path.as_str()).collect();
        if let Some(entry) = train
            .entries()
            .iter()
            .find(|entry| test_paths.contains(entry.path.as_str()))
        {
            bail!(
                "Clip {:?} is in both the training and test manifests of fold {index}!",
                entry.path
            );
        }
        Ok(FoldSplit { index, train, test })
    }
    /// Checks that the folds partition the dataset, ie no clip is in more than one fold.
    ///
    /// Returns the union of the folds, in fold order.
    pub fn verify_partition(&self) -> Result<Manifest> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for i in 0..self.count {
            for entry in self.load_fold(i)?.entries() {
                if !seen.insert(entry.path.clone()) {
                    bail!("Clip {:?} appears in more than one fold!", entry.path);
                }
                entries.push(entry.clone());
            }
        }
        Ok(Manifest::from_entries(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn write_folds(root: &Path) -> FoldFiles {
        for i in 0..5 {
            let text = format!("clip_{i}_a.mp4 30 0\nclip_{i}_b.mp4 30 1\n");
            fs::write(root.join(format!("foldB_{i}.txt")), text).unwrap();
        }
        FoldFiles::new(root, "foldB_", 5)
    }

    #[test]
    fn assemble_train_separates_files() -> Result<()> {
        let dir = tempdir()?;
        let folds = write_folds(dir.path());
        let path = folds.assemble_train(0)?;
        assert_eq!(
            path.file_name().unwrap(),
            "train_with_foldB_0_as_test.txt"
        );
        let text = fs::read_to_string(path)?;
        assert!(text.starts_with("clip_1_a.mp4 30 0\nclip_1_b.mp4 30 1\n\nclip_2_a.mp4"));
        assert!(!text.contains("clip_0_"));
        Ok(())
    }

    #[test]
    fn folds_partition_dataset() -> Result<()> {
        let dir = tempdir()?;
        let folds = write_folds(dir.path());
        let all = folds.verify_partition()?;
        assert_eq!(all.len(), 10);
        for i in 0..5 {
            let split = folds.split(i)?;
            assert_eq!(split.test.len(), 2);
            assert_eq!(split.train.len(), 8);
            let others: BTreeSet<_> = (0..5)
                .filter(|j| *j != i)
                .flat_map(|j| folds.load_fold(j).unwrap().entries().to_vec())
                .map(|x| x.path)
                .collect();
            let train: BTreeSet<_> = split.train.entries().iter().map(|x| x.path.clone()).collect();
            assert_eq!(train, others);
        }
        Ok(())
    }

    #[test]
    fn duplicate_clip_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let folds = write_folds(dir.path());
        fs::write(dir.path().join("foldB_3.txt"), "clip_1_a.mp4 30 0\n")?;
        assert!(folds.verify_partition().is_err());
        assert!(folds.split(1).is_err());
        Ok(())
    }

    #[test]
    fn missing_fold_fails() -> Result<()> {
        let dir = tempdir()?;
        let folds = write_folds(dir.path());
        fs::remove_file(folds.fold_path(4))?;
        assert!(folds.split(0).is_err());
        assert!(folds.split(5).is_err());
        Ok(())
    }
}
