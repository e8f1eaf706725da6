use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path};

pub const LABEL_OTHER: usize = 0;
pub const LABEL_CAT: usize = 1;

/// Per-label loss multipliers, inversely proportional to class frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights {
    pub other: f64,
    pub cat: f64,
}

impl ClassWeights {
    /// Balanced weights: `total / (num_classes * count)` for each class.
    pub fn balanced(num_other: usize, num_cat: usize) -> Result<Self> {
        if num_other == 0 {
            bail!("class {LABEL_OTHER} (other) has no samples");
        }
        if num_cat == 0 {
            bail!("class {LABEL_CAT} (cat) has no samples");
        }
        let total = (num_other + num_cat) as f64;
        Ok(Self {
            other: total / (2.0 * num_other as f64),
            cat: total / (2.0 * num_cat as f64),
        })
    }

    /// Counts both class directories under `root` and derives weights over the
    /// whole dataset, independent of any train/validation split.
    pub fn from_directories(root: &Path, negative_dir: &str, positive_dir: &str) -> Result<Self> {
        let num_other = count_entries(&root.join(negative_dir))?;
        let num_cat = count_entries(&root.join(positive_dir))?;
        Self::balanced(num_other, num_cat).with_context(|| {
            format!(
                "cannot balance classes in {} ({negative_dir}: {num_other}, {positive_dir}: {num_cat})",
                root.display()
            )
        })
    }

    pub fn for_label(&self, label: usize) -> f64 {
        if label == LABEL_CAT {
            self.cat
        } else {
            self.other
        }
    }
}

impl fmt::Display for ClassWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{0: {:.4}, 1: {:.4}}}", self.other, self.cat)
    }
}

/// Raw directory listing size, every entry included.
fn count_entries(dir: &Path) -> Result<usize> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to list class directory {}", dir.display()))?;
    let mut count = 0;
    for entry in entries {
        entry.with_context(|| format!("Failed to read entry in {}", dir.display()))?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch_files(dir: &Path, n: usize) {
        fs::create_dir_all(dir).unwrap();
        for i in 0..n {
            fs::write(dir.join(format!("img_{i:03}.jpg")), b"").unwrap();
        }
    }

    #[test]
    fn contributions_are_balanced() {
        for (n0, n1) in [(1, 1), (7, 3), (250, 40), (13, 999)] {
            let w = ClassWeights::balanced(n0, n1).unwrap();
            let lhs = w.other * n0 as f64;
            let rhs = w.cat * n1 as f64;
            assert!((lhs - rhs).abs() < 1e-9, "{n0}/{n1}: {lhs} vs {rhs}");
        }
    }

    #[test]
    fn rarer_class_is_weighted_up() {
        let w = ClassWeights::balanced(100, 25).unwrap();
        assert!((w.cat / w.other - 4.0).abs() < 1e-9);
        assert!((w.other - 0.625).abs() < 1e-9);
        assert!((w.cat - 2.5).abs() < 1e-9);
        assert_eq!(w.for_label(LABEL_CAT), w.cat);
        assert_eq!(w.for_label(LABEL_OTHER), w.other);
    }

    #[test]
    fn counts_directory_listings() {
        let root = TempDir::new().unwrap();
        touch_files(&root.path().join("others"), 100);
        touch_files(&root.path().join("cats"), 25);

        let w = ClassWeights::from_directories(root.path(), "others", "cats").unwrap();
        assert!((w.cat / w.other - 4.0).abs() < 1e-9);
    }

    #[test]
    fn empty_class_is_an_error() {
        let root = TempDir::new().unwrap();
        touch_files(&root.path().join("others"), 4);
        touch_files(&root.path().join("cats"), 0);

        let err = ClassWeights::from_directories(root.path(), "others", "cats").unwrap_err();
        assert!(format!("{err:#}").contains("no samples"));
    }

    #[test]
    fn missing_class_directory_is_an_error() {
        let root = TempDir::new().unwrap();
        touch_files(&root.path().join("others"), 4);

        let err = ClassWeights::from_directories(root.path(), "others", "cats").unwrap_err();
        assert!(err.to_string().contains("cats"));
    }
}
