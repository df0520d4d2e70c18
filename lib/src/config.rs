use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Raw profiles to convert.
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub worker_threads: WorkerThreads,
    /// The maximum number of profiles held in memory and converted at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub output: Output,
}

#[derive(Copy, Clone, Debug, Default, Deserialize)]
pub enum WorkerThreads {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(untagged)]
    Exact(usize),
}

fn default_concurrency() -> usize {
    4
}

fn default_suffix() -> String {
    ".processed.json".into()
}

#[derive(Clone, Debug, Deserialize)]
pub struct Output {
    /// When set, every processed profile is written to its own file in this directory.
    /// Otherwise all profiles are written as JSON lines.
    pub directory: Option<PathBuf>,
    #[serde(default = "default_suffix")]
    pub suffix: String,
    #[serde(default)]
    pub pretty: bool,
}

impl Default for Output {
    fn default() -> Self {
        Output {
            directory: None,
            suffix: default_suffix(),
            pretty: false,
        }
    }
}

impl Output {
    /// The file a processed profile converted from `input` is written to, if writing to a
    /// directory.
    ///
    /// The input's extension is replaced by the suffix (`profile.json` becomes
    /// `profile.processed.json`).
    pub fn path_for(&self, input: &Path) -> Option<PathBuf> {
        let directory = self.directory.as_ref()?;
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "profile".to_owned());
        Some(directory.join(format!("{stem}{}", self.suffix)))
    }

    /// Like [`path_for`](Self::path_for), but never returns a path already in `taken`.
    ///
    /// Inputs sharing a file stem (`a/profile.json` and `b/profile.json`) would write the same
    /// file; later ones get a numbered name (`profile-1.processed.json`) instead.
    pub fn unique_path_for(&self, input: &Path, taken: &mut HashSet<PathBuf>) -> Option<PathBuf> {
        let path = self.path_for(input)?;
        if taken.insert(path.clone()) {
            return Some(path);
        }
        let directory = self.directory.as_ref()?;
        let stem = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = stem.strip_suffix(self.suffix.as_str()).unwrap_or(&stem).to_owned();
        let unique = (1..)
            .map(|n| directory.join(format!("{stem}-{n}{}", self.suffix)))
            .find(|candidate| !taken.contains(candidate))?;
        log::warn!(
            "{} would overwrite {}; writing {} instead",
            input.display(),
            path.display(),
            unique.display()
        );
        taken.insert(unique.clone());
        Some(unique)
    }
}
