use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::io::Write;
use std::path::{Component as PathComponent, Path, PathBuf};

use tempfile::NamedTempFile;

use super::{ArtifactStore, BuildSelector};
use crate::error::{Result, TeciError};

const LAST_SUCCESSFUL: &str = "lastSuccessful";

/// Filesystem-backed artifact store.
///
/// Layout: `<root>/<job>/builds/<build>/<workspace-relative path>`, with
/// `<root>/<job>/lastSuccessful` holding the number of the last successful
/// build.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`. Creates `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn job_dir(&self, job: &str) -> PathBuf {
        self.root.join(job)
    }

    fn build_dir(&self, job: &str, build: u64) -> PathBuf {
        self.job_dir(job).join("builds").join(build.to_string())
    }

    /// One more than the highest build number archived for `job`, or 1.
    pub fn next_build(&self, job: &str) -> Result<u64> {
        let builds = self.job_dir(job).join("builds");
        let entries = match fs::read_dir(&builds) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
            Err(e) => return Err(e.into()),
        };
        let mut highest = 0;
        for entry in entries {
            let entry = entry?;
            if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
                highest = highest.max(n);
            }
        }
        Ok(highest + 1)
    }

    fn last_successful(&self, job: &str) -> Result<Option<u64>> {
        let path = self.job_dir(job).join(LAST_SUCCESSFUL);
        match fs::read_to_string(&path) {
            Ok(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| TeciError::Artifact(format!("corrupt {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn archive(
        &self,
        job: &str,
        build: u64,
        workspace: &Path,
        patterns: &[String],
    ) -> Result<Vec<String>> {
        let dest = self.build_dir(job, build);
        let workspace = workspace.to_path_buf();
        let patterns = patterns.to_vec();

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let matches = collect_matches(&workspace, &patterns)?;
            for rel in &matches {
                let target = dest.join(rel);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(workspace.join(rel), &target)?;
            }
            Ok(matches
                .iter()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .collect())
        })
        .await
        .map_err(|e| TeciError::Artifact(format!("archive task failed: {e}")))?
    }

    async fn fetch(&self, job: &str, path: &str, selector: BuildSelector) -> Result<Vec<u8>> {
        let not_found = || TeciError::ArtifactNotFound {
            job: job.to_string(),
            path: path.to_string(),
        };

        let rel = Path::new(path);
        if rel
            .components()
            .any(|c| !matches!(c, PathComponent::Normal(_)))
        {
            return Err(TeciError::Artifact(format!("invalid artifact path: {path}")));
        }

        let build = match selector {
            BuildSelector::Build(n) => n,
            BuildSelector::LastSuccessful => self.last_successful(job)?.ok_or_else(not_found)?,
        };

        let file = self.build_dir(job, build).join(rel);
        tokio::fs::read(&file).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                not_found()
            } else {
                TeciError::Io(e)
            }
        })
    }

    async fn mark_successful(&self, job: &str, build: u64) -> Result<()> {
        let job_dir = self.job_dir(job);
        fs::create_dir_all(&job_dir)?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&job_dir)?;
        tmp.write_all(build.to_string().as_bytes())?;
        tmp.persist(job_dir.join(LAST_SUCCESSFUL))
            .map_err(|e| e.error)?;
        Ok(())
    }
}

/// Workspace-relative paths of regular files matching any of `patterns`,
/// sorted.
pub(crate) fn collect_matches(workspace: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let set = build_globset(patterns)?;
    let mut out = Vec::new();
    walk(workspace, workspace, &set, &mut out)?;
    out.sort();
    Ok(out)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| TeciError::Artifact(format!("bad pattern {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| TeciError::Artifact(format!("bad patterns: {e}")))
}

fn walk(root: &Path, dir: &Path, set: &GlobSet, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, set, out)?;
        } else if file_type.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                if set.is_match(rel) {
                    out.push(rel.to_path_buf());
                }
            }
        }
    }
    Ok(())
}
