use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Dataset fetched when none is given on the command line.
pub const DEFAULT_DATASET: &str = "hf-internal-testing/librispeech_asr_dummy";

/// Resolves a dataset identifier to a directory holding a local copy of it.
///
/// Implementations own caching and versioning, callers only read the returned directory.
pub trait DatasetClient {
    fn dataset_download(&self, id: &str) -> Result<PathBuf>;
}

/// Fetches datasets from the Hugging Face hub into its local cache.
pub struct HubDatasetClient {
    api: Api,
}

impl HubDatasetClient {
    pub fn new(cache_dir: Option<PathBuf>, token: Option<String>) -> Result<Self> {
        let mut builder = ApiBuilder::new().with_progress(true);
        if let Some(cache_dir) = cache_dir {
            builder = builder.with_cache_dir(cache_dir);
        }
        if token.is_some() {
            builder = builder.with_token(token);
        }
        Ok(Self {
            api: builder.build()?,
        })
    }
}

impl DatasetClient for HubDatasetClient {
    #[tracing::instrument(level = "info", skip(self))]
    fn dataset_download(&self, id: &str) -> Result<PathBuf> {
        let repo = self.api.repo(Repo::new(id.to_string(), RepoType::Dataset));
        let info = repo
            .info()
            .with_context(|| format!("Failed to look up dataset {id}"))?;

        let mut root = None;
        for sibling in &info.siblings {
            let path = repo
                .get(&sibling.rfilename)
                .with_context(|| format!("Failed to fetch {} from {id}", sibling.rfilename))?;
            debug!(file = %sibling.rfilename, path = %path.display(), "dataset file cached");
            if root.is_none() {
                root = Some(snapshot_root(&path, &sibling.rfilename)?);
            }
        }
        let root = root.with_context(|| format!("Dataset {id} has no files"))?;
        info!(files = info.siblings.len(), root = %root.display(), "dataset ready");
        Ok(root)
    }
}

/// Strips the repository relative `file_name` off the cached `path` of that file.
fn snapshot_root(path: &Path, file_name: &str) -> Result<PathBuf> {
    let depth = Path::new(file_name).components().count();
    path.ancestors()
        .nth(depth)
        .map(Path::to_path_buf)
        .with_context(|| format!("{} is not inside a snapshot directory", path.display()))
}

/// Every non-directory entry below `root`, in walk order.
///
/// Symlinks count as files since cached snapshots link into a blob store.
pub fn list_dataset_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Downloads `id` through `client` and writes the dataset location and file listing to `out`.
pub fn fetch_and_list<C, W>(client: &C, id: &str, out: &mut W) -> Result<PathBuf>
where
    C: DatasetClient + ?Sized,
    W: Write,
{
    let path = client.dataset_download(id)?;
    writeln!(out, "Path to dataset files: {}", path.display())?;
    writeln!(out, "Files in the dataset directory:")?;
    for file in list_dataset_files(&path)? {
        writeln!(out, "{}", file.display())?;
    }
    Ok(path)
}
