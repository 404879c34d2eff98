//! # Bundler
//!
//! An app bundle is every file of the app's local working directory. Files are
//! collected recursively and keyed by their path inside the app namespace of
//! the repository, so that `~/.send/blog/docker-compose/web.yml` is published
//! as `blog/docker-compose/web.yml`.

use std::{
    fs, io,
    path::{Component, Path, StripPrefixError},
};

use derive_more::{Display, Error, From};
use indicatif::ProgressBar;
use store::records::BundleFile;
use walkdir::WalkDir;

/// Bundle collection errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum BundleError {
    /// [`walkdir`]-crate specific error.
    WalkDir(walkdir::Error),
    /// IO-related error.
    Io(io::Error),
    /// File path is outside of the collected directory.
    StripPrefix(StripPrefixError),
}

/// Collect every file under `directory` into a bundle for `app`.
pub(crate) fn collect_bundle(
    app: &str,
    directory: &Path,
    progress: &ProgressBar,
) -> Result<Vec<BundleFile>, BundleError> {
    let mut files = Vec::new();
    let mut entries = WalkDir::new(directory).sort_by_file_name().into_iter();

    while let Some(entry) = entries.next().transpose()? {
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(directory)?;

        let Some(path) = repository_path(relative) else {
            progress.println(format!(
                "File {} contains non-unicode symbols in path",
                entry.path().display()
            ));
            continue;
        };

        files.push(BundleFile {
            path: format!("{app}/{path}"),
            content: fs::read(entry.path())?,
        });
    }

    Ok(files)
}

/// Join path components with forward slashes, as the repository expects.
fn repository_path(relative: &Path) -> Option<String> {
    relative
        .components()
        .map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
        .map(|parts| parts.join("/"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use indicatif::ProgressBar;
    use tempfile::TempDir;

    use super::collect_bundle;

    #[test]
    fn nested_files_are_namespaced() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("docker-compose")).unwrap();
        fs::write(dir.path().join("hosts"), "[manager]\n10.0.0.1\n").unwrap();
        fs::write(dir.path().join(".env"), "A=1").unwrap();
        fs::write(dir.path().join("docker-compose/web.yml"), "web").unwrap();

        let files = collect_bundle("blog", dir.path(), &ProgressBar::hidden()).unwrap();
        let paths: Vec<_> = files.iter().map(|file| file.path.as_str()).collect();

        assert_eq!(
            paths,
            vec!["blog/.env", "blog/docker-compose/web.yml", "blog/hosts"]
        );
        assert_eq!(files[2].content, b"[manager]\n10.0.0.1\n");
    }

    #[test]
    fn empty_directory_yields_no_files() {
        let dir = TempDir::new().unwrap();

        assert!(collect_bundle("blog", dir.path(), &ProgressBar::hidden())
            .unwrap()
            .is_empty());
    }
}
