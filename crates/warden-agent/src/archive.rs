use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use zip::write::SimpleFileOptions;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("refusing to extract entry outside the destination: {0:?}")]
    UnsafeEntry(String),
}

/// Zips `sources` into `out`. A file is stored under its base name, a folder
/// under its base name with its tree beneath it. Missing sources are skipped.
pub fn zip_paths(sources: &[PathBuf], out: &Path) -> Result<usize, ArchiveError> {
    if let Some(parent) = out.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(out)?;
    let mut writer = zip::ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut entries = 0usize;
    for source in sources {
        let Some(base) = source.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if source.is_file() {
            writer.start_file(base, options)?;
            io::copy(&mut fs::File::open(source)?, &mut writer)?;
            entries += 1;
        } else if source.is_dir() {
            entries += add_dir(&mut writer, source, base, options)?;
        } else {
            tracing::warn!(path = %source.display(), "archive source does not exist; skipping");
        }
    }

    writer.finish()?;
    Ok(entries)
}

fn add_dir(
    writer: &mut zip::ZipWriter<fs::File>,
    dir: &Path,
    prefix: &str,
    options: SimpleFileOptions,
) -> Result<usize, ArchiveError> {
    writer.add_directory(format!("{prefix}/"), options)?;
    let mut entries = 1usize;

    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|e| e.file_name());
    for child in children {
        let path = child.path();
        let name = child.file_name().to_string_lossy().into_owned();
        let entry = format!("{prefix}/{name}");
        let meta = fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            entries += add_dir(writer, &path, &entry, options)?;
        } else {
            writer.start_file(entry, options)?;
            io::copy(&mut fs::File::open(&path)?, writer)?;
            entries += 1;
        }
    }
    Ok(entries)
}

/// Opens `zip_path` and checks every entry stays inside the extraction root.
pub fn check_zip(zip_path: &Path) -> Result<usize, ArchiveError> {
    let mut archive = zip::ZipArchive::new(fs::File::open(zip_path)?)?;
    for i in 0..archive.len() {
        let file = archive.by_index(i)?;
        if file.enclosed_name().is_none() {
            return Err(ArchiveError::UnsafeEntry(file.name().to_string()));
        }
    }
    Ok(archive.len())
}

/// Extracts `zip_path` over `out_dir`, overwriting existing files. Returns
/// the written top-level paths.
pub fn extract_zip(zip_path: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    fs::create_dir_all(out_dir)?;
    let f = fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(f)?;

    let mut roots = Vec::<PathBuf>::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let rel = file
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafeEntry(file.name().to_string()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        if let Some(first) = rel.components().next() {
            let root = out_dir.join(first);
            if !roots.contains(&root) {
                roots.push(root);
            }
        }

        let out_path = out_dir.join(&rel);
        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut file, &mut out)?;
    }
    Ok(roots)
}

/// Removes files and folders, logging what happened to each.
pub fn remove_paths(paths: &[PathBuf]) {
    for p in paths {
        let res = if p.is_dir() {
            fs::remove_dir_all(p)
        } else if p.exists() {
            fs::remove_file(p)
        } else {
            tracing::debug!(path = %p.display(), "nothing to remove");
            continue;
        };
        match res {
            Ok(()) => tracing::info!(path = %p.display(), "removed"),
            Err(e) => tracing::warn!(path = %p.display(), error = %e, "remove failed"),
        }
    }
}
