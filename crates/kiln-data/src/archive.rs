use std::io::{Cursor, Write};
use std::path::Path;

use kiln_types::{KilnError, KilnResult};
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Zip every file under `root` into an in-memory archive.
///
/// Entry names are paths relative to `root` with `/` separators. Symlinks are
/// followed, so a linked file is stored under the link's name. Entries follow
/// directory traversal order, which is not sorted.
pub fn package_outputs<P: AsRef<Path>>(root: P) -> KilnResult<Vec<u8>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(KilnError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("results directory not found: {}", root.display()),
        )));
    }

    let mut buffer = Cursor::new(Vec::new());
    let mut entries = 0usize;
    {
        let mut zip = ZipWriter::new(&mut buffer);
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for entry in WalkDir::new(root).min_depth(1).follow_links(true) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }

            let name = archive_name(root, entry.path())?;
            zip.start_file(name, options).map_err(archive_error)?;
            let mut file = std::fs::File::open(entry.path())?;
            std::io::copy(&mut file, &mut zip)?;
            entries += 1;
        }

        zip.finish().map_err(archive_error)?;
    }
    buffer.flush()?;

    debug!("Packaged {} files from {}", entries, root.display());
    Ok(buffer.into_inner())
}

fn archive_name(root: &Path, path: &Path) -> KilnResult<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|e| KilnError::Archive(e.to_string()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn archive_error(error: zip::result::ZipError) -> KilnError {
    KilnError::Archive(error.to_string())
}
