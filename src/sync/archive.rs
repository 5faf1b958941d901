//! Packaging of changed test files for transfer.
//!
//! The device-side helper (`drtunzip`) expands a zip archive into its working
//! directory, so entries are named by their path relative to the test root.

use std::fs::File;
use std::io;
use std::path::Path;

use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use super::engine::PlannedFile;

/// Name of the archive on both host and device.
pub const ARCHIVE_NAME: &str = "rlt-files.zip";

/// Write `files` into a deflated zip at `dest`. Returns the archive size.
pub fn build_archive(dest: &Path, files: &[PlannedFile]) -> Result<u64, ArchiveError> {
    let out = File::create(dest)?;
    let mut zip = zip::ZipWriter::new(out);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for file in files {
        zip.start_file(file.relative_path.as_str(), options)?;
        let mut input = File::open(&file.host_path)?;
        io::copy(&mut input, &mut zip)?;
    }

    zip.finish()?;
    Ok(std::fs::metadata(dest)?.len())
}

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}
