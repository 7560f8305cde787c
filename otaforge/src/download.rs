// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::crypto;

const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String, #[source] attohttpc::Error),
    #[error("Failed to verify tool archive: {0:?}")]
    Verify(PathBuf, #[source] crypto::Error),
    #[error("Archive {archive:?} has no entry named {name}")]
    MissingEntry { archive: PathBuf, name: String },
    #[error("Failed to read archive: {0:?}")]
    Archive(PathBuf, #[source] zip::result::ZipError),
    #[error("I/O error on {0:?}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Received cancel signal")]
    Cancelled,
}

type Result<T> = std::result::Result<T, Error>;

/// Fetches external inputs into a local scratch directory, content-addressed
/// by filename. Correctness of the cache relies on filenames encoding the
/// version; there is no TTL or invalidation.
pub struct Fetcher<'a> {
    work_dir: &'a Path,
    cancel_signal: &'a AtomicBool,
}

impl<'a> Fetcher<'a> {
    pub fn new(work_dir: &'a Path, cancel_signal: &'a AtomicBool) -> Self {
        Self {
            work_dir,
            cancel_signal,
        }
    }

    /// Fetch a URL into the scratch directory. If the target file already
    /// exists, no network access happens at all.
    pub fn fetch(&self, url: &str, file_name: &str) -> Result<PathBuf> {
        let path = self.work_dir.join(file_name);

        if path.exists() {
            debug!("Already fetched: {file_name}");
            return Ok(path);
        }

        info!("Downloading {url}");
        self.download(url, &path)?;

        Ok(path)
    }

    /// Fetch a tool release archive plus its detached signature, verify the
    /// signature against the pinned key, and extract the named binary.
    ///
    /// The binary is only made executable after verification succeeds; an
    /// archive that fails verification is deleted so a rerun refetches it.
    pub fn fetch_tool(
        &self,
        url: &str,
        archive_name: &str,
        entry_name: &str,
        pubkey: &RsaPublicKey,
    ) -> Result<PathBuf> {
        let bin_dir = self
            .work_dir
            .join("bin")
            .join(archive_name.trim_end_matches(".zip"));
        let bin_path = bin_dir.join(entry_name);

        if bin_path.exists() {
            debug!("Already extracted: {bin_path:?}");
            return Ok(bin_path);
        }

        let archive = self.fetch(url, archive_name)?;
        let sig = self.fetch(&format!("{url}.sig"), &format!("{archive_name}.sig"))?;

        if let Err(e) = crypto::verify_detached(&archive, &sig, pubkey) {
            let _ = fs::remove_file(&archive);
            let _ = fs::remove_file(&sig);
            return Err(Error::Verify(archive, e));
        }

        info!("Verified tool archive: {archive_name}");

        fs::create_dir_all(&bin_dir).map_err(|e| Error::Io(bin_dir.clone(), e))?;
        extract_entry(&archive, entry_name, &bin_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&bin_path, fs::Permissions::from_mode(0o755))
                .map_err(|e| Error::Io(bin_path.clone(), e))?;
        }

        Ok(bin_path)
    }

    /// Single-stream download with a `.part` staging file. An existing
    /// partial download is resumed with a Range request; the final name only
    /// ever refers to a complete file.
    fn download(&self, url: &str, path: &Path) -> Result<()> {
        let part_path = part_path(path);
        let mut offset = match fs::metadata(&part_path) {
            Ok(m) => m.len(),
            Err(_) => 0,
        };

        let mut request = attohttpc::get(url)
            .connect_timeout(TIMEOUT)
            .read_timeout(TIMEOUT);

        if offset > 0 {
            debug!("Resuming download at offset {offset}");
            request = request.header("Range", format!("bytes={offset}-"));
        }

        let mut response = request
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Http(url.to_owned(), e))?;

        if offset > 0 && response.status() != attohttpc::StatusCode::PARTIAL_CONTENT {
            // Server ignored the range; start over.
            offset = 0;
        }

        // Never truncate here; a resumed download appends at the offset.
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&part_path)
            .map_err(|e| Error::Io(part_path.clone(), e))?;
        file.set_len(offset)
            .map_err(|e| Error::Io(part_path.clone(), e))?;

        let mut file = io::BufWriter::new(seek_to_end(file, &part_path)?);
        let mut buf = [0u8; 65536];

        loop {
            if self.cancel_signal.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            let n = response
                .read(&mut buf)
                .map_err(|e| Error::Io(part_path.clone(), e))?;
            if n == 0 {
                break;
            }

            file.write_all(&buf[..n])
                .map_err(|e| Error::Io(part_path.clone(), e))?;
        }

        file.into_inner()
            .map_err(|e| Error::Io(part_path.clone(), e.into_error()))?;

        fs::rename(&part_path, path).map_err(|e| Error::Io(path.to_owned(), e))?;

        Ok(())
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".part");
    PathBuf::from(s)
}

fn seek_to_end(mut file: File, path: &Path) -> Result<File> {
    use std::io::Seek;

    file.seek(io::SeekFrom::End(0))
        .map_err(|e| Error::Io(path.to_owned(), e))?;

    Ok(file)
}

fn extract_entry(archive_path: &Path, entry_name: &str, target: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| Error::Io(archive_path.to_owned(), e))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| Error::Archive(archive_path.to_owned(), e))?;

    let mut entry = archive
        .by_name(entry_name)
        .map_err(|_| Error::MissingEntry {
            archive: archive_path.to_owned(),
            name: entry_name.to_owned(),
        })?;

    let mut out = File::create(target).map_err(|e| Error::Io(target.to_owned(), e))?;

    io::copy(&mut entry, &mut out).map_err(|e| Error::Io(target.to_owned(), e))?;

    Ok(())
}
