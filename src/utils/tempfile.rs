use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::fmt::Write;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write as _};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Creates a temporary file in `dir`. The filename of the temporary file is
/// generated as `base || hex || extension`, where `hex` is a randomly generated
/// string. The resulting file is only readable by the current user.
/// The function returns `ErrorKind::AlreadyExists` only after several retries.
pub(crate) fn create_temp_file(
    dir: &Path,
    base: &str,
    extension: &str,
) -> io::Result<(PathBuf, File)> {
    const RETRIES: usize = 16;

    let mut rng = StdRng::from_entropy();

    for _ in 0..RETRIES {
        let mut suffix = [0u8; 8];

        rng.fill_bytes(&mut suffix);

        let mut filename = String::from(base);

        for b in suffix {
            let _ = write!(filename, "{:02x}", b);
        }

        filename.push_str(extension);

        let path = dir.join(filename);

        let open_result = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path);

        match open_result {
            Ok(file) => return Ok((path, file)),
            Err(err) => {
                if matches!(err.kind(), ErrorKind::AlreadyExists) {
                    continue;
                }

                return Err(err);
            }
        }
    }

    Err(io::Error::new(
        ErrorKind::AlreadyExists,
        format!(
            "failed to create a secure tempfile after {} retries",
            RETRIES
        ),
    ))
}

/// A file being written next to its final destination. It is unlinked when
/// dropped unless it was persisted, so a partial file is never left under the
/// final name.
pub(crate) struct PendingFile {
    path: PathBuf,
    file: Option<File>,
    persisted: bool,
}

impl PendingFile {
    /// Creates a pending file in the directory of `dest`.
    pub(crate) fn beside(dest: &Path, extension: &str) -> io::Result<PendingFile> {
        let dir = dest
            .parent()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "destination has no parent"))?;

        let base = match dest.file_name() {
            Some(name) => format!(".{}.", name.to_string_lossy()),
            None => ".".to_string(),
        };

        let (path, file) = create_temp_file(dir, &base, extension)?;

        Ok(PendingFile {
            path,
            file: Some(file),
            persisted: false,
        })
    }

    /// Hands out the open file, e.g. to convert it into an async one.
    pub(crate) fn take_file(&mut self) -> Option<File> {
        self.file.take()
    }

    pub(crate) fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Atomically moves the file to `dest`.
    pub(crate) fn persist(mut self, dest: &Path) -> io::Result<()> {
        self.file.take();

        std::fs::rename(&self.path, dest)?;
        self.persisted = true;

        Ok(())
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Replaces `dest` with `contents` so that readers see either the old or
/// the new file, never a mix.
pub(crate) fn write_atomic(dest: &Path, contents: &[u8]) -> io::Result<()> {
    let mut pending = PendingFile::beside(dest, ".tmp")?;

    if let Some(mut file) = pending.take_file() {
        file.write_all(contents)?;
        file.sync_all()?;
    }

    pending.persist(dest)
}
