use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Advisory exclusive lock on the database directory, held for the lifetime
/// of the process. The lock file contains the owning process id for
/// debugging.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; single-process use assumed.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes. The lock
        // file itself is left in place to avoid unlink races with a
        // concurrent open.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LOCK");

        let lock = FileLock::lock(&path).expect("failed to acquire lock");
        assert_eq!(lock.path(), path.as_path());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[test]
    fn second_lock_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LOCK");

        let _lock = FileLock::lock(&path).expect("failed to acquire first lock");
        assert!(FileLock::lock(&path).is_err());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LOCK");

        {
            let _lock = FileLock::lock(&path).expect("failed to acquire lock");
        }

        let _again = FileLock::lock(&path).expect("lock should be free after drop");
    }
}
