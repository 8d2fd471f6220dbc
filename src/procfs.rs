use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{Error, Result};

/// The process-information root, i.e. a procfs mount (`/proc` by default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        ProcFs::new(Self::DEFAULT_ROOT)
    }
}

impl ProcFs {
    /// Where procfs is normally mounted.
    pub const DEFAULT_ROOT: &'static str = "/proc";

    /// Construct a new `ProcFs` rooted at the given directory.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        ProcFs { root: root.into() }
    }

    /// The directory this `ProcFs` is rooted at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<PID>`
    pub fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// `<root>/<PID>/maps`
    pub fn maps_path(&self, pid: u32) -> PathBuf {
        self.pid_dir(pid).join("maps")
    }

    /// `<root>/<PID>/mem`
    pub fn mem_path(&self, pid: u32) -> PathBuf {
        self.pid_dir(pid).join("mem")
    }

    /// `<root>/<PID>/status`
    pub fn status_path(&self, pid: u32) -> PathBuf {
        self.pid_dir(pid).join("status")
    }

    /// Returns the PIDs of all processes, i.e. every directory under the root whose name is a
    /// number, in ascending order.
    pub fn pids(&self) -> Result<Vec<u32>> {
        let root = self.root.display().to_string();
        let entries = fs::read_dir(&self.root).map_err(|e| Error::ReadDir {
            path: root.clone(),
            source: e,
        })?;
        let mut pids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::ReadDir {
                path: root.clone(),
                source: e,
            })?;
            let pid = match entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            if entry.path().is_dir() {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        trace!(count = pids.len(), root = %root, "listed processes");
        Ok(pids)
    }

    /// Returns the name of the process with the given PID, as found in the `Name:` field of its
    /// `status` file, or `None` if there is no such field. Bytes that are not valid UTF-8 are
    /// replaced with `U+FFFD`.
    pub fn process_name(&self, pid: u32) -> Result<Option<String>> {
        let path = self.status_path(pid);
        let status = fs::read(&path).map_err(|e| Error::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(parse_status_name(&String::from_utf8_lossy(&status)))
    }

    /// Returns the PID of the first process (in ascending PID order) named exactly `name`.
    ///
    /// Processes that exit while the lookup is running are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProcessNotFound`] if no process matches, or an environment error if the
    /// root cannot be listed or a `status` file cannot be read.
    pub fn find_pid(&self, name: &str) -> Result<u32> {
        for pid in self.pids()? {
            match self.process_name(pid) {
                Ok(Some(n)) if n == name => {
                    debug!(pid, name, "found process");
                    return Ok(pid);
                }
                Ok(_) => {}
                Err(Error::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                    trace!(pid, "process exited during lookup");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::ProcessNotFound(name.to_owned()))
    }
}

/// Extract the trimmed value of the first `Name:` line of a `status` file.
fn parse_status_name(status: &str) -> Option<String> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Name:"))
        .map(|name| name.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_proc(procs: &[(u32, &str)]) -> anyhow::Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        for (pid, status) in procs {
            let pdir = dir.path().join(pid.to_string());
            fs::create_dir(&pdir)?;
            fs::write(pdir.join("status"), status)?;
        }
        fs::create_dir(dir.path().join("self"))?;
        fs::write(dir.path().join("1234"), "not a process directory")?;
        Ok(dir)
    }

    #[test]
    fn test_parse_status_name() {
        assert_eq!(
            parse_status_name("Name:\tcat\nUmask:\t0022\nState:\tS (sleeping)\n"),
            Some("cat".to_owned())
        );
        assert_eq!(
            parse_status_name("Name:   kworker/0:1  \n"),
            Some("kworker/0:1".to_owned())
        );
        assert_eq!(parse_status_name("Umask:\t0022\n"), None);
        assert_eq!(parse_status_name(""), None);
        assert_eq!(parse_status_name("N\nName:\tx\n"), Some("x".to_owned()));
    }

    #[test]
    fn test_pids() -> anyhow::Result<()> {
        let dir = fake_proc(&[(42, "Name:\tb\n"), (7, "Name:\ta\n"), (100, "Name:\tc\n")])?;
        let procfs = ProcFs::new(dir.path());
        assert_eq!(procfs.pids()?, vec![7, 42, 100]);
        Ok(())
    }

    #[test]
    fn test_find_pid() -> anyhow::Result<()> {
        let dir = fake_proc(&[
            (10, "Name:\tbash\n"),
            (11, "Name:\tcat\n"),
            (12, "Name:\tcat\n"),
            (13, "Name:\tCat\n"),
        ])?;
        let procfs = ProcFs::new(dir.path());
        assert_eq!(procfs.find_pid("cat")?, 11);
        assert_eq!(procfs.find_pid("Cat")?, 13);
        assert_eq!(procfs.process_name(10)?, Some("bash".to_owned()));
        Ok(())
    }

    #[test]
    fn test_find_pid_not_found() -> anyhow::Result<()> {
        let dir = fake_proc(&[(10, "Name:\tbash\n")])?;
        let err = ProcFs::new(dir.path()).find_pid("ca").unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, Error::ProcessNotFound(ref n) if n == "ca"));
        Ok(())
    }

    #[test]
    fn test_vanished_process_is_ignored() -> anyhow::Result<()> {
        let dir = fake_proc(&[(20, "Name:\tcat\n")])?;
        fs::create_dir(dir.path().join("5"))?;
        assert_eq!(ProcFs::new(dir.path()).find_pid("cat")?, 20);
        Ok(())
    }

    #[test]
    fn test_non_utf8_status_is_not_fatal() -> anyhow::Result<()> {
        let dir = fake_proc(&[(20, "Name:\tcat\n")])?;
        fs::create_dir(dir.path().join("10"))?;
        fs::write(dir.path().join("10/status"), b"Name:\tw\xffrker\nUmask:\t0022\n")?;
        let procfs = ProcFs::new(dir.path());
        assert_eq!(procfs.find_pid("cat")?, 20);
        assert_eq!(procfs.process_name(10)?, Some("w\u{fffd}rker".to_owned()));
        Ok(())
    }

    #[test]
    fn test_missing_root() {
        let err = ProcFs::new("/nonexistent/procmem/proc").pids().unwrap_err();
        assert!(matches!(err, Error::ReadDir { .. }));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_paths() {
        let procfs = ProcFs::default();
        assert_eq!(procfs.root(), Path::new("/proc"));
        assert_eq!(procfs.maps_path(1), Path::new("/proc/1/maps"));
        assert_eq!(procfs.mem_path(1), Path::new("/proc/1/mem"));
        assert_eq!(procfs.status_path(1), Path::new("/proc/1/status"));
    }
}
