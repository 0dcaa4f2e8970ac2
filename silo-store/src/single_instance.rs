//! Single-instance message staging: write the delivered message once,
//! into a hostname-tagged staging directory, then `link(2)` it into
//! every destination mailbox under that destination's UID-derived
//! filename. If any link fails, every link already made is removed
//! and the staged file is unlinked, so a delivery either reaches
//! every destination or none of them.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub struct StagedMessage {
    path: PathBuf,
    linked: Vec<PathBuf>,
}

impl StagedMessage {
    /// Writes `data` into `stage_dir/<hostname>-<unique>`, `fsync`ing
    /// before returning so a subsequent link always sees committed
    /// bytes.
    pub fn stage(stage_dir: &Path, hostname: &str, unique: &str, data: &[u8]) -> io::Result<Self> {
        fs::create_dir_all(stage_dir)?;
        let path = stage_dir.join(format!("{hostname}-{unique}"));
        let mut file = File::create(&path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(StagedMessage {
            path,
            linked: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Links the staged file into `dest` (typically
    /// `<mailbox-dir>/<uid>.`), recording the link so a later failure
    /// can undo every link made so far.
    pub fn link_into(&mut self, dest: &Path) -> io::Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::hard_link(&self.path, dest)?;
        self.linked.push(dest.to_path_buf());
        Ok(())
    }

    /// Undoes every link made so far and removes the staged file
    /// itself. Called when a later recipient's link fails, so the
    /// delivery as a whole leaves no partial trace.
    pub fn rollback(mut self) {
        for dest in self.linked.drain(..) {
            let _ = fs::remove_file(&dest);
        }
        let _ = fs::remove_file(&self.path);
    }

    /// Releases the staging record once every recipient has been
    /// dispatched (all links made, or none needed — e.g. discard-only
    /// delivery). The message survives solely through its links now,
    /// so the staged copy itself is removed.
    pub fn finish(self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_and_link_into_two_mailboxes() {
        let dir = tempfile::tempdir().unwrap();
        let stage_dir = dir.path().join("stage");
        let mut staged =
            StagedMessage::stage(&stage_dir, "mail01", "abc123", b"hello world").unwrap();

        let a = dir.path().join("mbox_a/5.");
        let b = dir.path().join("mbox_b/9.");
        staged.link_into(&a).unwrap();
        staged.link_into(&b).unwrap();

        assert_eq!(fs::read(&a).unwrap(), b"hello world");
        assert_eq!(fs::read(&b).unwrap(), b"hello world");

        staged.finish().unwrap();
        assert!(fs::read(&a).is_ok());
        assert!(fs::read(&b).is_ok());
    }

    #[test]
    fn rollback_removes_every_link_and_the_staged_copy() {
        let dir = tempfile::tempdir().unwrap();
        let stage_dir = dir.path().join("stage");
        let mut staged =
            StagedMessage::stage(&stage_dir, "mail01", "abc123", b"hello").unwrap();

        let a = dir.path().join("mbox_a/5.");
        staged.link_into(&a).unwrap();
        let staged_path = staged.path().to_path_buf();

        staged.rollback();

        assert!(fs::metadata(&a).is_err());
        assert!(fs::metadata(&staged_path).is_err());
    }

    #[test]
    fn link_into_fails_if_destination_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let stage_dir = dir.path().join("stage");
        let mut staged =
            StagedMessage::stage(&stage_dir, "mail01", "abc123", b"hello").unwrap();

        let a = dir.path().join("mbox_a/5.");
        fs::create_dir_all(a.parent().unwrap()).unwrap();
        fs::write(&a, b"pre-existing").unwrap();

        assert!(staged.link_into(&a).is_err());
    }
}
