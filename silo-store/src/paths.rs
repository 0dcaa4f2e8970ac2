//! Spool directory layout: `/<root>/<bucket>/<mailbox>/…` for mailbox
//! files, `/<root>/db/` for skiplist databases, `/<root>/quota/
//! <bucket>/<root>` for quota files, `/<root>/user/<bucket>/
//! <user>.{seen,sub}` for per-user state.

use std::path::PathBuf;

use silo_mboxname::hash_mbox;

#[derive(Debug, Clone)]
pub struct SpoolPaths {
    root: PathBuf,
}

impl SpoolPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SpoolPaths { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn mailbox_dir(&self, internal_name: &str) -> PathBuf {
        self.root
            .join(hash_mbox(internal_name).to_string())
            .join(internal_name)
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    pub fn mailbox_list_path(&self) -> PathBuf {
        self.db_dir().join("mailboxes.db")
    }

    pub fn quota_path(&self, quota_root: &str) -> PathBuf {
        self.root
            .join("quota")
            .join(hash_mbox(quota_root).to_string())
            .join(quota_root)
    }

    pub fn seen_path(&self, userid: &str) -> PathBuf {
        self.root
            .join("user")
            .join(hash_mbox(userid).to_string())
            .join(format!("{userid}.seen"))
    }

    pub fn subscriptions_path(&self, userid: &str) -> PathBuf {
        self.root
            .join("user")
            .join(hash_mbox(userid).to_string())
            .join(format!("{userid}.sub"))
    }

    pub fn message_path(&self, internal_name: &str, uid: u32) -> PathBuf {
        self.mailbox_dir(internal_name).join(format!("{uid}."))
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.root.join("stage")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_dir_is_bucketed_by_first_significant_character() {
        let paths = SpoolPaths::new("/spool");
        assert_eq!(
            paths.mailbox_dir("user.alice"),
            PathBuf::from("/spool/a/user.alice")
        );
    }

    #[test]
    fn quota_and_seen_paths_follow_the_documented_layout() {
        let paths = SpoolPaths::new("/spool");
        assert_eq!(
            paths.quota_path("user.alice"),
            PathBuf::from("/spool/quota/a/user.alice")
        );
        assert_eq!(
            paths.seen_path("alice"),
            PathBuf::from("/spool/user/a/alice.seen")
        );
    }
}
