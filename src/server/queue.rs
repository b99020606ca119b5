// src/server/queue.rs

//! Mirror sync queue calculation
//!
//! The highest revision known anywhere is authoritative. When a mirror is
//! ahead of the server, the server downloads from it first and every mirror
//! behind that revision is queued for upload. Several mirrors tying for the
//! highest revision are assumed identical; the first one in configuration
//! order is used.

use super::status::MirrorStatus;
use tracing::{debug, warn};

/// What a mirror sync run has to transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncQueue {
    /// Mirror to download the authoritative database from
    pub download: Option<String>,
    /// Mirrors to upload to, in configuration order
    pub upload: Vec<String>,
    /// Queued mirrors that claimed the target revision without data
    pub divergent: Vec<String>,
    /// Revision every mirror holds once the queue is processed
    pub target_revision: u64,
}

impl SyncQueue {
    pub fn is_empty(&self) -> bool {
        self.download.is_none() && self.upload.is_empty()
    }
}

/// Classify `statuses` against the server's `local_revision`
pub fn calculate_queue(statuses: &[MirrorStatus], local_revision: u64) -> SyncQueue {
    let remote_max = statuses
        .iter()
        .map(MirrorStatus::effective_revision)
        .max()
        .unwrap_or(0);

    if remote_max == 0 {
        debug!("No mirror has data, uploading to all");
        return SyncQueue {
            download: None,
            upload: statuses.iter().map(|s| s.uri.clone()).collect(),
            divergent: Vec::new(),
            target_revision: local_revision,
        };
    }

    let mut queue = SyncQueue::default();
    if local_revision < remote_max {
        let source = statuses
            .iter()
            .find(|s| s.effective_revision() == remote_max)
            .map(|s| s.uri.clone());
        let ties = statuses
            .iter()
            .filter(|s| s.effective_revision() == remote_max)
            .count();
        if ties > 1 {
            debug!(
                "{} mirrors at revision {}, downloading from the first",
                ties, remote_max
            );
        }
        queue.download = source;
        queue.target_revision = remote_max;
    } else {
        queue.target_revision = local_revision;
    }

    queue.upload = statuses
        .iter()
        .filter(|s| s.effective_revision() < queue.target_revision)
        .map(|s| s.uri.clone())
        .collect();

    // second pass: mirrors claiming to be current while lacking data
    for status in statuses {
        if status.revision >= queue.target_revision && !status.has_data {
            warn!(
                "Mirror {} reports revision {} without data, re-uploading",
                status.uri, status.revision
            );
            queue.divergent.push(status.uri.clone());
        }
    }

    queue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockState;

    fn status(uri: &str, revision: u64) -> MirrorStatus {
        MirrorStatus {
            uri: uri.to_string(),
            revision,
            has_data: revision > 0,
            upload_locked: LockState::Absent,
            download_locked: LockState::Absent,
        }
    }

    #[test]
    fn test_upload_only_to_stale_mirror() {
        let queue = calculate_queue(&[status("m1", 5), status("m2", 5), status("m3", 3)], 5);
        assert_eq!(queue.download, None);
        assert_eq!(queue.upload, vec!["m3".to_string()]);
        assert_eq!(queue.target_revision, 5);
    }

    #[test]
    fn test_download_from_most_advanced() {
        let queue = calculate_queue(&[status("m1", 7), status("m2", 5)], 5);
        assert_eq!(queue.download.as_deref(), Some("m1"));
        assert_eq!(queue.upload, vec!["m2".to_string()]);
        assert_eq!(queue.target_revision, 7);
    }

    #[test]
    fn test_all_empty_uploads_everywhere() {
        let queue = calculate_queue(&[status("m1", 0)], 0);
        assert_eq!(queue.download, None);
        assert_eq!(queue.upload, vec!["m1".to_string()]);

        let fresh_server = calculate_queue(&[status("m1", 0), status("m2", 0)], 3);
        assert_eq!(fresh_server.upload.len(), 2);
    }

    #[test]
    fn test_in_sync_is_empty() {
        let queue = calculate_queue(&[status("m1", 4), status("m2", 4)], 4);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_tie_picks_first_configured() {
        let queue = calculate_queue(&[status("m1", 6), status("m2", 9), status("m3", 9)], 2);
        assert_eq!(queue.download.as_deref(), Some("m2"));
        assert_eq!(queue.upload, vec!["m1".to_string()]);
    }

    #[test]
    fn test_revision_without_data_is_divergent() {
        let mut broken = status("m2", 5);
        broken.has_data = false;
        let queue = calculate_queue(&[status("m1", 5), broken], 5);
        assert_eq!(queue.upload, vec!["m2".to_string()]);
        assert_eq!(queue.divergent, vec!["m2".to_string()]);

        let mut behind_without_data = status("m2", 3);
        behind_without_data.has_data = false;
        let queue = calculate_queue(&[status("m1", 5), behind_without_data], 5);
        assert_eq!(queue.upload, vec!["m2".to_string()]);
        assert!(queue.divergent.is_empty());

        let mut ahead_without_data = status("m2", 9);
        ahead_without_data.has_data = false;
        let queue = calculate_queue(&[status("m1", 5), ahead_without_data], 5);
        assert_eq!(queue.upload, vec!["m2".to_string()]);
        assert_eq!(queue.divergent, vec!["m2".to_string()]);
    }
}
