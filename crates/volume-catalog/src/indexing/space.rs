//! Capacity of the mounted disk that holds a volume's root.

use std::path::Path;

use sysinfo::Disks;

use crate::indexing::volumes::VolumeSpace;

/// Space figures for the disk whose mount point is the longest prefix of `root`.
///
/// `None` when no mounted disk contains the path (unmounted drive, or a platform
/// where sysinfo lists nothing).
pub fn space_for_path(root: &Path) -> Option<VolumeSpace> {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|d| root.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())?;

    let total = disk.total_space();
    let available = disk.available_space();
    let format = disk.file_system().to_string_lossy().to_string();
    log::debug!(
        "Disk for {}: mount {}, {total} total, {available} free",
        root.display(),
        disk.mount_point().display()
    );
    Some(VolumeSpace {
        total_capacity: total,
        used_space: total.saturating_sub(available),
        free_space: available,
        format: (!format.is_empty()).then_some(format),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn figures_are_consistent_when_a_disk_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        // Containers may expose no disks at all; only check consistency when one is found.
        if let Some(space) = space_for_path(&root) {
            assert!(space.free_space <= space.total_capacity || space.used_space == 0);
            assert_eq!(space.used_space, space.total_capacity.saturating_sub(space.free_space));
        }
    }

    #[test]
    fn relative_nonsense_path_has_no_disk() {
        assert!(space_for_path(Path::new("not/a/mounted/path")).is_none());
    }
}
