use crate::exclusion::ExclusionSet;
use std::fs;
use std::io;
use std::path::Path;

/// Live mount table on Linux
pub const MOUNTS_PATH: &str = "/proc/mounts";

/// Device marker of BeeGFS on-demand mounts
pub const BEEGFS_ONDEMAND_MARKER: &str = "beegfs_ondemand";

/// Mount points whose device field contains `device_marker`
///
/// Mount points listed in `excluded` are skipped. The table is read on every
/// call; nothing is cached.
pub fn discover_mounts(
    mounts_path: &Path,
    device_marker: &str,
    excluded: &ExclusionSet,
) -> io::Result<Vec<String>> {
    let table = fs::read_to_string(mounts_path)?;
    Ok(parse_mount_table(&table, device_marker, excluded))
}

fn parse_mount_table(table: &str, device_marker: &str, excluded: &ExclusionSet) -> Vec<String> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            (device.contains(device_marker) && !excluded.contains(mount_point))
                .then(|| mount_point.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TABLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
beegfs_ondemand /mnt/beeond beegfs rw,relatime,cfgFile=/etc/beegfs/beegfs-client.conf 0 0
/dev/sda1 / ext4 rw,relatime 0 0

beegfs_ondemand /mnt/scratch beegfs rw,relatime 0 0
broken-line
";

    #[test]
    fn test_filters_by_device_marker() {
        let mounts = parse_mount_table(TABLE, BEEGFS_ONDEMAND_MARKER, &ExclusionSet::default());
        assert_eq!(mounts, vec!["/mnt/beeond", "/mnt/scratch"]);
    }

    #[test]
    fn test_excluded_mount_points_are_skipped() {
        let excluded = ExclusionSet::new(["/mnt/scratch"]);
        let mounts = parse_mount_table(TABLE, BEEGFS_ONDEMAND_MARKER, &excluded);
        assert_eq!(mounts, vec!["/mnt/beeond"]);
    }

    #[test]
    fn test_no_matching_mounts_is_empty() {
        let mounts = parse_mount_table(
            "/dev/sda1 / ext4 rw 0 0\n",
            BEEGFS_ONDEMAND_MARKER,
            &ExclusionSet::default(),
        );
        assert!(mounts.is_empty());
    }

    #[test]
    fn test_discover_reads_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(TABLE.as_bytes()).unwrap();
        file.flush().unwrap();

        let mounts =
            discover_mounts(file.path(), BEEGFS_ONDEMAND_MARKER, &ExclusionSet::default())
                .unwrap();
        assert_eq!(mounts.len(), 2);
    }

    #[test]
    fn test_discover_missing_file_is_error() {
        let result = discover_mounts(
            Path::new("/nonexistent/mounts"),
            BEEGFS_ONDEMAND_MARKER,
            &ExclusionSet::default(),
        );
        assert!(result.is_err());
    }
}
