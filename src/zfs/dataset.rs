use std::fmt;

/// Where a property value comes from.
///
/// `Inherited` carries the name of the ancestor the value flows down from.
/// The distinction between `Default` and `None` matters when reverting a
/// set: a previously-default property is re-inherited, a previously-absent
/// user property is removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertySource {
    Local,
    Inherited(String),
    Default,
    None,
}

impl PropertySource {
    /// Parse the source tag exactly as the adapter reported it. Unknown tags
    /// (temporary mounts, received streams) collapse to `None`.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "local" => PropertySource::Local,
            "default" => PropertySource::Default,
            "" | "-" | "none" => PropertySource::None,
            other => match other.strip_prefix("inherited from ") {
                Some(origin) => PropertySource::Inherited(origin.to_string()),
                None => PropertySource::None,
            },
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, PropertySource::Local)
    }

    pub fn is_inherited(&self) -> bool {
        matches!(self, PropertySource::Inherited(_))
    }
}

impl fmt::Display for PropertySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertySource::Local => write!(f, "local"),
            PropertySource::Inherited(origin) => write!(f, "inherited from {origin}"),
            PropertySource::Default => write!(f, "default"),
            PropertySource::None => write!(f, "-"),
        }
    }
}

/// Per-property source tags for the tracked property set of a [`Dataset`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetSources {
    pub mountpoint: PropertySource,
    pub canmount: PropertySource,
    pub bootfs: PropertySource,
    pub last_used: PropertySource,
    pub bootfs_datasets: PropertySource,
}

impl Default for DatasetSources {
    fn default() -> Self {
        DatasetSources {
            mountpoint: PropertySource::None,
            canmount: PropertySource::None,
            bootfs: PropertySource::None,
            last_used: PropertySource::None,
            bootfs_datasets: PropertySource::None,
        }
    }
}

/// One scanned entity: a filesystem or a snapshot, with the effective values
/// of the tracked property set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dataset {
    /// Full ZFS path, e.g. `rpool/ROOT/ubuntu_1234` or
    /// `rpool/ROOT/ubuntu_1234@snap_r1`.
    pub name: String,
    /// Whether the name designates a snapshot.
    pub is_snapshot: bool,
    /// ZFS-resolved mount path; snapshots report their filesystem's.
    pub mountpoint: String,
    /// `on`, `off` or `noauto`; always `-` on snapshots.
    pub canmount: String,
    /// True only for live datasets currently mounted.
    pub mounted: bool,
    /// `yes` when the dataset is a bootable system root, `no` otherwise.
    pub bootfs: String,
    /// Seconds: creation time for snapshots, last recorded use (or creation)
    /// for filesystems.
    pub last_used: i64,
    /// User property listing the system installations this dataset belongs to.
    pub bootfs_datasets: String,
    /// Origin snapshot for clones, empty otherwise.
    pub origin: String,
    /// Source tag for each tracked property.
    pub sources: DatasetSources,
}

/// True when `name` refers to a snapshot.
pub fn is_snapshot_name(name: &str) -> bool {
    name.contains('@')
}

/// Split `dataset@snap` into its filesystem and snapshot short name.
pub fn split_snapshot_name(name: &str) -> Option<(&str, &str)> {
    name.split_once('@')
}

/// The filesystem a name belongs to: itself for filesystems, the part left
/// of `@` for snapshots.
pub fn filesystem_of(name: &str) -> &str {
    match name.split_once('@') {
        Some((fs, _)) => fs,
        None => name,
    }
}

/// The parent dataset by `/`-path, `None` for pool roots.
pub fn parent_of(name: &str) -> Option<&str> {
    filesystem_of(name).rsplit_once('/').map(|(parent, _)| parent)
}

/// True when `name` (filesystem or snapshot) lives in the subtree rooted at
/// the filesystem `root`, `root` itself included.
pub fn in_subtree(root: &str, name: &str) -> bool {
    let fs = filesystem_of(name);
    fs == root || (fs.starts_with(root) && fs[root.len()..].starts_with('/'))
}

/// Compute the name a clone of `parent` takes for the given suffix.
///
/// The final path segment is treated as `<stem>_<tail>` only when the part
/// after the last `_` is non-empty ASCII alphanumeric; the tail is then
/// replaced by the new suffix. Any other shape gets `_<suffix>` appended.
pub(crate) fn clone_target_name(parent: &str, suffix: &str) -> String {
    let (dir, segment) = match parent.rsplit_once('/') {
        Some((dir, segment)) => (Some(dir), segment),
        None => (None, parent),
    };

    let stem = match segment.rsplit_once('_') {
        Some((stem, tail))
            if !stem.is_empty()
                && !tail.is_empty()
                && tail.bytes().all(|b| b.is_ascii_alphanumeric()) =>
        {
            stem
        }
        _ => segment,
    };

    match dir {
        Some(dir) => format!("{dir}/{stem}_{suffix}"),
        None => format!("{stem}_{suffix}"),
    }
}

/// Sort a scan into its canonical order (by name, snapshots after their
/// filesystem) so two scans of equal state compare equal element-wise.
pub fn sort_scan(datasets: &mut [Dataset]) {
    datasets.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| a.is_snapshot.cmp(&b.is_snapshot))
    });
}

/// Replace every `last_used` falling inside `[start, end]` with `magic`.
///
/// Mutating verbs stamp real wall-clock times; mapping any stamp taken
/// during a test run to a fixed constant makes scans comparable.
pub fn normalize_last_used(datasets: &mut [Dataset], start: i64, end: i64, magic: i64) {
    for dataset in datasets {
        if dataset.last_used >= start && dataset.last_used <= end {
            dataset.last_used = magic;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_source_parse() {
        assert_eq!(PropertySource::parse("local"), PropertySource::Local);
        assert_eq!(PropertySource::parse("default"), PropertySource::Default);
        assert_eq!(PropertySource::parse("-"), PropertySource::None);
        assert_eq!(PropertySource::parse(""), PropertySource::None);
        assert_eq!(PropertySource::parse("none"), PropertySource::None);
        assert_eq!(
            PropertySource::parse("inherited from rpool/ROOT"),
            PropertySource::Inherited("rpool/ROOT".to_string())
        );
        // Unknown tags collapse to None rather than being guessed at.
        assert_eq!(PropertySource::parse("temporary"), PropertySource::None);
    }

    #[test]
    fn test_property_source_display_round_trips() {
        for tag in ["local", "inherited from rpool/ROOT", "default", "-"] {
            assert_eq!(PropertySource::parse(tag).to_string(), tag);
        }
    }

    #[test]
    fn test_name_helpers() {
        assert!(is_snapshot_name("rpool@snap1"));
        assert!(!is_snapshot_name("rpool/ROOT"));

        assert_eq!(
            split_snapshot_name("rpool/ROOT/ubuntu_1234@snap_r1"),
            Some(("rpool/ROOT/ubuntu_1234", "snap_r1"))
        );
        assert_eq!(split_snapshot_name("rpool/ROOT"), None);

        assert_eq!(filesystem_of("rpool/ROOT/ubuntu@snap"), "rpool/ROOT/ubuntu");
        assert_eq!(filesystem_of("rpool/ROOT/ubuntu"), "rpool/ROOT/ubuntu");

        assert_eq!(parent_of("rpool/ROOT/ubuntu"), Some("rpool/ROOT"));
        assert_eq!(parent_of("rpool/ROOT/ubuntu@snap"), Some("rpool/ROOT"));
        assert_eq!(parent_of("rpool"), None);
    }

    #[test]
    fn test_in_subtree() {
        assert!(in_subtree("rpool/ROOT", "rpool/ROOT"));
        assert!(in_subtree("rpool/ROOT", "rpool/ROOT/ubuntu/var"));
        assert!(in_subtree("rpool/ROOT", "rpool/ROOT/ubuntu@snap"));
        assert!(in_subtree("rpool", "rpool@snap"));

        // Prefixes that aren't path ancestors don't count.
        assert!(!in_subtree("rpool/ROOT/ubuntu", "rpool/ROOT/ubuntu_1234"));
        assert!(!in_subtree("rpool/ROOT/ubuntu", "rpool/ROOT"));
    }

    #[test]
    fn test_clone_target_name() {
        // Trailing alphanumeric suffix is replaced.
        assert_eq!(
            clone_target_name("rpool/ROOT/ubuntu_1234", "5678"),
            "rpool/ROOT/ubuntu_5678"
        );
        assert_eq!(clone_target_name("ubuntu_abc1", "xyz"), "ubuntu_xyz");

        // No suffix: append one.
        assert_eq!(
            clone_target_name("rpool/ROOT/ubuntu", "5678"),
            "rpool/ROOT/ubuntu_5678"
        );
        assert_eq!(clone_target_name("rpool", "5678"), "rpool_5678");

        // A non-alphanumeric or empty tail isn't a suffix.
        assert_eq!(clone_target_name("rpool/ROOT/weird_", "x"), "rpool/ROOT/weird__x");
        assert_eq!(
            clone_target_name("rpool/ROOT/name_a.b", "x"),
            "rpool/ROOT/name_a.b_x"
        );

        // Underscores in other path segments are left alone.
        assert_eq!(
            clone_target_name("rpool/ROOT_A/ubuntu", "9"),
            "rpool/ROOT_A/ubuntu_9"
        );
    }

    #[test]
    fn test_sort_scan_is_total() {
        let mut scan = vec![
            Dataset {
                name: "rpool/ROOT".to_string(),
                ..Dataset::default()
            },
            Dataset {
                name: "rpool".to_string(),
                ..Dataset::default()
            },
            Dataset {
                name: "rpool@snap".to_string(),
                is_snapshot: true,
                ..Dataset::default()
            },
        ];
        sort_scan(&mut scan);
        let names: Vec<&str> = scan.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["rpool", "rpool/ROOT", "rpool@snap"]);
    }

    #[test]
    fn test_normalize_last_used() {
        let mut scan = vec![
            Dataset {
                name: "a".to_string(),
                last_used: 150,
                ..Dataset::default()
            },
            Dataset {
                name: "b".to_string(),
                last_used: 400,
                ..Dataset::default()
            },
        ];
        normalize_last_used(&mut scan, 100, 200, 2_000_000_000);
        assert_eq!(scan[0].last_used, 2_000_000_000);
        assert_eq!(scan[1].last_used, 400);
    }
}
