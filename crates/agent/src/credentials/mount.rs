//! Scoped read-only mount of the `STATE` partition.
//!
//! The partition is mounted inside a private temp directory under a tmpfs
//! scratch root and unmounted when the guard drops, so intermediate OS
//! resources are released on every exit path.

use std::path::PathBuf;

use super::CredentialsError;

/// Raw block device node for the `STATE` partition.
const STATE_PARTITION: &str = "/dev/disk/by-partlabel/STATE";

/// Device-mapper node used when disk encryption is enabled.
const STATE_PARTITION_ENCRYPTED: &str = "/dev/mapper/luks2-STATE";

/// Scratch root for temporary mount points. `/run` is a writable tmpfs on
/// the immutable host OS.
const MOUNT_BASE: &str = "/run/autobootstrap";

/// Machine configuration file within the mounted partition.
const CONFIG_FILE_NAME: &str = "config.yaml";

/// Filesystem type of the `STATE` partition.
#[cfg(target_os = "linux")]
const STATE_FILESYSTEM: &str = "xfs";

/// Guard holding the mounted partition. Dropping it unmounts the partition
/// and then removes the temporary mount point.
pub(crate) struct StateMount {
    dir: tempfile::TempDir,
}

impl StateMount {
    /// Mount the `STATE` partition read-only at a fresh temp mount point.
    ///
    /// Tries the raw partition first (unencrypted installs), then the
    /// device-mapper node (encrypted installs).
    #[cfg(target_os = "linux")]
    pub fn mount() -> Result<Self, CredentialsError> {
        use std::os::unix::fs::DirBuilderExt;

        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(MOUNT_BASE)
            .map_err(|e| {
                CredentialsError::StateUnavailable(format!(
                    "failed to create mount base {}: {}",
                    MOUNT_BASE, e
                ))
            })?;

        let dir = tempfile::Builder::new()
            .prefix("state-partition-")
            .tempdir_in(MOUNT_BASE)
            .map_err(|e| {
                CredentialsError::StateUnavailable(format!(
                    "failed to create temp mount point: {}",
                    e
                ))
            })?;

        if let Err(raw) = mount_partition(STATE_PARTITION, dir.path())
            && let Err(mapper) = mount_partition(STATE_PARTITION_ENCRYPTED, dir.path())
        {
            return Err(CredentialsError::StateUnavailable(format!(
                "failed to mount (tried {}: {}; {}: {})",
                STATE_PARTITION, raw, STATE_PARTITION_ENCRYPTED, mapper
            )));
        }

        Ok(Self { dir })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn mount() -> Result<Self, CredentialsError> {
        Err(CredentialsError::StateUnavailable(
            "STATE partition mounting is only supported on Linux".to_string(),
        ))
    }

    /// Path of the machine configuration file within the mount.
    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join(CONFIG_FILE_NAME)
    }
}

#[cfg(target_os = "linux")]
fn mount_partition(device: &str, mount_point: &std::path::Path) -> Result<(), nix::Error> {
    nix::mount::mount(
        Some(device),
        mount_point,
        Some(STATE_FILESYSTEM),
        nix::mount::MsFlags::MS_RDONLY,
        None::<&str>,
    )
}

#[cfg(target_os = "linux")]
impl Drop for StateMount {
    fn drop(&mut self) {
        // Unmount before the TempDir field removes the mount point itself.
        if let Err(e) = nix::mount::umount(self.dir.path()) {
            tracing::warn!(
                mount_point = %self.dir.path().display(),
                error = %e,
                "failed to unmount STATE partition"
            );
        }
    }
}
