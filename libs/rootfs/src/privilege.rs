//! Process privilege detection.

/// Whether the process runs with superuser privileges.
///
/// Detect once at startup and hand the value to the pipeline; unprivileged
/// processes unpack images with ownership remapped to the effective user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Privilege {
    is_root: bool,
}

impl Privilege {
    /// Read the effective UID of the current process.
    pub fn detect() -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let euid = unsafe { libc::geteuid() };
        Self { is_root: euid == 0 }
    }

    pub const fn root() -> Self {
        Self { is_root: true }
    }

    pub const fn unprivileged() -> Self {
        Self { is_root: false }
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Whether unpacking must remap ownership.
    pub fn needs_rootless_unpack(&self) -> bool {
        !self.is_root
    }
}
