//! Mount option handling and mountpoint validation.
//!
//! Options are carried as the raw strings the embedding application passed
//! to `mount`; the assembled comma-joined form is what the kernel sees.

use std::path::Path;
use thiserror::Error;

/// Mount options for one filesystem, in the order they were given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    options: Vec<String>,
}

/// Errors that can occur during mount validation.
#[derive(Debug, Error)]
pub enum MountError {
    /// Path does not exist.
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Path is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Permission denied.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid option.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for MountError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => MountError::PathNotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => MountError::PermissionDenied(e.to_string()),
            _ => MountError::IoError(e.to_string()),
        }
    }
}

impl MountOptions {
    pub fn new<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MountOptions {
            options: options.into_iter().map(Into::into).collect(),
        }
    }

    pub fn push(&mut self, option: impl Into<String>) {
        self.options.push(option.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn contains(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }

    /// The comma-joined option string; empty when no options were given.
    pub fn assembled(&self) -> String {
        self.options.join(",")
    }

    /// Every option must be non-empty and must not itself contain a separator.
    pub fn validate(&self) -> Result<(), MountError> {
        for opt in &self.options {
            if opt.trim().is_empty() {
                return Err(MountError::InvalidOption("empty option".to_string()));
            }
            if opt.contains(',') {
                return Err(MountError::InvalidOption(opt.clone()));
            }
        }
        Ok(())
    }

    /// Convert to the `fuser` option list. Names `fuser` knows become typed
    /// options, the rest are passed through verbatim.
    pub fn to_fuser(&self) -> Vec<fuser::MountOption> {
        use fuser::MountOption;

        self.options
            .iter()
            .map(|opt| {
                let opt = opt.trim();
                if let Some(name) = opt.strip_prefix("fsname=") {
                    return MountOption::FSName(name.to_string());
                }
                if let Some(name) = opt.strip_prefix("subtype=") {
                    return MountOption::Subtype(name.to_string());
                }
                match opt {
                    "ro" => MountOption::RO,
                    "rw" => MountOption::RW,
                    "allow_other" => MountOption::AllowOther,
                    "allow_root" => MountOption::AllowRoot,
                    "default_permissions" => MountOption::DefaultPermissions,
                    "auto_unmount" => MountOption::AutoUnmount,
                    "dev" => MountOption::Dev,
                    "nodev" => MountOption::NoDev,
                    "suid" => MountOption::Suid,
                    "nosuid" => MountOption::NoSuid,
                    "exec" => MountOption::Exec,
                    "noexec" => MountOption::NoExec,
                    "sync" => MountOption::Sync,
                    "async" => MountOption::Async,
                    "atime" => MountOption::Atime,
                    "noatime" => MountOption::NoAtime,
                    "dirsync" => MountOption::DirSync,
                    other => MountOption::CUSTOM(other.to_string()),
                }
            })
            .collect()
    }
}

/// Validate a mountpoint path.
pub fn validate_mountpoint(path: &Path) -> Result<(), MountError> {
    if !path.exists() {
        return Err(MountError::PathNotFound(path.display().to_string()));
    }

    if !path.is_dir() {
        return Err(MountError::NotADirectory(path.display().to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_options_are_empty() {
        let opts = MountOptions::default();
        assert!(opts.is_empty());
        assert_eq!(opts.assembled(), "");
    }

    #[test]
    fn test_assembled_joins_with_comma() {
        let opts = MountOptions::new(["ro", "allow_other", "fsname=demo"]);
        assert_eq!(opts.assembled(), "ro,allow_other,fsname=demo");
    }

    #[test]
    fn test_validate_rejects_embedded_separator() {
        let opts = MountOptions::new(["ro,noexec"]);
        assert!(matches!(opts.validate(), Err(MountError::InvalidOption(_))));
    }

    #[test]
    fn test_validate_rejects_empty_entry() {
        let opts = MountOptions::new(["ro", " "]);
        assert!(matches!(opts.validate(), Err(MountError::InvalidOption(_))));
    }

    #[test]
    fn test_push_and_contains() {
        let mut opts = MountOptions::new(["ro"]);
        opts.push("allow_other");
        assert!(opts.contains("allow_other"));
        assert!(!opts.contains("rw"));
        assert_eq!(opts.assembled(), "ro,allow_other");
    }

    #[test]
    fn test_to_fuser_known_names() {
        let opts = MountOptions::new(["ro", "allow_other", "default_permissions", "noexec"]);
        let fuser_opts = opts.to_fuser();
        assert!(fuser_opts
            .iter()
            .any(|o| matches!(o, fuser::MountOption::RO)));
        assert!(fuser_opts
            .iter()
            .any(|o| matches!(o, fuser::MountOption::AllowOther)));
        assert!(fuser_opts
            .iter()
            .any(|o| matches!(o, fuser::MountOption::DefaultPermissions)));
        assert!(fuser_opts
            .iter()
            .any(|o| matches!(o, fuser::MountOption::NoExec)));
    }

    #[test]
    fn test_to_fuser_named_values() {
        let opts = MountOptions::new(["fsname=hello", "subtype=bridge"]);
        let fuser_opts = opts.to_fuser();
        assert!(fuser_opts
            .iter()
            .any(|o| matches!(o, fuser::MountOption::FSName(s) if s == "hello")));
        assert!(fuser_opts
            .iter()
            .any(|o| matches!(o, fuser::MountOption::Subtype(s) if s == "bridge")));
    }

    #[test]
    fn test_to_fuser_unknown_passes_through() {
        let opts = MountOptions::new(["max_read=65536"]);
        let fuser_opts = opts.to_fuser();
        assert!(matches!(
            &fuser_opts[0],
            fuser::MountOption::CUSTOM(s) if s == "max_read=65536"
        ));
    }

    #[test]
    fn test_validate_mountpoint_with_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_mountpoint(dir.path()).is_ok());
    }

    #[test]
    fn test_validate_mountpoint_with_nonexistent_path() {
        let result = validate_mountpoint(Path::new("/nonexistent_path_12345"));
        assert!(matches!(result, Err(MountError::PathNotFound(_))));
    }

    #[test]
    fn test_validate_mountpoint_with_file_not_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, "test").unwrap();

        let result = validate_mountpoint(&file);
        assert!(matches!(result, Err(MountError::NotADirectory(_))));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: MountError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, MountError::PermissionDenied(_)));
    }
}
