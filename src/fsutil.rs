//! Filesystem helpers shared by the cache tables and the mount engine
//!
//! Everything here is blocking; async callers wrap it in
//! `tokio::task::spawn_blocking`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// The OS identity a task (or the worker) runs as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsIdentity {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
}

impl OsIdentity {
    /// Identity of the running worker process
    pub fn current() -> Self {
        #[cfg(unix)]
        {
            use nix::unistd::{getgid, getuid, User};

            let uid = getuid();
            let username = User::from_uid(uid)
                .ok()
                .flatten()
                .map(|user| user.name)
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| uid.to_string());

            Self {
                uid: uid.as_raw(),
                gid: getgid().as_raw(),
                username,
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                uid: 0,
                gid: 0,
                username: std::env::var("USERNAME").unwrap_or_default(),
            }
        }
    }
}

/// Hex encoded SHA256 of a file's contents
pub fn sha256_file(path: &Path) -> io::Result<String> {
    sha256_reader(fs::File::open(path)?)
}

/// Hex encoded SHA256 of everything left in `reader`
pub fn sha256_reader(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex encoded SHA256 of a byte slice
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Move `from` to `to`, falling back to copy+delete when the two paths are
/// on different devices.
///
/// The fallback is not atomic: if the copy succeeds and the delete fails,
/// both paths exist and an error is returned. Callers treat any error as
/// "the move did not happen" and clean up both sides themselves.
pub fn rename_cross_device(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            debug!(
                "{} and {} are on different devices, copying",
                from.display(),
                to.display()
            );
            copy_recursive(from, to)?;
            remove_path(from)
        }
        Err(e) => Err(e),
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// Copy a file, directory tree or symlink, preserving permissions
pub fn copy_recursive(from: &Path, to: &Path) -> io::Result<()> {
    let mut directories = Vec::new();
    for entry in WalkDir::new(from).follow_links(false).follow_root_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(from).map_err(io::Error::other)?;
        let dest = if relative.as_os_str().is_empty() {
            to.to_path_buf()
        } else {
            to.join(relative)
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &dest)?;
            #[cfg(not(unix))]
            {
                let _ = target;
                fs::copy(entry.path(), &dest)?;
            }
        } else if file_type.is_dir() {
            fs::create_dir(&dest)?;
            directories.push((dest, entry.metadata()?.permissions()));
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }

    // Directory modes go on last so read-only directories can still be filled
    for (dir, permissions) in directories.into_iter().rev() {
        fs::set_permissions(dir, permissions)?;
    }
    Ok(())
}

/// Remove a file or directory tree. A path that is already gone is not an
/// error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Recursively hand everything owned by `previous_uid` under `path` over to
/// `new_owner`. A no-op when both identities are the same uid.
pub fn exchange_ownership(path: &Path, previous_uid: u32, new_owner: &OsIdentity) -> io::Result<()> {
    if previous_uid == new_owner.uid {
        return Ok(());
    }
    debug!(
        "Changing ownership of {} from uid {} to uid {}",
        path.display(),
        previous_uid,
        new_owner.uid
    );
    walk(path, true, |p, meta| {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if meta.uid() == previous_uid {
                std::os::unix::fs::lchown(p, Some(new_owner.uid), Some(new_owner.gid))?;
            }
        }
        #[cfg(not(unix))]
        let _ = (p, meta);
        Ok(())
    })
}

/// Make `path` (and with `recurse`, everything below it) owned by and
/// read/writable for `identity`.
pub fn grant_access(path: &Path, identity: &OsIdentity, recurse: bool) -> io::Result<()> {
    walk(path, recurse, |p, meta| {
        #[cfg(unix)]
        {
            use std::os::unix::fs::{MetadataExt, PermissionsExt};
            if meta.file_type().is_symlink() {
                return Ok(());
            }
            if meta.uid() != identity.uid {
                std::os::unix::fs::lchown(p, Some(identity.uid), Some(identity.gid))?;
            }
            let owner_bits = if meta.is_dir() { 0o700 } else { 0o600 };
            let mode = meta.permissions().mode();
            if mode & owner_bits != owner_bits {
                fs::set_permissions(p, fs::Permissions::from_mode(mode | owner_bits))?;
            }
        }
        #[cfg(not(unix))]
        let _ = (p, meta, identity);
        Ok(())
    })
}

/// Visit `path` and, with `recurse`, everything below it. Symlinks are
/// visited but never followed.
fn walk(
    path: &Path,
    recurse: bool,
    mut f: impl FnMut(&Path, &fs::Metadata) -> io::Result<()>,
) -> io::Result<()> {
    let mut walker = WalkDir::new(path).follow_links(false).follow_root_links(false);
    if !recurse {
        walker = walker.max_depth(0);
    }
    for entry in walker {
        let entry = entry?;
        let meta = entry.metadata()?;
        f(entry.path(), &meta)?;
    }
    Ok(())
}

/// Restrict files to owner read/write
pub fn secure_files(paths: &[&Path]) -> io::Result<()> {
    for path in paths {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        #[cfg(not(unix))]
        let _ = path;
    }
    Ok(())
}

/// Create (or truncate) a file readable only by its owner
pub fn create_private_file(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.read(true).write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Create (or truncate) `path` for writing, failing if its last component
/// is a symlink
pub fn create_no_follow(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(nix::fcntl::OFlag::O_NOFOLLOW.bits());
    }
    options.open(path)
}

/// Write `value` as pretty JSON via a temporary file and a rename, so a crash
/// never leaves a half-written snapshot behind
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = create_private_file(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    secure_files(&[path])
}

/// Bytes available to unprivileged users on the filesystem holding `path`
pub fn free_space(path: &Path) -> io::Result<u64> {
    #[cfg(unix)]
    {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        #[allow(clippy::unnecessary_cast)]
        let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(available)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(u64::MAX)
    }
}

/// Resolve a task-relative mount path inside `task_dir`.
///
/// Absolute paths, `..` components and the task directory itself are
/// rejected. So is a path passing through a symlink that already exists
/// below `task_dir`, since writing through it could land anywhere.
pub fn resolve_in_task_dir(task_dir: &Path, relative: &Path) -> Result<PathBuf, String> {
    let mut resolved = task_dir.to_path_buf();
    let mut on_disk = true;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                if on_disk {
                    match fs::symlink_metadata(&resolved) {
                        Ok(meta) if meta.file_type().is_symlink() => {
                            return Err(format!(
                                "path must not pass through symlink {}",
                                resolved.display()
                            ))
                        }
                        Ok(_) => {}
                        Err(_) => on_disk = false,
                    }
                }
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err("path must not contain '..' components".to_string())
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err("path must be relative to the task directory".to_string())
            }
        }
    }
    if resolved == task_dir {
        return Err("path must name an entry inside the task directory".to_string());
    }
    Ok(resolved)
}
