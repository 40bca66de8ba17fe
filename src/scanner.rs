//! Directory scanner and manifest materialiser: turns either a host
//! directory tree or a parsed manifest into the [`crate::tree::Tree`]
//! arena the block processor walks.
//!
//! Out of scope per spec §1 except as a caller for the core: this module
//! exists so the CLI surface in §6 is reachable end to end, but its
//! correctness is secondary to the block processor it feeds.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use glob::Pattern;

use crate::error::SqfsBuildError;
use crate::file::FileOptions;
use crate::manifest::{EntryKind, GlobOptions, GlobType, ManifestEntry, Mode, OptionalId};
use crate::tree::{NodeKind, Tree};

#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerOverride {
    pub force_uid: Option<u32>,
    pub force_gid: Option<u32>,
}

impl OwnerOverride {
    fn apply(self, uid: u32, gid: u32) -> (u32, u32) {
        (self.force_uid.unwrap_or(uid), self.force_gid.unwrap_or(gid))
    }
}

/// Parses a `<priority> <path>` sort-file: higher priority sorts first.
/// Blank lines and `#`-comments are ignored, matching the manifest
/// grammar's comment conventions.
pub fn parse_sort_file(contents: &str) -> Vec<(i64, PathBuf)> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let Some(priority) = parts.next() else { continue };
        let Some(path) = parts.next() else { continue };
        if let Ok(priority) = priority.parse::<i64>() {
            out.push((priority, PathBuf::from(path.trim())));
        }
    }
    out
}

/// Re-sorts a file list so higher sort-file priority entries come first;
/// entries absent from the sort file keep their relative order and sort
/// after every entry that was named.
pub fn apply_sort_order(paths: &mut [PathBuf], priorities: &[(i64, PathBuf)]) {
    let rank = |p: &Path| -> (i64, usize) {
        priorities
            .iter()
            .position(|(_, sp)| sp == p)
            .map(|idx| (-priorities[idx].0, idx))
            .unwrap_or((1, usize::MAX))
    };
    paths.sort_by_key(|p| rank(p));
}

pub struct ScanOptions {
    pub owner: OwnerOverride,
    pub keep_mtime: bool,
    pub fixed_mtime: u32,
}

/// Recursively scans a host directory, inserting every entry under
/// `dest` in the tree. `xdev`/`nonrecursive`/`max_depth` mirror the glob
/// line options; a plain directory scan (no manifest) uses the defaults
/// (cross filesystems, fully recursive).
pub fn scan_directory(
    tree: &mut Tree,
    dest: crate::tree::NodeId,
    host_dir: &Path,
    opts: &ScanOptions,
    xdev: bool,
    nonrecursive: bool,
    root_dev: Option<u64>,
) -> Result<(), SqfsBuildError> {
    let mut entries: Vec<_> = fs::read_dir(host_dir)
        .map_err(|e| SqfsBuildError::io(host_dir, e))?
        .collect::<Result<_, _>>()
        .map_err(|e| SqfsBuildError::io(host_dir, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let meta = entry.metadata().map_err(|e| SqfsBuildError::io(&path, e))?;
        let file_type = meta.file_type();

        if xdev {
            if let Some(root_dev) = root_dev {
                if meta.dev() != root_dev {
                    continue;
                }
            }
        }

        let (uid, gid) = opts.owner.apply(meta.uid(), meta.gid());
        let mtime = if opts.keep_mtime {
            meta.mtime() as u32
        } else {
            opts.fixed_mtime
        };
        let mode = (meta.mode() & 0o7777) as u16;
        let name = PathBuf::from(entry.file_name());

        if file_type.is_dir() {
            let child = tree.insert_child(dest, name, mode, uid, gid, mtime, NodeKind::Dir);
            if !nonrecursive {
                scan_directory(tree, child, &path, opts, xdev, nonrecursive, root_dev)?;
            }
        } else if file_type.is_file() {
            tree.insert_child(
                dest,
                name,
                mode,
                uid,
                gid,
                mtime,
                NodeKind::RegularFile {
                    source: path,
                    options: FileOptions::default(),
                },
            );
        } else if file_type.is_symlink() {
            let target = fs::read_link(&path).map_err(|e| SqfsBuildError::io(&path, e))?;
            tree.insert_child(dest, name, mode, uid, gid, mtime, NodeKind::Symlink { target });
        } else if file_type.is_char_device() {
            let rdev = meta.rdev();
            tree.insert_child(
                dest,
                name,
                mode,
                uid,
                gid,
                mtime,
                NodeKind::CharDevice {
                    major: major(rdev),
                    minor: minor(rdev),
                },
            );
        } else if file_type.is_block_device() {
            let rdev = meta.rdev();
            tree.insert_child(
                dest,
                name,
                mode,
                uid,
                gid,
                mtime,
                NodeKind::BlockDevice {
                    major: major(rdev),
                    minor: minor(rdev),
                },
            );
        } else if file_type.is_fifo() {
            tree.insert_child(dest, name, mode, uid, gid, mtime, NodeKind::Fifo);
        } else if file_type.is_socket() {
            tree.insert_child(dest, name, mode, uid, gid, mtime, NodeKind::Socket);
        }
    }
    Ok(())
}

fn major(rdev: u64) -> u32 {
    nix::sys::stat::major(rdev) as u32
}

fn minor(rdev: u64) -> u32 {
    nix::sys::stat::minor(rdev) as u32
}

fn glob_type_matches(file_type: &fs::FileType, allowed: &Option<Vec<GlobType>>) -> bool {
    let Some(allowed) = allowed else { return true };
    allowed.iter().any(|t| match t {
        GlobType::Block => file_type.is_block_device(),
        GlobType::Char => file_type.is_char_device(),
        GlobType::Dir => file_type.is_dir(),
        GlobType::Pipe => file_type.is_fifo(),
        GlobType::File => file_type.is_file(),
        GlobType::Symlink => file_type.is_symlink(),
        GlobType::Socket => file_type.is_socket(),
    })
}

fn walk_glob(
    source_dir: &Path,
    rel_prefix: &Path,
    options: &GlobOptions,
    root_dev: Option<u64>,
    out: &mut Vec<(PathBuf, PathBuf)>,
) -> Result<(), SqfsBuildError> {
    let mut entries: Vec<_> = fs::read_dir(source_dir)
        .map_err(|e| SqfsBuildError::io(source_dir, e))?
        .collect::<Result<_, _>>()
        .map_err(|e| SqfsBuildError::io(source_dir, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let meta = entry.metadata().map_err(|e| SqfsBuildError::io(&path, e))?;
        if options.xdev {
            if let Some(root_dev) = root_dev {
                if meta.dev() != root_dev {
                    continue;
                }
            }
        }
        let rel = rel_prefix.join(entry.file_name());
        let file_type = meta.file_type();

        let name_ok = options
            .name_pattern
            .as_deref()
            .map(|p| Pattern::new(p).map(|pat| pat.matches_path(Path::new(&entry.file_name()))).unwrap_or(false))
            .unwrap_or(true);
        let path_ok = options
            .path_pattern
            .as_deref()
            .map(|p| Pattern::new(p).map(|pat| pat.matches_path(&rel)).unwrap_or(false))
            .unwrap_or(true);

        if name_ok && path_ok && glob_type_matches(&file_type, &options.allowed_types) {
            out.push((rel.clone(), path.clone()));
        }

        if file_type.is_dir() && !options.nonrecursive {
            walk_glob(&path, &rel, options, root_dev, out)?;
        }
    }
    Ok(())
}

fn resolve_mode(mode: Mode, fallback: u16) -> u16 {
    match mode {
        Mode::Value(v) => v,
        Mode::Preserve => fallback,
    }
}

fn resolve_id(id: OptionalId, fallback: u32) -> u32 {
    match id {
        OptionalId::Value(v) => v,
        OptionalId::Preserve => fallback,
    }
}

/// Applies a parsed manifest's entries to `tree`, in file order. Glob
/// entries are expanded against the host filesystem at this point.
pub fn apply_manifest(
    tree: &mut Tree,
    entries: &[ManifestEntry],
    opts: &ScanOptions,
) -> Result<(), SqfsBuildError> {
    for entry in entries {
        let parent_path = entry.path.parent().unwrap_or(Path::new("/"));
        let name = entry
            .path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));

        match &entry.kind {
            EntryKind::Dir => {
                // find_or_create_dir reuses a directory implicitly created
                // by an earlier file/nod/slink entry under this path,
                // rather than inserting a duplicate sibling node.
                let dir = tree.find_or_create_dir(&entry.path, opts.fixed_mtime);
                if dir != Tree::ROOT {
                    let node = tree.node_mut(dir);
                    node.mode = resolve_mode(entry.mode, node.mode);
                    node.uid = resolve_id(entry.uid, node.uid);
                    node.gid = resolve_id(entry.gid, node.gid);
                }
            }
            EntryKind::Symlink { target } => {
                let parent = tree.find_or_create_dir(parent_path, opts.fixed_mtime);
                let mode = resolve_mode(entry.mode, 0o777);
                let uid = resolve_id(entry.uid, 0);
                let gid = resolve_id(entry.gid, 0);
                tree.insert_child(
                    parent,
                    name,
                    mode,
                    uid,
                    gid,
                    opts.fixed_mtime,
                    NodeKind::Symlink {
                        target: target.clone(),
                    },
                );
            }
            EntryKind::Link { source } => {
                let parent = tree.find_or_create_dir(parent_path, opts.fixed_mtime);
                let mode = resolve_mode(entry.mode, 0o644);
                let uid = resolve_id(entry.uid, 0);
                let gid = resolve_id(entry.gid, 0);
                tree.insert_child(
                    parent,
                    name,
                    mode,
                    uid,
                    gid,
                    opts.fixed_mtime,
                    NodeKind::HardLink {
                        target: source.clone(),
                    },
                );
            }
            EntryKind::Node { is_char, major, minor } => {
                let parent = tree.find_or_create_dir(parent_path, opts.fixed_mtime);
                let mode = resolve_mode(entry.mode, 0o600);
                let uid = resolve_id(entry.uid, 0);
                let gid = resolve_id(entry.gid, 0);
                let kind = if *is_char {
                    NodeKind::CharDevice {
                        major: *major,
                        minor: *minor,
                    }
                } else {
                    NodeKind::BlockDevice {
                        major: *major,
                        minor: *minor,
                    }
                };
                tree.insert_child(parent, name, mode, uid, gid, opts.fixed_mtime, kind);
            }
            EntryKind::Pipe => {
                let parent = tree.find_or_create_dir(parent_path, opts.fixed_mtime);
                let mode = resolve_mode(entry.mode, 0o600);
                let uid = resolve_id(entry.uid, 0);
                let gid = resolve_id(entry.gid, 0);
                tree.insert_child(parent, name, mode, uid, gid, opts.fixed_mtime, NodeKind::Fifo);
            }
            EntryKind::Sock => {
                let parent = tree.find_or_create_dir(parent_path, opts.fixed_mtime);
                let mode = resolve_mode(entry.mode, 0o600);
                let uid = resolve_id(entry.uid, 0);
                let gid = resolve_id(entry.gid, 0);
                tree.insert_child(parent, name, mode, uid, gid, opts.fixed_mtime, NodeKind::Socket);
            }
            EntryKind::File { host_path } => {
                let parent = tree.find_or_create_dir(parent_path, opts.fixed_mtime);
                let mode = resolve_mode(entry.mode, 0o644);
                let uid = resolve_id(entry.uid, 0);
                let gid = resolve_id(entry.gid, 0);
                tree.insert_child(
                    parent,
                    name,
                    mode,
                    uid,
                    gid,
                    opts.fixed_mtime,
                    NodeKind::RegularFile {
                        source: host_path.clone(),
                        options: FileOptions::default(),
                    },
                );
            }
            EntryKind::Glob { options, source_dir } => {
                let root_dev = if options.xdev {
                    fs::metadata(source_dir).ok().map(|m| m.dev())
                } else {
                    None
                };
                let mut matches = Vec::new();
                walk_glob(source_dir, Path::new(""), options, root_dev, &mut matches)?;
                for (rel, host_path) in matches {
                    let dest_path = entry.path.join(&rel);
                    let parent = tree.find_or_create_dir(
                        dest_path.parent().unwrap_or(Path::new("/")),
                        opts.fixed_mtime,
                    );
                    let meta = fs::symlink_metadata(&host_path).map_err(|e| SqfsBuildError::io(&host_path, e))?;
                    let (uid, gid) = opts.owner.apply(meta.uid(), meta.gid());
                    let mode = (meta.mode() & 0o7777) as u16;
                    let mtime = if options.keeptime { meta.mtime() as u32 } else { opts.fixed_mtime };
                    let name = dest_path.file_name().map(PathBuf::from).unwrap_or_default();
                    let kind = if meta.file_type().is_dir() {
                        NodeKind::Dir
                    } else if meta.file_type().is_symlink() {
                        NodeKind::Symlink {
                            target: fs::read_link(&host_path).map_err(|e| SqfsBuildError::io(&host_path, e))?,
                        }
                    } else {
                        NodeKind::RegularFile {
                            source: host_path.clone(),
                            options: FileOptions::default(),
                        }
                    };
                    tree.insert_child(parent, name, mode, uid, gid, mtime, kind);
                }
            }
        }
    }
    Ok(())
}
