//! Integration tests for the manifest grammar and directory scanner,
//! covering scenarios S5 and S6 from spec.md §8.

use std::fs;
use std::path::{Path, PathBuf};

use sqfsimg::manifest::{parse_manifest, EntryKind};
use sqfsimg::scanner::{self, OwnerOverride, ScanOptions};
use sqfsimg::tree::{NodeKind, Tree};

fn scan_opts() -> ScanOptions {
    ScanOptions {
        owner: OwnerOverride::default(),
        keep_mtime: false,
        fixed_mtime: 0,
    }
}

#[test]
fn s5_manifest_file_and_device_node() {
    let manifest_path = Path::new("manifest");
    let text = "file /bin/sh 0755 0 0 sh.bin\nnod /dev/null 0666 0 0 c 1 3\n";
    let entries = parse_manifest(manifest_path, text).unwrap();

    let mut tree = Tree::new(0o755, 0, 0, 0);
    scanner::apply_manifest(&mut tree, &entries, &scan_opts()).unwrap();

    let bin_dir = tree
        .children(Tree::ROOT)
        .into_iter()
        .find(|&c| tree.node(c).name == PathBuf::from("bin"))
        .expect("bin directory created");
    let sh = tree
        .children(bin_dir)
        .into_iter()
        .find(|&c| tree.node(c).name == PathBuf::from("sh"))
        .expect("sh file created");
    match &tree.node(sh).kind {
        NodeKind::RegularFile { source, .. } => assert_eq!(source, Path::new("sh.bin")),
        other => panic!("expected regular file, got {other:?}"),
    }
    assert_eq!(tree.node(sh).mode, 0o755);

    let dev_dir = tree
        .children(Tree::ROOT)
        .into_iter()
        .find(|&c| tree.node(c).name == PathBuf::from("dev"))
        .expect("dev directory created");
    let null = tree
        .children(dev_dir)
        .into_iter()
        .find(|&c| tree.node(c).name == PathBuf::from("null"))
        .expect("null device created");
    match &tree.node(null).kind {
        NodeKind::CharDevice { major, minor } => {
            assert_eq!(*major, 1);
            assert_eq!(*minor, 3);
        }
        other => panic!("expected char device, got {other:?}"),
    }
}

#[test]
fn s6_glob_matches_by_name_under_source_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let lib_dir = tmp.path().join("lib");
    fs::create_dir(&lib_dir).unwrap();
    fs::write(lib_dir.join("libfoo.so"), b"so-bytes").unwrap();
    fs::write(lib_dir.join("libfoo.a"), b"a-bytes").unwrap();

    let manifest_path = Path::new("manifest");
    let text = format!(
        "glob /usr/lib * * * -type f -name \"*.so\" -- {}\n",
        lib_dir.display()
    );
    let entries = parse_manifest(manifest_path, &text).unwrap();

    let mut tree = Tree::new(0o755, 0, 0, 0);
    scanner::apply_manifest(&mut tree, &entries, &scan_opts()).unwrap();

    let usr = tree
        .children(Tree::ROOT)
        .into_iter()
        .find(|&c| tree.node(c).name == PathBuf::from("usr"))
        .expect("usr directory created");
    let lib = tree
        .children(usr)
        .into_iter()
        .find(|&c| tree.node(c).name == PathBuf::from("lib"))
        .expect("lib directory created");
    let children = tree.children(lib);

    assert!(children
        .iter()
        .any(|&c| tree.node(c).name == PathBuf::from("libfoo.so")));
    assert!(!children
        .iter()
        .any(|&c| tree.node(c).name == PathBuf::from("libfoo.a")));
}

#[test]
fn canonicalize_is_idempotent() {
    let file = Path::new("manifest");
    let once = sqfsimg::manifest::canonicalize_path(file, 1, "//usr//lib//").unwrap();
    let twice =
        sqfsimg::manifest::canonicalize_path(file, 1, once.to_str().unwrap()).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn rejects_unknown_entry_type() {
    let file = Path::new("manifest");
    let result = parse_manifest(file, "bogus /a 0755 0 0\n");
    assert!(result.is_err());
}

#[test]
fn slink_entry_records_target() {
    let file = Path::new("manifest");
    let entries = parse_manifest(file, "slink /bin/sh-link 0777 0 0 /bin/sh\n").unwrap();
    match &entries[0].kind {
        EntryKind::Symlink { target } => assert_eq!(target, Path::new("/bin/sh")),
        other => panic!("expected symlink entry, got {other:?}"),
    }
}
