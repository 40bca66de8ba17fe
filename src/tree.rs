//! In-memory filesystem tree: a node arena with explicit indices rather
//! than sprinkled `Rc`/`RefCell` ownership, per the Design Notes.
//!
//! Nodes are linked parent + first-child + next-sibling, exactly as a
//! `tree_node_t` graph would be, with an additional flat `files()` list
//! built as a post-processing pass (the "next-by-type" chain) so the
//! block processor can walk regular files without recursing the tree.

use std::path::{Path, PathBuf};

use crate::file::FileOptions;

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub enum NodeKind {
    Dir,
    RegularFile {
        /// Host path bytes are read from; absent for manifest-only nodes
        /// materialised entirely from other means (never the case today,
        /// but kept optional for forward compatibility).
        source: PathBuf,
        options: FileOptions,
    },
    Symlink {
        target: PathBuf,
    },
    HardLink {
        target: PathBuf,
    },
    CharDevice {
        major: u32,
        minor: u32,
    },
    BlockDevice {
        major: u32,
        minor: u32,
    },
    Fifo,
    Socket,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: PathBuf,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub first_child: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
    pub xattrs: Vec<(String, Vec<u8>)>,
    pub selinux_context: Option<String>,
}

impl Node {
    fn new(name: PathBuf, mode: u16, uid: u32, gid: u32, mtime: u32, kind: NodeKind) -> Self {
        Self {
            name,
            mode,
            uid,
            gid,
            mtime,
            kind,
            parent: None,
            first_child: None,
            next_sibling: None,
            xattrs: Vec::new(),
            selinux_context: None,
        }
    }
}

/// The full filesystem tree, flattened into an arena. Index `0` is always
/// the root directory.
#[derive(Debug, Default)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn new(root_mode: u16, root_uid: u32, root_gid: u32, root_mtime: u32) -> Self {
        let root = Node::new(
            PathBuf::from("/"),
            root_mode,
            root_uid,
            root_gid,
            root_mtime,
            NodeKind::Dir,
        );
        Self { nodes: vec![root] }
    }

    pub const ROOT: NodeId = 0;

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.nodes[id].first_child;
        while let Some(c) = cur {
            out.push(c);
            cur = self.nodes[c].next_sibling;
        }
        out
    }

    /// Appends a new child node under `parent`, linking it into the
    /// first-child/next-sibling chain. Children are appended in insertion
    /// order (callers that need sorted output, e.g. for directory table
    /// writers, sort the result of [`Tree::children`] themselves).
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        name: PathBuf,
        mode: u16,
        uid: u32,
        gid: u32,
        mtime: u32,
        kind: NodeKind,
    ) -> NodeId {
        let mut node = Node::new(name, mode, uid, gid, mtime, kind);
        node.parent = Some(parent);
        let id = self.nodes.len();
        self.nodes.push(node);

        match self.nodes[parent].first_child {
            None => self.nodes[parent].first_child = Some(id),
            Some(first) => {
                let mut last = first;
                while let Some(next) = self.nodes[last].next_sibling {
                    last = next;
                }
                self.nodes[last].next_sibling = Some(id);
            }
        }
        id
    }

    /// Finds (or creates, if `create_dirs` is set) the node for a
    /// canonicalised absolute path, creating intermediate directories
    /// along the way when they don't already exist.
    pub fn find_or_create_dir(&mut self, path: &Path, mtime: u32) -> NodeId {
        let mut cur = Self::ROOT;
        for component in path.components().filter(|c| {
            !matches!(
                c,
                std::path::Component::RootDir | std::path::Component::CurDir
            )
        }) {
            let name = PathBuf::from(component.as_os_str());
            let existing = self
                .children(cur)
                .into_iter()
                .find(|&c| self.nodes[c].name == name);
            cur = match existing {
                Some(id) => id,
                None => self.insert_child(cur, name, 0o755, 0, 0, mtime, NodeKind::Dir),
            };
        }
        cur
    }

    pub fn path_of(&self, id: NodeId) -> PathBuf {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            if c == Self::ROOT {
                break;
            }
            parts.push(self.nodes[c].name.clone());
            cur = self.nodes[c].parent;
        }
        parts.reverse();
        let mut path = PathBuf::from("/");
        for p in parts {
            path.push(p);
        }
        path
    }

    /// The "next-by-type" list: every regular-file node, in tree
    /// insertion order. Built as a post-processing pass over the arena
    /// rather than maintained incrementally, matching the Design Notes.
    pub fn regular_files(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.kind, NodeKind::RegularFile { .. }))
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_or_create_dir_reuses_existing_path() {
        let mut tree = Tree::new(0o755, 0, 0, 0);
        let a = tree.find_or_create_dir(Path::new("/a/b"), 0);
        let b = tree.find_or_create_dir(Path::new("/a/b"), 0);
        assert_eq!(a, b);
    }

    #[test]
    fn path_of_round_trips() {
        let mut tree = Tree::new(0o755, 0, 0, 0);
        let dir = tree.find_or_create_dir(Path::new("/usr/lib"), 0);
        assert_eq!(tree.path_of(dir), PathBuf::from("/usr/lib"));
    }

    #[test]
    fn regular_files_lists_insertion_order() {
        let mut tree = Tree::new(0o755, 0, 0, 0);
        let dir = tree.find_or_create_dir(Path::new("/bin"), 0);
        let f1 = tree.insert_child(
            dir,
            PathBuf::from("a"),
            0o644,
            0,
            0,
            0,
            NodeKind::RegularFile {
                source: PathBuf::from("a"),
                options: FileOptions::default(),
            },
        );
        let f2 = tree.insert_child(
            dir,
            PathBuf::from("b"),
            0o644,
            0,
            0,
            0,
            NodeKind::RegularFile {
                source: PathBuf::from("b"),
                options: FileOptions::default(),
            },
        );
        assert_eq!(tree.regular_files(), vec![f1, f2]);
    }
}
