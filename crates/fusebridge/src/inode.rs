//! Inode numbers for a path-addressed filesystem.
//!
//! The kernel addresses files by inode while handlers address them by path.
//! `PathTable` hands out an inode for every path the kernel has looked up
//! and keeps it until the kernel forgets it.

use std::collections::HashMap;

pub type InodeId = u64;
pub const ROOT_INODE: InodeId = 1;

#[derive(Debug)]
struct PathEntry {
    path: String,
    lookups: u64,
}

#[derive(Debug)]
pub struct PathTable {
    by_ino: HashMap<InodeId, PathEntry>,
    by_path: HashMap<String, InodeId>,
    next_ino: InodeId,
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTable {
    pub fn new() -> Self {
        let mut table = PathTable {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next_ino: ROOT_INODE + 1,
        };
        table.by_ino.insert(
            ROOT_INODE,
            PathEntry {
                path: "/".to_string(),
                lookups: 1,
            },
        );
        table.by_path.insert("/".to_string(), ROOT_INODE);
        table
    }

    pub fn path(&self, ino: InodeId) -> Option<&str> {
        self.by_ino.get(&ino).map(|e| e.path.as_str())
    }

    pub fn child_path(&self, parent: InodeId, name: &str) -> Option<String> {
        self.path(parent).map(|p| join(p, name))
    }

    /// Returns the inode for `path`, allocating one if needed, and counts
    /// one kernel lookup against it.
    pub fn lookup(&mut self, path: &str) -> InodeId {
        if let Some(&ino) = self.by_path.get(path) {
            if let Some(entry) = self.by_ino.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_ino.insert(
            ino,
            PathEntry {
                path: path.to_string(),
                lookups: 1,
            },
        );
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    /// The inode already assigned to `path`, without counting a lookup.
    pub fn ino_of(&self, path: &str) -> Option<InodeId> {
        self.by_path.get(path).copied()
    }

    pub fn forget(&mut self, ino: InodeId, n: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let remove = match self.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(n);
                entry.lookups == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = self.by_ino.remove(&ino) {
                if self.by_path.get(&entry.path) == Some(&ino) {
                    self.by_path.remove(&entry.path);
                }
            }
        }
    }

    /// Drops the path mapping of a removed file. The inode stays resolvable
    /// until the kernel forgets it.
    pub fn unlink(&mut self, path: &str) {
        self.by_path.remove(path);
    }

    /// Moves `from`, and everything below it, to `to`.
    pub fn rename(&mut self, from: &str, to: &str) {
        self.by_path.remove(to);
        let prefix = format!("{}/", from);
        let moved: Vec<(String, InodeId)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() == from || p.starts_with(&prefix))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old, ino) in moved {
            let new = format!("{}{}", to, &old[from.len()..]);
            self.by_path.remove(&old);
            self.by_path.insert(new.clone(), ino);
            if let Some(entry) = self.by_ino.get_mut(&ino) {
                entry.path = new;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}
