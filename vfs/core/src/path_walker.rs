//! Path traversal and symlink resolution over an [`FsBackend`].

use std::collections::{HashSet, VecDeque};

use tracing::trace;

use crate::path::{self, ROOT};
use crate::{
    DriverConfig, FileStat, FsBackend, ObjectHandle, ObjectStream, OpenFlags, VfsError,
    VfsErrorKind, VfsResult,
};

/// An object found by the walker, with the absolute path it was found at
/// and its metadata at that moment.
#[derive(Clone, Debug)]
pub struct Resolved<H> {
    pub handle: H,
    pub path: String,
    pub stat: FileStat,
}

/// Walks paths for one top-level operation.
///
/// The symlink hop budget is shared by every resolution the walker
/// performs, so cycles that pass through intermediate components terminate
/// as well as direct ones.
pub struct PathWalker<'a, B: FsBackend> {
    backend: &'a B,
    cwd: &'a str,
    config: &'a DriverConfig,
    hops: u16,
}

impl<'a, B: FsBackend> PathWalker<'a, B> {
    pub fn new(backend: &'a B, cwd: &'a str, config: &'a DriverConfig) -> Self {
        Self {
            backend,
            cwd,
            config,
            hops: 0,
        }
    }

    /// Absolute, lexically clean form of `path`.
    pub fn normalize(&self, path: &str) -> VfsResult<String> {
        let abs = path::normalize(self.cwd, path);
        self.check_path_len(&abs)?;
        Ok(abs)
    }

    /// Resolve every intermediate component, following symlinks, but leave
    /// the final component as found.
    pub fn resolve_no_follow(&mut self, path: &str) -> VfsResult<Resolved<B::Handle>> {
        let abs = self.normalize(path)?;
        self.walk(&abs, false)
    }

    /// [`resolve_no_follow`](Self::resolve_no_follow), then follow the final
    /// component if it is a symlink.
    pub fn resolve_following(&mut self, path: &str) -> VfsResult<Resolved<B::Handle>> {
        let abs = self.normalize(path)?;
        self.walk(&abs, true)
    }

    /// Resolve the directory that would contain `path`, plus the final name.
    pub fn resolve_parent(&mut self, path: &str) -> VfsResult<(Resolved<B::Handle>, String)> {
        let abs = self.normalize(path)?;
        let Some((parent_path, name)) = path::split_parent(&abs) else {
            return Err(VfsError::new(VfsErrorKind::AlreadyExists, "path.resolve_parent.root"));
        };
        self.check_name_len(name)?;
        let parent = self.walk(parent_path, true)?;
        if !parent.stat.is_dir() {
            return Err(VfsError::new(VfsErrorKind::NotDir, "path.resolve_parent.not_dir")
                .with_message(parent.path));
        }
        Ok((parent, name.to_string()))
    }

    /// Follow `object` until it is no longer a symlink.
    pub fn resolve_symlink(
        &mut self,
        object: Resolved<B::Handle>,
    ) -> VfsResult<Resolved<B::Handle>> {
        if !object.stat.is_symlink() {
            return Ok(object);
        }
        self.walk(&object.path, true)
    }

    /// Target text of a symlink object.
    pub fn read_link(&self, object: &Resolved<B::Handle>) -> VfsResult<String> {
        if !object.stat.is_symlink() {
            return Err(VfsError::new(VfsErrorKind::InvalidInput, "path.readlink")
                .with_message(format!("{} is a {}", object.path, object.stat.file_type())));
        }
        if object.stat.size > self.config.max_path_len as u64 {
            return Err(VfsError::new(VfsErrorKind::NameTooLong, "path.readlink")
                .with_message(object.path.clone()));
        }

        let mut stream = ObjectStream::from_object(
            object.handle.clone(),
            self.backend.block_size(),
            OpenFlags::READ,
        )?;
        let mut target = vec![0u8; stream.size() as usize];
        let read = stream.read_at(&mut target, 0)?;
        target.truncate(read);
        String::from_utf8(target).map_err(|err| {
            VfsError::new(VfsErrorKind::Corrupted, "path.readlink")
                .with_message(object.path.clone())
                .with_source(err)
        })
    }

    /// Look up `name` among the children of directory `parent`.
    pub fn child(&self, parent: &B::Handle, name: &str) -> VfsResult<B::Handle> {
        self.check_name_len(name)?;
        let names = parent.list_dir()?;
        if !names.iter().any(|entry| entry == name) {
            return Err(VfsError::new(VfsErrorKind::NotFound, "path.lookup")
                .with_message(name.to_string()));
        }
        self.backend.get_object(name, parent)
    }

    /// Walk a normalized absolute path one component at a time.
    ///
    /// A followed symlink's target is made absolute against the directory
    /// holding the link and spliced in front of the remaining components.
    /// Each chain of links gets its own visited set; revisiting a link of
    /// the chain fails with `TooManySymlinks`. Every hop also counts
    /// against the walker's budget.
    fn walk(&mut self, abs: &str, follow_final: bool) -> VfsResult<Resolved<B::Handle>> {
        let mut queue = WorkQueue::from_path(abs);
        let mut chains: Vec<LinkChain> = Vec::new();
        let mut current = self.root()?;

        while let Some(name) = queue.pop_front() {
            let is_final = queue.is_empty();
            if !current.stat.is_dir() {
                return Err(VfsError::new(VfsErrorKind::NotDir, "path.resolve.not_dir")
                    .with_message(current.path));
            }

            let handle = self.child(&current.handle, &name)?;
            let stat = handle.stat()?;
            let child = Resolved {
                handle,
                path: path::join(&current.path, &name),
                stat,
            };
            if !child.stat.is_symlink() || (is_final && !follow_final) {
                current = child;
                continue;
            }

            self.hops += 1;
            if self.hops > self.config.max_symlinks {
                return Err(
                    VfsError::new(VfsErrorKind::TooManySymlinks, "path.symlink.depth")
                        .with_message(child.path),
                );
            }

            // A link that ends the previous link's target continues that
            // chain; one met part way through a target starts a nested one.
            let remaining = queue.len();
            while chains.last().is_some_and(|chain| chain.remaining > remaining) {
                chains.pop();
            }
            if chains.last().is_none_or(|chain| chain.remaining != remaining) {
                chains.push(LinkChain {
                    remaining,
                    visited: HashSet::new(),
                });
            }
            if let Some(chain) = chains.last_mut() {
                if !chain.visited.insert(child.path.clone()) {
                    return Err(
                        VfsError::new(VfsErrorKind::TooManySymlinks, "path.symlink.loop")
                            .with_message(child.path),
                    );
                }
            }

            let target = self.read_link(&child)?;
            if target.is_empty() {
                return Err(VfsError::new(VfsErrorKind::NotFound, "path.symlink.empty")
                    .with_message(child.path));
            }
            let next = path::normalize(&current.path, &target);
            self.check_path_len(&next)?;

            trace!(from = %child.path, to = %next, "following symlink");
            queue.inject_symlink(&next);
            current = self.root()?;
        }
        Ok(current)
    }

    fn root(&self) -> VfsResult<Resolved<B::Handle>> {
        let handle = self.backend.root()?;
        let stat = handle.stat()?;
        Ok(Resolved {
            handle,
            path: ROOT.to_string(),
            stat,
        })
    }

    fn check_path_len(&self, path: &str) -> VfsResult<()> {
        if path.len() > self.config.max_path_len {
            return Err(VfsError::new(VfsErrorKind::NameTooLong, "path.len")
                .with_message(format!("{} bytes", path.len())));
        }
        Ok(())
    }

    fn check_name_len(&self, name: &str) -> VfsResult<()> {
        if name.len() > self.config.max_name_len {
            return Err(VfsError::new(VfsErrorKind::NameTooLong, "path.name")
                .with_message(name.to_string()));
        }
        Ok(())
    }
}

/// Links followed back to back. `remaining` is the number of queued
/// components left behind the first link of the chain.
struct LinkChain {
    remaining: usize,
    visited: HashSet<String>,
}

/// Components still to walk, front first.
struct WorkQueue {
    items: VecDeque<String>,
}

impl WorkQueue {
    fn from_path(abs: &str) -> Self {
        Self {
            items: components(abs).collect(),
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn pop_front(&mut self) -> Option<String> {
        self.items.pop_front()
    }

    /// Put the components of an absolute symlink target in front of what
    /// is left.
    fn inject_symlink(&mut self, target: &str) {
        let mut next: VecDeque<String> = components(target).collect();
        next.append(&mut self.items);
        self.items = next;
    }
}

fn components(abs: &str) -> impl Iterator<Item = String> + '_ {
    abs.split('/')
        .filter(|component| !component.is_empty())
        .map(str::to_string)
}
