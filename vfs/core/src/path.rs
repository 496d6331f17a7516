//! Lexical path handling. Nothing here touches storage.

use smallvec::SmallVec;

pub const ROOT: &str = "/";

/// Make `path` absolute against `cwd` and collapse `.`, `..`, repeated and
/// trailing separators. Backslashes are treated as separators. An empty
/// path means the working directory; `..` at the root stays at the root.
///
/// `cwd` must itself be absolute.
pub fn normalize(cwd: &str, path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut parts: SmallVec<[&str; 16]> = SmallVec::new();

    if !path.starts_with('/') {
        push_components(&mut parts, cwd);
    }
    push_components(&mut parts, &path);

    if parts.is_empty() {
        return ROOT.to_string();
    }
    let mut out = String::with_capacity(path.len() + cwd.len());
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

fn push_components<'a>(parts: &mut SmallVec<[&'a str; 16]>, path: &'a str) {
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
}

/// Split a normalized absolute path into its parent and final name.
/// The root has no parent.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path == ROOT {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { ROOT } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

/// Join a normalized directory path and a single name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

pub fn is_dot_entry(name: &str) -> bool {
    name == "." || name == ".."
}
