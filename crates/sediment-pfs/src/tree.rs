//! File trees of commits.
//!
//! Only files are stored; directories are implied by the paths beneath them
//! and the root `/` always exists.

use sediment_core::ids::ObjectHash;
use sediment_core::repo::{FileInfo, FileType, ObjectRef, clean_path};
use sediment_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    files: BTreeMap<String, Vec<ObjectRef>>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append objects to the file at `path`, creating it if needed.
    pub fn append(
        &mut self,
        path: &str,
        objects: impl IntoIterator<Item = ObjectRef>,
    ) -> Result<()> {
        let path = clean_path(path);
        if path == "/" {
            return Err(Error::Other("cannot write to the root directory".into()));
        }
        if self.is_dir(&path) {
            return Err(Error::Other(format!("cannot write to {}: it is a directory", path)));
        }
        for ancestor in ancestors(&path) {
            if self.files.contains_key(&ancestor) {
                return Err(Error::Other(format!(
                    "cannot write to {}: {} is a file",
                    path, ancestor
                )));
            }
        }
        self.files.entry(path).or_default().extend(objects);
        Ok(())
    }

    /// Remove a file, or a directory with everything beneath it. Returns the
    /// number of files removed.
    pub fn delete(&mut self, path: &str) -> usize {
        let path = clean_path(path);
        if self.files.remove(&path).is_some() {
            return 1;
        }
        let doomed: Vec<String> = self.under(&path).map(|(p, _)| p.clone()).collect();
        for p in &doomed {
            self.files.remove(p);
        }
        doomed.len()
    }

    pub fn get(&self, path: &str) -> Option<&[ObjectRef]> {
        self.files.get(&clean_path(path)).map(|v| v.as_slice())
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let path = clean_path(path);
        path == "/" || self.under(&path).next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn inspect(&self, path: &str) -> Option<FileInfo> {
        let path = clean_path(path);
        if let Some(objects) = self.files.get(&path) {
            return Some(file_info(&path, objects));
        }
        if self.is_dir(&path) {
            return Some(self.dir_info(&path));
        }
        None
    }

    /// Direct children of a directory, sorted by path.
    pub fn list(&self, dir: &str) -> Result<Vec<FileInfo>> {
        let dir = clean_path(dir);
        if self.files.contains_key(&dir) {
            return Ok(vec![file_info(&dir, &self.files[&dir])]);
        }
        if !self.is_dir(&dir) {
            return Err(Error::FileNotFound {
                commit: String::new(),
                path: dir,
            });
        }
        let mut children = BTreeSet::new();
        let prefix = dir_prefix(&dir);
        for (path, _) in self.under(&dir) {
            let rest = &path[prefix.len()..];
            let name = rest.split('/').next().unwrap_or(rest);
            children.insert(format!("{}{}", prefix, name));
        }
        Ok(children
            .into_iter()
            .filter_map(|child| self.inspect(&child))
            .collect())
    }

    /// Every directory (including the root) and file, sorted by path.
    pub fn walk(&self) -> Vec<FileInfo> {
        let mut paths = BTreeSet::new();
        paths.insert("/".to_string());
        for path in self.files.keys() {
            paths.extend(ancestors(path));
            paths.insert(path.clone());
        }
        paths
            .into_iter()
            .filter_map(|p| self.inspect(&p))
            .collect()
    }

    /// Files at or beneath `path` with their objects.
    pub fn files_under(&self, path: &str) -> Vec<(String, Vec<ObjectRef>)> {
        let path = clean_path(path);
        if let Some(objects) = self.files.get(&path) {
            return vec![(path, objects.clone())];
        }
        self.under(&path)
            .map(|(p, objects)| (p.clone(), objects.clone()))
            .collect()
    }

    pub fn size_bytes(&self) -> u64 {
        self.files.values().map(|objects| objects_size(objects)).sum()
    }

    fn under<'a>(&'a self, dir: &str) -> impl Iterator<Item = (&'a String, &'a Vec<ObjectRef>)> + 'a {
        let prefix = dir_prefix(dir);
        self.files
            .range(prefix.clone()..)
            .take_while(move |(p, _)| p.starts_with(&prefix))
    }

    fn dir_info(&self, dir: &str) -> FileInfo {
        let prefix = dir_prefix(dir);
        let mut hasher = Sha256::new();
        let mut size = 0;
        for (path, objects) in self.under(dir) {
            hasher.update(path[prefix.len()..].as_bytes());
            hasher.update([0u8]);
            hasher.update(file_hash(objects).as_str().as_bytes());
            hasher.update([0u8]);
            size += objects_size(objects);
        }
        FileInfo {
            path: dir.to_string(),
            file_type: FileType::Dir,
            size_bytes: size,
            hash: ObjectHash::new(hex::encode(hasher.finalize())),
            objects: vec![],
        }
    }
}

fn dir_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Proper ancestors of a clean path, excluding the root.
fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut end = 0;
    while let Some(pos) = path[end + 1..].find('/') {
        end += pos + 1;
        out.push(path[..end].to_string());
    }
    out
}

fn objects_size(objects: &[ObjectRef]) -> u64 {
    objects.iter().map(|o| o.size_bytes).sum()
}

fn file_hash(objects: &[ObjectRef]) -> ObjectHash {
    let mut hasher = Sha256::new();
    for object in objects {
        hasher.update(object.hash.as_str().as_bytes());
        hasher.update([0u8]);
    }
    ObjectHash::new(hex::encode(hasher.finalize()))
}

fn file_info(path: &str, objects: &[ObjectRef]) -> FileInfo {
    FileInfo {
        path: path.to_string(),
        file_type: FileType::File,
        size_bytes: objects_size(objects),
        hash: file_hash(objects),
        objects: objects.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(hash: &str, size: u64) -> ObjectRef {
        ObjectRef {
            hash: ObjectHash::new(hash),
            size_bytes: size,
        }
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("/a/b/c"), vec!["/a".to_string(), "/a/b".to_string()]);
        assert!(ancestors("/a").is_empty());
    }

    #[test]
    fn test_append_accumulates() {
        let mut tree = FileTree::new();
        tree.append("file", [obj("aa", 4)]).unwrap();
        tree.append("/file", [obj("bb", 4)]).unwrap();
        let info = tree.inspect("/file").unwrap();
        assert_eq!(info.size_bytes, 8);
        assert_eq!(info.objects.len(), 2);
        assert_eq!(tree.size_bytes(), 8);
    }

    #[test]
    fn test_walk_includes_directories() {
        let mut tree = FileTree::new();
        tree.append("/dir/b", [obj("bb", 1)]).unwrap();
        tree.append("/dir/a", [obj("aa", 1)]).unwrap();
        tree.append("/top", [obj("cc", 1)]).unwrap();
        let paths: Vec<String> = tree.walk().into_iter().map(|f| f.path).collect();
        assert_eq!(paths, vec!["/", "/dir", "/dir/a", "/dir/b", "/top"]);
    }

    #[test]
    fn test_list_direct_children() {
        let mut tree = FileTree::new();
        tree.append("/dir/sub/x", [obj("aa", 1)]).unwrap();
        tree.append("/dir/y", [obj("bb", 1)]).unwrap();
        let listed = tree.list("/dir").unwrap();
        let paths: Vec<&str> = listed.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["/dir/sub", "/dir/y"]);
        assert_eq!(listed[0].file_type, FileType::Dir);
        assert!(tree.list("/missing").is_err());
    }

    #[test]
    fn test_directory_hash_tracks_content() {
        let mut a = FileTree::new();
        a.append("/d/x", [obj("aa", 1)]).unwrap();
        let mut b = a.clone();
        assert_eq!(a.inspect("/d").unwrap().hash, b.inspect("/d").unwrap().hash);
        b.append("/d/x", [obj("bb", 1)]).unwrap();
        assert_ne!(a.inspect("/d").unwrap().hash, b.inspect("/d").unwrap().hash);
        assert_eq!(a.inspect("/other"), None);
    }

    #[test]
    fn test_delete_directory() {
        let mut tree = FileTree::new();
        tree.append("/d/x", [obj("aa", 1)]).unwrap();
        tree.append("/d/y", [obj("bb", 1)]).unwrap();
        tree.append("/e", [obj("cc", 1)]).unwrap();
        assert_eq!(tree.delete("/d"), 2);
        assert!(!tree.is_dir("/d"));
        assert_eq!(tree.delete("/e"), 1);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_file_directory_conflicts() {
        let mut tree = FileTree::new();
        tree.append("/a", [obj("aa", 1)]).unwrap();
        assert!(tree.append("/a/b", [obj("bb", 1)]).is_err());
        tree.append("/d/x", [obj("aa", 1)]).unwrap();
        assert!(tree.append("/d", [obj("bb", 1)]).is_err());
        assert!(tree.append("/", [obj("bb", 1)]).is_err());
    }

    #[test]
    fn test_prefix_sibling_not_under_dir() {
        let mut tree = FileTree::new();
        tree.append("/dir/a", [obj("aa", 1)]).unwrap();
        tree.append("/dir2", [obj("bb", 1)]).unwrap();
        assert_eq!(tree.files_under("/dir").len(), 1);
    }
}
