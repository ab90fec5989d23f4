use prost_types::FileDescriptorProto;
use std::collections::HashSet;

/// Stores every distinct file descriptor seen during a session, keyed by file name.
///
/// Files are kept in insertion order; adding a file whose name is already known is a no-op,
/// so the first descriptor acquired for a given name wins.
#[derive(Debug, Clone, Default)]
pub struct FileDescriptorCache {
    keys: HashSet<String>,
    files: Vec<FileDescriptorProto>,
}

impl FileDescriptorCache {
    pub fn new(files: impl IntoIterator<Item = FileDescriptorProto>) -> Self {
        let mut cache = Self::default();
        cache.extend(files);
        cache
    }

    /// Adds `file` unless a file with the same name is cached already.
    ///
    /// Returns `true` when the file was inserted.
    pub fn add(&mut self, file: FileDescriptorProto) -> bool {
        let key = file.name().to_string();
        if self.keys.insert(key) {
            self.files.push(file);
            true
        } else {
            false
        }
    }

    pub fn extend(&mut self, files: impl IntoIterator<Item = FileDescriptorProto>) {
        for file in files {
            self.add(file);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keys.contains(name)
    }

    pub fn files(&self) -> &[FileDescriptorProto] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
