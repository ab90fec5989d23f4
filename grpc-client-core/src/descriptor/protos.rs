use super::meta::{AcquireError, ServiceMetaList, ServiceMetaProvider};
use super::registry::TypeRegistry;
use prost_types::FileDescriptorProto;
use protox::file::{ChainFileResolver, File, FileResolver, GoogleFileResolver};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};

#[derive(Debug, thiserror::Error)]
pub enum ProtoSourceError {
    #[error("No proto files found in {0}")]
    NoProtoFiles(String),

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to compile proto files: {0}")]
    Compile(#[from] Box<protox::Error>),
}

/// The result of compiling a set of proto sources.
#[derive(Debug, Clone, Default)]
pub struct ProtoFiles {
    /// Names of the files that were found on disk, as opposed to their imports.
    pub roots: Vec<String>,
    /// The compiled files and all of their transitive imports.
    pub files: Vec<FileDescriptorProto>,
}

/// Reads service descriptors from `.proto` files on disk.
#[derive(Debug, Clone)]
pub struct ProtoSource {
    paths: Vec<PathBuf>,
    imports: Vec<PathBuf>,
}

impl ProtoSource {
    /// `paths` are proto files or directories of proto files; `imports` are extra
    /// directories searched for dependencies.
    pub fn new(paths: Vec<PathBuf>, imports: Vec<PathBuf>) -> Self {
        Self { paths, imports }
    }
}

impl ServiceMetaProvider for ProtoSource {
    async fn service_meta_list(&mut self) -> Result<ServiceMetaList, AcquireError> {
        let parsed = parse_proto_files(&self.paths, &self.imports)?;
        let extra = additional_files(&self.imports)?;

        tracing::debug!(
            roots = parsed.roots.len(),
            files = parsed.files.len(),
            "compiled proto sources"
        );

        let registry = TypeRegistry::new(parsed.files.into_iter().chain(extra.files))?;
        Ok(ServiceMetaList::from_files(Arc::new(registry), &parsed.roots))
    }
}

/// Compiles every proto file found under `paths`.
///
/// Each directory in `paths` becomes an import path, followed by `imports`. A single file is
/// named relative to the first of those directories containing it, so that it matches the
/// name its importers use. Files outside all of them are named after their basename, with
/// their parent directory as an extra import path. Well-known types resolve without being
/// on disk.
pub fn parse_proto_files(
    paths: &[PathBuf],
    imports: &[PathBuf],
) -> Result<ProtoFiles, ProtoSourceError> {
    let mut roots = Vec::new();
    let mut include_paths: Vec<PathBuf> = paths.iter().filter(|p| p.is_dir()).cloned().collect();
    include_paths.extend(imports.iter().cloned());

    let mut parents = Vec::new();
    for path in paths {
        if path.is_dir() {
            find_proto_files(path, path, &mut roots)?;
        } else if path.extension().is_some_and(|ext| ext == "proto") {
            if let Some(name) = relative_name(path, &include_paths) {
                roots.push(name);
                continue;
            }

            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                roots.push(name.to_string());
            }
            parents.push(parent);
        }
    }

    if roots.is_empty() {
        let searched: Vec<_> = paths.iter().map(|p| p.display().to_string()).collect();
        return Err(ProtoSourceError::NoProtoFiles(format!("[{}]", searched.join(" "))));
    }

    let mut seen = HashSet::new();
    roots.retain(|name| seen.insert(name.clone()));
    include_paths.extend(parents);

    let mut resolver = ChainFileResolver::new();
    resolver.add(SourceResolver { include_paths });
    resolver.add(GoogleFileResolver::new());

    let files = protox::Compiler::with_file_resolver(resolver)
        .include_imports(true)
        .open_files(&roots)
        .map_err(Box::new)?
        .file_descriptor_set()
        .file;

    Ok(ProtoFiles { roots, files })
}

/// Compiles every proto file found in the import directories, to make their types
/// resolvable inside `Any` payloads. Directories without proto files yield nothing.
pub fn additional_files(imports: &[PathBuf]) -> Result<ProtoFiles, ProtoSourceError> {
    if imports.is_empty() {
        return Ok(ProtoFiles::default());
    }

    match parse_proto_files(imports, &[]) {
        Err(ProtoSourceError::NoProtoFiles(_)) => Ok(ProtoFiles::default()),
        other => other,
    }
}

// Name of `file` relative to the first directory of `dirs` that contains it.
fn relative_name(file: &Path, dirs: &[PathBuf]) -> Option<String> {
    let file = fs::canonicalize(file).ok()?;

    dirs.iter()
        .filter_map(|dir| fs::canonicalize(dir).ok())
        .find_map(|dir| file.strip_prefix(&dir).ok().map(proto_name))
}

// Proto names always use `/`, whatever the platform separator.
fn proto_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect::<Vec<_>>()
        .join("/")
}

fn find_proto_files(
    root: &Path,
    dir: &Path,
    found: &mut Vec<String>,
) -> Result<(), ProtoSourceError> {
    let io_err = |source| ProtoSourceError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = fs::read_dir(dir)
        .map_err(io_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            find_proto_files(root, &path, found)?;
        } else if path.extension().is_some_and(|ext| ext == "proto")
            && let Ok(relative) = path.strip_prefix(root)
        {
            found.push(proto_name(relative));
        }
    }

    Ok(())
}

// Opens files relative to a list of include directories, tolerating a leading byte order mark.
struct SourceResolver {
    include_paths: Vec<PathBuf>,
}

impl FileResolver for SourceResolver {
    fn open_file(&self, name: &str) -> Result<File, protox::Error> {
        for dir in &self.include_paths {
            let Ok(source) = fs::read_to_string(dir.join(name)) else {
                continue;
            };
            let source = source.strip_prefix('\u{feff}').unwrap_or(&source);
            return File::from_source(name, source);
        }

        Err(protox::Error::file_not_found(name))
    }
}
