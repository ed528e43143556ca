//! Filesystem capability.
//!
//! Paths are URL-like ([`FsPath`]: scheme, host, path) and resolved to a
//! backend by an [`FsResolver`]. Only the local backend lives here.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

/// A URL-like file location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FsPath {
    pub scheme: String,
    pub host: String,
    pub path: String,
}

impl FsPath {
    pub fn local(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            scheme: "file".to_string(),
            host: String::new(),
            path: path.as_ref().to_string_lossy().into_owned(),
        }
    }

    /// Parses `scheme://host/path`; a bare path is treated as a local file.
    pub fn parse(s: &str) -> Self {
        match s.split_once("://") {
            Some((scheme, rest)) => {
                let (host, path) = match rest.find('/') {
                    Some(idx) => (&rest[..idx], &rest[idx..]),
                    None => (rest, "/"),
                };
                Self {
                    scheme: scheme.to_string(),
                    host: host.to_string(),
                    path: path.to_string(),
                }
            }
            None => Self::local(s),
        }
    }

    pub fn join(&self, rel: &str) -> Self {
        let rel = rel.trim_start_matches('/');
        let path = if rel.is_empty() {
            self.path.clone()
        } else if self.path.ends_with('/') {
            format!("{}{rel}", self.path)
        } else {
            format!("{}/{rel}", self.path)
        };
        Self { path, ..self.clone() }
    }

    pub fn parent(&self) -> Self {
        let trimmed = self.path.trim_end_matches('/');
        let path = match trimmed.rfind('/') {
            Some(0) => "/".to_string(),
            Some(idx) => trimmed[..idx].to_string(),
            None => String::new(),
        };
        Self { path, ..self.clone() }
    }

    pub fn file_name(&self) -> &str {
        self.path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
    }

    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            path: format!("{}{suffix}", self.path),
            ..self.clone()
        }
    }
}

impl std::fmt::Display for FsPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.scheme == "file" && self.host.is_empty() {
            write!(f, "{}", self.path)
        } else {
            write!(f, "{}://{}{}", self.scheme, self.host, self.path)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: FsPath,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Read/write, creating the file if needed, never truncating.
    Write,
}

pub trait FileAccess: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send + Sync> FileAccess for T {}

pub type FileHandle = Box<dyn FileAccess>;

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn open(&self, path: &FsPath, mode: OpenMode) -> std::io::Result<FileHandle>;
    async fn stat(&self, path: &FsPath) -> std::io::Result<FileInfo>;
    async fn read_dir(&self, path: &FsPath) -> std::io::Result<Vec<FileInfo>>;
    async fn mkdir_all(&self, path: &FsPath) -> std::io::Result<()>;
    async fn rename(&self, from: &FsPath, to: &FsPath) -> std::io::Result<()>;
    async fn remove(&self, path: &FsPath) -> std::io::Result<()>;

    /// Lists the entries of `dir` whose name matches `pattern`.
    async fn glob(&self, dir: &FsPath, pattern: &str) -> std::io::Result<Vec<FileInfo>> {
        let matcher = globset::Glob::new(pattern)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
            .compile_matcher();
        let mut entries: Vec<FileInfo> = self
            .read_dir(dir)
            .await?
            .into_iter()
            .filter(|info| matcher.is_match(info.path.file_name()))
            .collect();
        entries.sort_by(|a, b| a.path.path.cmp(&b.path.path));
        Ok(entries)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no filesystem registered for scheme '{scheme}'")]
pub struct UnknownScheme {
    pub scheme: String,
}

pub trait FsResolver: Send + Sync {
    fn resolve(&self, path: &FsPath) -> Result<Arc<dyn FileSystem>, UnknownScheme>;
}

/// The local disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

fn to_info(path: FsPath, md: &std::fs::Metadata) -> FileInfo {
    FileInfo {
        path,
        size: md.len(),
        is_dir: md.is_dir(),
        modified: md.modified().ok().map(chrono::DateTime::<chrono::Utc>::from),
    }
}

#[async_trait]
impl FileSystem for LocalFs {
    async fn open(&self, path: &FsPath, mode: OpenMode) -> std::io::Result<FileHandle> {
        let mut options = tokio::fs::OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.read(true).write(true).create(true).truncate(false),
        };
        let file = options.open(&path.path).await?;
        Ok(Box::new(file))
    }

    async fn stat(&self, path: &FsPath) -> std::io::Result<FileInfo> {
        let md = tokio::fs::metadata(&path.path).await?;
        Ok(to_info(path.clone(), &md))
    }

    async fn read_dir(&self, path: &FsPath) -> std::io::Result<Vec<FileInfo>> {
        let mut entries = tokio::fs::read_dir(&path.path).await?;
        let mut infos = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let md = entry.metadata().await?;
            let name = entry.file_name();
            infos.push(to_info(path.join(&name.to_string_lossy()), &md));
        }
        Ok(infos)
    }

    async fn mkdir_all(&self, path: &FsPath) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&path.path).await
    }

    async fn rename(&self, from: &FsPath, to: &FsPath) -> std::io::Result<()> {
        tokio::fs::rename(&from.path, &to.path).await
    }

    async fn remove(&self, path: &FsPath) -> std::io::Result<()> {
        tokio::fs::remove_file(&path.path).await
    }
}

/// Resolves `file://` paths to [`LocalFs`]; other schemes can be registered.
pub struct DefaultResolver {
    backends: std::collections::HashMap<String, Arc<dyn FileSystem>>,
}

impl DefaultResolver {
    pub fn new() -> Self {
        let mut backends: std::collections::HashMap<String, Arc<dyn FileSystem>> =
            std::collections::HashMap::new();
        backends.insert("file".to_string(), Arc::new(LocalFs));
        Self { backends }
    }

    pub fn register(&mut self, scheme: &str, fs: Arc<dyn FileSystem>) {
        self.backends.insert(scheme.to_string(), fs);
    }
}

impl Default for DefaultResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl FsResolver for DefaultResolver {
    fn resolve(&self, path: &FsPath) -> Result<Arc<dyn FileSystem>, UnknownScheme> {
        self.backends
            .get(&path.scheme)
            .cloned()
            .ok_or_else(|| UnknownScheme {
                scheme: path.scheme.clone(),
            })
    }
}
