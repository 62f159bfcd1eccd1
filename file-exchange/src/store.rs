//! Flat file directory used for server-held files and for each client's
//! local files.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::fs::{self, File};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFile {
    pub name: String,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the directory if it is missing.
    pub async fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// Maps a file name onto a path inside the store.
    ///
    /// Names are flat: anything that could climb out of the directory or
    /// into a sub-directory is reported as not found.
    pub fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let flat = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\'])
            && !name.contains('\0');
        if !flat {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("'{name}' is not a valid file name"),
            ));
        }
        Ok(self.root.join(name))
    }

    /// Regular files currently in the directory, sorted by name.
    pub async fn list(&self) -> io::Result<Vec<ServerFile>> {
        self.ensure_dir().await?;

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            files.push(ServerFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                len: metadata.len(),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Opens a file for streaming out, together with its exact length.
    pub async fn open_for_read(&self, name: &str) -> io::Result<(File, u64)> {
        let file = File::open(self.resolve(name)?).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("'{name}' is not a file")));
        }
        Ok((file, metadata.len()))
    }

    /// Creates or truncates a file.
    pub async fn open_for_write(&self, name: &str) -> io::Result<File> {
        self.ensure_dir().await?;
        File::create(self.resolve(name)?).await
    }

    pub async fn length(&self, name: &str) -> io::Result<u64> {
        let metadata = fs::metadata(self.resolve(name)?).await?;
        Ok(metadata.len())
    }

    pub async fn exists(&self, name: &str) -> bool {
        match self.resolve(name) {
            Ok(path) => fs::metadata(path).await.is_ok_and(|meta| meta.is_file()),
            Err(_) => false,
        }
    }

    pub async fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(name)?).await
    }
}

/// Text returned for `DIR`.
pub fn render_listing(files: &[ServerFile]) -> String {
    let mut listing = String::from("Server Directory");
    if files.is_empty() {
        listing.push_str("\nNo files found");
        return listing;
    }
    for file in files {
        listing.push('\n');
        listing.push_str(&file.name);
    }
    listing
}
