//! Reading outgoing files and writing received ones.
//!
//! Received files are written to a temporary file in the destination
//! directory and renamed into place once complete, so a partially written
//! file is never visible under its final name.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Name used when a received name sanitises to nothing.
const FALLBACK_FILE_NAME: &str = "download";

/// Upper bound on numbered alternatives tried for a taken name.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Reduces a peer-supplied file name to a safe single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Returns a path in `dir` for `file_name` that does not exist yet.
///
/// A taken name gets a numbered suffix before its extension:
/// `photo.jpg`, `photo (1).jpg`, `photo (2).jpg`, ...
pub async fn unique_destination(dir: &Path, file_name: &str) -> std::io::Result<PathBuf> {
    let candidate = dir.join(file_name);
    if !fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }

    let as_path = Path::new(file_name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let extension = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for n in 1..=MAX_NAME_ATTEMPTS {
        let candidate = dir.join(format!("{} ({}){}", stem, n, extension));
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", file_name, dir.display()),
    ))
}

/// Writes `chunks` in order to a new file named after `file_name` in `dir`.
///
/// Returns the final path.
pub async fn save_chunks(
    dir: &Path,
    file_name: &str,
    chunks: &[Vec<u8>],
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir).await?;

    let file_name = sanitize_file_name(file_name);
    let destination = unique_destination(dir, &file_name).await?;
    let temp_path = dir.join(format!(
        ".{}.{:08x}.part",
        file_name,
        rand::thread_rng().gen::<u32>()
    ));

    if let Err(e) = write_all_chunks(&temp_path, chunks).await {
        if let Err(cleanup) = fs::remove_file(&temp_path).await {
            tracing::warn!(path = ?temp_path, error = %cleanup, "Failed to clean up temp file");
        }
        return Err(e);
    }

    fs::rename(&temp_path, &destination).await?;
    tracing::info!(path = ?destination, "Saved received file");
    Ok(destination)
}

async fn write_all_chunks(path: &Path, chunks: &[Vec<u8>]) -> std::io::Result<()> {
    let mut file = File::create(path).await?;
    for chunk in chunks {
        file.write_all(chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Sequential reader over the bytes of an outgoing file.
pub enum ChunkReader {
    File(File),
    Memory(Arc<[u8]>),
}

impl ChunkReader {
    /// Opens a file on disk.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        Ok(ChunkReader::File(File::open(path).await?))
    }

    /// Reads `len` bytes at `offset`.
    pub async fn read(&mut self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        match self {
            ChunkReader::File(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
            ChunkReader::Memory(data) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX);
                let end = start.saturating_add(len);
                data.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("range {}..{} beyond {} bytes", start, end, data.len()),
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\notes.txt"), "notes.txt");
        assert_eq!(sanitize_file_name("a\u{0}b\n.txt"), "ab.txt");
        assert_eq!(sanitize_file_name(".."), "download");
        assert_eq!(sanitize_file_name("dir/"), "download");
        assert_eq!(sanitize_file_name("   "), "download");
    }

    #[tokio::test]
    async fn test_unique_destination() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        assert_eq!(unique_destination(dir, "a.txt").await.unwrap(), dir.join("a.txt"));

        std::fs::write(dir.join("a.txt"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir, "a.txt").await.unwrap(),
            dir.join("a (1).txt")
        );

        std::fs::write(dir.join("a (1).txt"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir, "a.txt").await.unwrap(),
            dir.join("a (2).txt")
        );

        std::fs::write(dir.join("README"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir, "README").await.unwrap(),
            dir.join("README (1)")
        );
    }

    #[tokio::test]
    async fn test_save_chunks_writes_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let out = temp_dir.path().join("downloads");

        let chunks = vec![b"hello ".to_vec(), b"dropwire".to_vec(), Vec::new()];
        let path = save_chunks(&out, "../greeting.txt", &chunks).await.unwrap();

        assert_eq!(path, out.join("greeting.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello dropwire");

        // No temp files are left behind.
        let names: Vec<_> = std::fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);

        let second = save_chunks(&out, "greeting.txt", &chunks).await.unwrap();
        assert_eq!(second, out.join("greeting (1).txt"));
    }

    #[tokio::test]
    async fn test_chunk_reader_file_and_memory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("src.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        std::fs::write(&path, &data).unwrap();

        let mut reader = ChunkReader::open(&path).await.unwrap();
        assert_eq!(reader.read(4096, 904).await.unwrap(), data[4096..].to_vec());
        assert_eq!(reader.read(0, 10).await.unwrap(), data[..10].to_vec());
        assert!(reader.read(4990, 100).await.is_err());

        let mut memory = ChunkReader::Memory(Arc::from(data.clone()));
        assert_eq!(memory.read(100, 50).await.unwrap(), data[100..150].to_vec());
        assert!(memory.read(4990, 100).await.is_err());
    }
}
