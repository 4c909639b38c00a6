// rust/ddp-core/src/storage/local.rs

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::traits::{StorageBackend, StorageReader, StorageWriter};
use crate::error::{Result, RuntimeError};

const IO_BUFFER: usize = 64 * 1024;

/// Filesystem-backed storage rooted at a directory.
///
/// Relative paths resolve against the root; absolute paths are used as is,
/// so a config can point checkpoints at a shared mount.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Uses `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_error(&root, "failed to create storage root"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn resolve_for_write(&self, path: &Path) -> Result<PathBuf> {
        let full = self.resolve(path);
        match full.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent)
                    .map_err(io_error(parent, "failed to create parent directory"))?;
            }
            _ => {}
        }
        Ok(full)
    }
}

/// Builds a `map_err` adapter that attaches `path` and `what` to an I/O error.
fn io_error<'a>(path: &'a Path, what: &'a str) -> impl FnOnce(io::Error) -> RuntimeError + 'a {
    move |e| RuntimeError::storage_with_source(path, what, e)
}

impl StorageBackend for LocalStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        let full = self.resolve(path);
        full.try_exists().map_err(io_error(&full, "failed to stat"))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full = self.resolve(path);
        let file = File::open(&full).map_err(io_error(&full, "failed to open for reading"))?;
        let size = file.metadata().map_err(io_error(&full, "failed to stat"))?.len();

        Ok(Box::new(FileReader {
            inner: BufReader::with_capacity(IO_BUFFER, file),
            size,
        }))
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full = self.resolve_for_write(path)?;
        let file = File::create(&full).map_err(io_error(&full, "failed to create"))?;
        Ok(Box::new(FileWriter::buffered(file, full)))
    }

    fn open_append(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full = self.resolve_for_write(path)?;
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&full)
            .map_err(io_error(&full, "failed to open for appending"))?;
        // Unbuffered: each write is one append, so nothing sits in memory
        // if the process dies.
        Ok(Box::new(FileWriter::unbuffered(file, full)))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        fs::remove_file(&full).map_err(io_error(&full, "failed to delete"))
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let full = self.resolve(dir);
        let entries = match fs::read_dir(&full) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RuntimeError::storage_with_source(&full, "failed to list", e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&full, "failed to read directory entry"))?;
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let source = self.resolve(from);
        let target = self.resolve_for_write(to)?;
        fs::rename(&source, &target).map_err(|e| {
            RuntimeError::storage_with_source(
                &source,
                format!("failed to rename to {}", target.display()),
                e,
            )
        })
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        fs::create_dir_all(&full).map_err(io_error(&full, "failed to create directory"))
    }
}

struct FileReader {
    inner: BufReader<File>,
    size: u64,
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl StorageReader for FileReader {
    fn size(&self) -> u64 {
        self.size
    }
}

struct FileWriter {
    inner: BufWriter<File>,
    path: PathBuf,
}

impl FileWriter {
    fn buffered(file: File, path: PathBuf) -> Self {
        Self {
            inner: BufWriter::with_capacity(IO_BUFFER, file),
            path,
        }
    }

    // A zero-capacity BufWriter passes every write straight through.
    fn unbuffered(file: File, path: PathBuf) -> Self {
        Self {
            inner: BufWriter::with_capacity(0, file),
            path,
        }
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl StorageWriter for FileWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.inner.flush().map_err(io_error(&self.path, "failed to flush"))?;
        self.inner
            .get_ref()
            .sync_all()
            .map_err(io_error(&self.path, "failed to sync"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (LocalStorage, TempDir) {
        let temp = TempDir::new().unwrap();
        (LocalStorage::new(temp.path()).unwrap(), temp)
    }

    fn put(storage: &LocalStorage, path: &Path, content: &[u8]) {
        let mut writer = storage.open_write(path).unwrap();
        writer.write_all(content).unwrap();
        writer.finish().unwrap();
    }

    fn get(storage: &LocalStorage, path: &Path) -> String {
        let mut content = String::new();
        storage
            .open_read(path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content
    }

    #[test]
    fn test_root_is_created() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("shared").join("run");
        let storage = LocalStorage::new(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(storage.root(), root.as_path());
    }

    #[test]
    fn test_write_creates_parents_and_truncates() {
        let (storage, _temp) = storage();
        let path = Path::new("models/job_epoch_00000.ckpt");

        put(&storage, path, b"first version, longer");
        put(&storage, path, b"second");

        assert!(storage.exists(path).unwrap());
        assert_eq!(storage.open_read(path).unwrap().size(), 6);
        assert_eq!(get(&storage, path), "second");
    }

    #[test]
    fn test_append_keeps_existing_lines() {
        let (storage, _temp) = storage();
        let path = Path::new("logs/nodes/node_0_host.log");

        for line in ["first\n", "second\n", "third\n"] {
            let mut writer = storage.open_append(path).unwrap();
            writer.write_all(line.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        assert_eq!(get(&storage, path), "first\nsecond\nthird\n");
    }

    #[test]
    fn test_append_is_visible_before_finish() {
        let (storage, _temp) = storage();
        let path = Path::new("node.log");

        let mut writer = storage.open_append(path).unwrap();
        writer.write_all(b"line\n").unwrap();
        assert_eq!(get(&storage, path), "line\n");
        writer.finish().unwrap();
    }

    #[test]
    fn test_list_is_sorted_and_tolerates_missing_dir() {
        let (storage, _temp) = storage();
        assert!(storage.list(Path::new("models")).unwrap().is_empty());

        for name in ["b_epoch_00002.ckpt", "a_epoch_00000.ckpt", "b_epoch_00001.ckpt"] {
            put(&storage, &Path::new("models").join(name), b"x");
        }
        assert_eq!(
            storage.list(Path::new("models")).unwrap(),
            vec!["a_epoch_00000.ckpt", "b_epoch_00001.ckpt", "b_epoch_00002.ckpt"]
        );

        put(&storage, Path::new("plain"), b"x");
        assert!(storage.list(Path::new("plain")).is_err());
    }

    #[test]
    fn test_rename_replaces_target() {
        let (storage, _temp) = storage();
        let temp_path = Path::new("models/.a.tmp");
        let final_path = Path::new("models/a.ckpt");

        put(&storage, final_path, b"old");
        put(&storage, temp_path, b"new");
        storage.rename(temp_path, final_path).unwrap();

        assert!(!storage.exists(temp_path).unwrap());
        assert_eq!(get(&storage, final_path), "new");

        storage.delete(final_path).unwrap();
        assert!(!storage.exists(final_path).unwrap());
        assert!(matches!(
            storage.delete(final_path),
            Err(RuntimeError::Storage { .. })
        ));
    }

    #[test]
    fn test_absolute_paths_bypass_root() {
        let (storage, _temp) = storage();
        let elsewhere = TempDir::new().unwrap();
        let absolute = elsewhere.path().join("results.txt");

        put(&storage, &absolute, b"abs");
        assert!(absolute.exists());
        assert!(matches!(
            storage.open_read(Path::new("missing")),
            Err(RuntimeError::Storage { .. })
        ));
    }
}
