use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Sets an environment variable for the guard's lifetime.
#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }

    pub fn unset(key: &str) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::remove_var(key) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

/// A host LayoutTests tree in a temporary directory with controlled mtimes.
#[allow(dead_code)]
pub struct LayoutTree {
    dir: TempDir,
}

#[allow(dead_code)]
impl LayoutTree {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("LayoutTests")).expect("create LayoutTests");
        Self { dir }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("LayoutTests")
    }

    /// Scratch space next to the tree (unpack helper, sockets).
    pub fn scratch(&self) -> &Path {
        self.dir.path()
    }

    /// Write `relative` with `body`, stamped at `mtime` seconds since the epoch.
    pub fn file(&self, relative: &str, body: &str, mtime: u64) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(&path, body).expect("write test file");
        File::options()
            .write(true)
            .open(&path)
            .expect("reopen test file")
            .set_modified(UNIX_EPOCH + Duration::from_secs(mtime))
            .expect("set mtime");
        path
    }
}

/// Render one device long-listing line for a file modified at `mtime`.
#[allow(dead_code)]
pub fn listing_line(name: &str, size: u64, mtime: i64) -> String {
    let stamp = DateTime::<Utc>::from_timestamp(mtime, 0).expect("valid timestamp");
    format!(
        "-rw-rw-r-- root     sdcard_rw {size:>8} {} {}",
        stamp.format("%Y-%m-%d %H:%M"),
        name
    )
}
