//! Instance configuration.

use std::{
    collections::BTreeMap,
    fmt, io,
    path::{Path, PathBuf},
    time::Duration,
};

use walkdir::WalkDir;

use crate::env::Environment;

/// Default command used to launch the server.
pub const DEFAULT_BINARY: &str = "opencode";

/// Grace period between spawn and the liveness check.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Where the server's stdout and stderr go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChildOutput {
    /// Share this process's stdout/stderr.
    #[default]
    Inherit,
    /// Discard all output.
    Null,
    /// Forward each line to `tracing` under the `opencode::child` target.
    Trace,
}

/// A tree of relative paths to file contents, staged into a fresh
/// isolation root before the server starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualFileSet {
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl VirtualFileSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn insert(&mut self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), content.into());
    }

    /// Builder form of [`insert`](Self::insert).
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        self.insert(path, content);
        self
    }

    /// Load every regular file below `root`, keyed by its path relative to
    /// `root`.
    ///
    /// # Errors
    /// Returns error if the tree cannot be walked or a file cannot be read.
    pub fn from_dir(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        let mut set = Self::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(io::Error::other)?
                .to_path_buf();
            set.insert(relative, std::fs::read(entry.path())?);
        }
        Ok(set)
    }

    #[must_use]
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.files.contains_key(path.as_ref())
    }

    #[must_use]
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&[u8]> {
        self.files.get(path.as_ref()).map(Vec::as_slice)
    }

    /// Files in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &[u8])> {
        self.files.iter().map(|(p, c)| (p.as_path(), c.as_slice()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl<P: Into<PathBuf>, C: Into<Vec<u8>>> FromIterator<(P, C)> for VirtualFileSet {
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (path, content) in iter {
            set.insert(path, content);
        }
        set
    }
}

/// Configuration of one supervised server.
///
/// Immutable once handed to [`OpenCode`](crate::OpenCode); the only value
/// chosen at start time is the address when `addr` is `None`.
#[derive(Clone)]
pub struct Config {
    /// `host:port` to serve on. `None` allocates a free loopback port.
    pub addr: Option<String>,
    /// Directory to isolate the server's home and config in. Used as is when
    /// `config_files` is `None`.
    pub isolation_root: Option<PathBuf>,
    /// Credential exported as `OPENCODE_API_KEY`.
    pub api_key: Option<String>,
    /// Files staged into a fresh isolation root on start.
    pub config_files: Option<VirtualFileSet>,
    /// Parent directory for staged roots. Defaults to the system temp dir.
    pub staging_dir: Option<PathBuf>,
    /// Launch command, split shell-style (`"bunx opencode-ai"` works).
    pub binary: String,
    /// Working directory of the server process.
    pub working_dir: Option<PathBuf>,
    pub output: ChildOutput,
    pub startup_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: None,
            isolation_root: None,
            api_key: None,
            config_files: None,
            staging_dir: None,
            binary: DEFAULT_BINARY.to_string(),
            working_dir: None,
            output: ChildOutput::default(),
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }
}

impl Config {
    /// Defaults filled from `OPENCODE_CONFIG_DIR`, `OPENCODE_API_KEY` and
    /// `OPENCODE_BIN`.
    #[must_use]
    pub fn from_environment(env: &Environment) -> Self {
        Self {
            isolation_root: env.non_empty("OPENCODE_CONFIG_DIR").map(PathBuf::from),
            api_key: env.non_empty("OPENCODE_API_KEY").map(str::to_string),
            binary: env
                .non_empty("OPENCODE_BIN")
                .map_or_else(|| DEFAULT_BINARY.to_string(), str::to_string),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    #[must_use]
    pub fn with_isolation_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.isolation_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_config_files(mut self, files: VirtualFileSet) -> Self {
        self.config_files = Some(files);
        self
    }

    #[must_use]
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: ChildOutput) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("addr", &self.addr)
            .field("isolation_root", &self.isolation_root)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("config_files", &self.config_files.as_ref().map(VirtualFileSet::len))
            .field("staging_dir", &self.staging_dir)
            .field("binary", &self.binary)
            .field("working_dir", &self.working_dir)
            .field("output", &self.output)
            .field("startup_grace", &self.startup_grace)
            .finish()
    }
}
