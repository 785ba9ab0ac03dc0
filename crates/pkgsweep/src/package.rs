use std::fmt;
use std::path::{Component, Path};

/// Identity of one unit of work: a package name plus the version being processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageRef {
    name: String,
    version: String,
}

impl PackageRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Ledger key in the form `name@version`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Parse a ledger key back into a reference.
    ///
    /// Splits on the last `@` so scoped names such as `@org/pkg@1.0.0` survive.
    /// Returns `None` when either half is empty.
    pub fn parse_key(key: &str) -> Option<Self> {
        let (name, version) = key.rsplit_once('@')?;
        if name.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self::new(name, version))
    }

    /// Whether name and version can each be used as one directory level.
    ///
    /// Rejects separators, `.`/`..`, absolute paths and empty strings.
    pub fn is_path_safe(&self) -> bool {
        is_single_segment(&self.name) && is_single_segment(&self.version)
    }
}

fn is_single_segment(s: &str) -> bool {
    if s.is_empty() || s.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(s).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// One catalog entry as returned by the registry, with the metadata the
/// filter and downloader need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageListing {
    pub package: PackageRef,
    pub archive_url: String,
    pub build_tools: Vec<String>,
    pub retired: bool,
    pub description: Option<String>,
}

impl PackageListing {
    pub fn new(package: PackageRef, archive_url: impl Into<String>) -> Self {
        Self {
            package,
            archive_url: archive_url.into(),
            build_tools: Vec::new(),
            retired: false,
            description: None,
        }
    }

    pub fn with_build_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.build_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn retired(mut self, retired: bool) -> Self {
        self.retired = retired;
        self
    }
}
