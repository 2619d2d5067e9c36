//! Build types a worker can serve.

use std::fmt;

/// Kind of toolchain a compile task needs.
///
/// The compile plane only dispatches `Cpp`; the other variants route
/// through capability filtering so that `GetWorkersForBuild` can answer
/// for them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BuildType {
    #[default]
    Unspecified,
    Cpp,
    Go,
    Rust,
    NodeJs,
    Flutter,
}

impl BuildType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Cpp => "cpp",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::NodeJs => "nodejs",
            Self::Flutter => "flutter",
        }
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
