//! Target and host architecture tags.

use std::fmt;

/// CPU architecture of a worker host or a compile target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Arch {
    /// No preference; any worker may serve the task
    #[default]
    Unspecified,
    X86_64,
    Arm64,
    Armv7,
}

impl Arch {
    /// Architecture of the running process.
    pub fn native() -> Self {
        match std::env::consts::ARCH {
            "x86_64" => Self::X86_64,
            "aarch64" => Self::Arm64,
            "arm" => Self::Armv7,
            _ => Self::Unspecified,
        }
    }

    /// Derive a target architecture from a `-march=`/`--target=` value.
    ///
    /// Unknown march strings map to Unspecified: the flag still travels
    /// with the argument vector, it just carries no placement signal.
    pub fn from_march(value: &str) -> Self {
        let v = value.to_ascii_lowercase();
        if v.contains("x86-64") || v.contains("x86_64") || v.contains("amd64") {
            Self::X86_64
        } else if v.contains("armv8") || v.contains("aarch64") || v.contains("arm64") {
            Self::Arm64
        } else if v.contains("armv7") {
            Self::Armv7
        } else {
            Self::Unspecified
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
            Self::Armv7 => "armv7",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_march() {
        assert_eq!(Arch::from_march("x86-64-v3"), Arch::X86_64);
        assert_eq!(Arch::from_march("armv8-a"), Arch::Arm64);
        assert_eq!(Arch::from_march("armv7-a"), Arch::Armv7);
        assert_eq!(Arch::from_march("znver4"), Arch::Unspecified);
    }

    #[test]
    fn test_native_is_known_on_ci() {
        // On every platform we build for, the native arch resolves.
        let _ = Arch::native();
    }
}
