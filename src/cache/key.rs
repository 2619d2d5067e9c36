//! Deterministic compile keys.

use std::fmt;

use crate::core::Arch;

/// A 256-bit content-addressed compile key (blake3 output).
///
/// Two invocations that differ only in flag/define ordering produce the
/// same key: both lists are sorted before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompileKey([u8; 32]);

impl CompileKey {
    /// Create a key from raw bytes.
    #[inline]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the key for one translation unit.
    ///
    /// Inputs: compiler binary name, compiler version tag, target arch,
    /// flags, defines, and the source bytes. Field boundaries are
    /// delimited so that adjacent values cannot alias each other.
    pub fn compute(
        compiler: &str,
        version: &str,
        target_arch: Arch,
        flags: &[String],
        defines: &[String],
        source: &[u8],
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(compiler.as_bytes());
        hasher.update(b"\0");
        hasher.update(version.as_bytes());
        hasher.update(b"\0");
        hasher.update(target_arch.as_str().as_bytes());
        hasher.update(b"\0");

        let mut sorted_flags: Vec<&str> = flags.iter().map(String::as_str).collect();
        sorted_flags.sort_unstable();
        for flag in sorted_flags {
            hasher.update(flag.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"\0");

        let mut sorted_defines: Vec<&str> = defines.iter().map(String::as_str).collect();
        sorted_defines.sort_unstable();
        for define in sorted_defines {
            hasher.update(define.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"\0");

        // Source content is hashed separately so the key embeds a
        // stable content digest rather than raw bytes.
        hasher.update(blake3::hash(source).as_bytes());

        Self(*hasher.finalize().as_bytes())
    }

    /// Full hex form (64 chars) - used as the on-disk payload name.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse back from hex.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for CompileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 16 hex chars for log lines
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_key_order_insensitive() {
        let a = CompileKey::compute(
            "gcc",
            "13.2",
            Arch::X86_64,
            &strings(&["-O2", "-fPIC", "-std=c++17"]),
            &strings(&["FOO=1", "BAR"]),
            b"int main() {}",
        );
        let b = CompileKey::compute(
            "gcc",
            "13.2",
            Arch::X86_64,
            &strings(&["-std=c++17", "-O2", "-fPIC"]),
            &strings(&["BAR", "FOO=1"]),
            b"int main() {}",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_sensitive_to_source() {
        let flags = strings(&["-O2"]);
        let a = CompileKey::compute("gcc", "13.2", Arch::X86_64, &flags, &[], b"int x;");
        let b = CompileKey::compute("gcc", "13.2", Arch::X86_64, &flags, &[], b"int y;");
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_sensitive_to_compiler_and_arch() {
        let a = CompileKey::compute("gcc", "13.2", Arch::X86_64, &[], &[], b"x");
        let b = CompileKey::compute("clang", "13.2", Arch::X86_64, &[], &[], b"x");
        let c = CompileKey::compute("gcc", "13.2", Arch::Arm64, &[], &[], b"x");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_flag_boundaries_do_not_alias() {
        // ["-O2", "-g"] must differ from ["-O2-g"]
        let a = CompileKey::compute("gcc", "1", Arch::Unspecified, &strings(&["-O2", "-g"]), &[], b"x");
        let b = CompileKey::compute("gcc", "1", Arch::Unspecified, &strings(&["-O2-g"]), &[], b"x");
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = CompileKey::compute("gcc", "1", Arch::Unspecified, &[], &[], b"x");
        let recovered = CompileKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, recovered);
    }
}
