//! Compiler command-line classification.
//!
//! Parses a raw `cc`-style argument vector into a structured form rich
//! enough to (a) decide whether the unit can be shipped to a worker and
//! (b) reconstruct the remote argument vector.

use std::path::Path;

use crate::core::Arch;

// =============================================================================
// Vocabulary
// =============================================================================

/// Compiler driver family, keyed off the binary name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerFamily {
    Gcc,
    Gxx,
    Clang,
    Clangxx,
    Msvc,
    Unknown,
}

impl CompilerFamily {
    /// Classify by binary name (`/usr/bin/x86_64-linux-gnu-g++-13` → Gxx).
    pub fn from_binary(binary: &str) -> Self {
        let base = Path::new(binary)
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let base = base.strip_suffix(".exe").unwrap_or(&base);

        // Versioned and cross-prefixed names keep their family:
        // match on the trailing component.
        if base == "cl" {
            Self::Msvc
        } else if ends_with_tool(base, "clang++") {
            Self::Clangxx
        } else if ends_with_tool(base, "clang") {
            Self::Clang
        } else if ends_with_tool(base, "g++") || ends_with_tool(base, "c++") {
            Self::Gxx
        } else if ends_with_tool(base, "gcc") || ends_with_tool(base, "cc") {
            Self::Gcc
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gcc => "gcc",
            Self::Gxx => "g++",
            Self::Clang => "clang",
            Self::Clangxx => "clang++",
            Self::Msvc => "msvc",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for CompilerFamily {
    fn default() -> Self {
        Self::Unknown
    }
}

/// `name` equals `tool`, or ends with `tool` preceded by `-` (cross
/// prefix) optionally followed by `-NN` (version suffix).
fn ends_with_tool(name: &str, tool: &str) -> bool {
    // strip a trailing -<digits> version suffix
    let name = match name.rfind('-') {
        Some(i) if name[i + 1..].chars().all(|c| c.is_ascii_digit()) && i + 1 < name.len() => {
            &name[..i]
        }
        _ => name,
    };
    name == tool || name.ends_with(&format!("-{tool}"))
}

/// Source language of the translation unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Language {
    C,
    Cpp,
    #[default]
    Unknown,
}

impl Language {
    fn from_x_value(value: &str) -> Self {
        match value {
            "c" | "cpp-output" => Self::C,
            "c++" | "c++-cpp-output" => Self::Cpp,
            _ => Self::Unknown,
        }
    }

    fn from_extension(path: &str) -> Self {
        match extension(path).as_str() {
            "c" | "i" => Self::C,
            "cc" | "cpp" | "cxx" | "c++" | "ii" => Self::Cpp,
            _ => Self::Unknown,
        }
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// A classified compiler command line.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Compiler binary exactly as invoked
    pub compiler: String,
    pub family: CompilerFamily,
    /// Source/object arguments, in order
    pub inputs: Vec<String>,
    /// `-o` target, if any
    pub output: Option<String>,
    /// `-I` directories, in order
    pub include_dirs: Vec<String>,
    /// `-D` values (without the `-D`), in order
    pub defines: Vec<String>,
    /// Everything else starting with `-`, order preserved
    pub flags: Vec<String>,
    pub is_compile_only: bool,
    pub is_preprocess: bool,
    pub is_link: bool,
    /// Derived from `-march=`; Unspecified when absent or unknown
    pub target_arch: Arch,
    pub language: Language,
    /// `-std=` value, if any
    pub standard: Option<String>,
    /// `-O` level (the text after `-O`), if any
    pub opt_level: Option<String>,
}

impl Invocation {
    /// Parse `argv` (compiler binary first).
    pub fn parse(argv: &[String]) -> Self {
        let mut inv = Self::default();
        let Some((compiler, args)) = argv.split_first() else {
            return inv;
        };
        inv.compiler = compiler.clone();
        inv.family = CompilerFamily::from_binary(compiler);

        let mut assemble_only = false;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-c" => inv.is_compile_only = true,
                "-E" => inv.is_preprocess = true,
                "-S" => assemble_only = true,
                "-o" => {
                    if let Some(path) = iter.next() {
                        inv.output = Some(path.clone());
                    }
                }
                "-I" => {
                    if let Some(dir) = iter.next() {
                        inv.include_dirs.push(dir.clone());
                    }
                }
                "-D" => {
                    if let Some(def) = iter.next() {
                        inv.defines.push(def.clone());
                    }
                }
                "-x" => {
                    if let Some(lang) = iter.next() {
                        inv.language = Language::from_x_value(lang);
                    }
                }
                _ => inv.classify_tail(arg),
            }
        }

        inv.is_link = !inv.is_compile_only && !inv.is_preprocess && !assemble_only;
        if inv.language == Language::Unknown {
            if let Some(first) = inv.inputs.first() {
                inv.language = Language::from_extension(first);
            }
        }
        inv
    }

    /// Handle fused-value options, opaque flags, and bare arguments.
    fn classify_tail(&mut self, arg: &str) {
        if let Some(path) = arg.strip_prefix("-o") {
            self.output = Some(path.to_string());
            return;
        }
        if let Some(dir) = arg.strip_prefix("-I") {
            self.include_dirs.push(dir.to_string());
            return;
        }
        if let Some(def) = arg.strip_prefix("-D") {
            self.defines.push(def.to_string());
            return;
        }
        if let Some(lang) = arg.strip_prefix("-x") {
            self.language = Language::from_x_value(lang);
            return;
        }
        if let Some(std) = arg.strip_prefix("-std=") {
            self.standard = Some(std.to_string());
            self.flags.push(arg.to_string());
            return;
        }
        if let Some(march) = arg.strip_prefix("-march=") {
            self.target_arch = Arch::from_march(march);
            self.flags.push(arg.to_string());
            return;
        }
        if let Some(level) = arg.strip_prefix("-O") {
            self.opt_level = Some(level.to_string());
            self.flags.push(arg.to_string());
            return;
        }
        if arg.starts_with('-') {
            self.flags.push(arg.to_string());
            return;
        }
        if is_source_file(arg) || is_object_file(arg) {
            self.inputs.push(arg.to_string());
        } else {
            self.flags.push(arg.to_string());
        }
    }

    /// Whether this unit may be shipped to a worker.
    ///
    /// Link, preprocess-only, and multi-input invocations compile
    /// locally; so does anything whose single input is not a source
    /// file.
    pub fn is_distributable(&self) -> bool {
        self.is_compile_only
            && self.inputs.len() == 1
            && is_source_file(&self.inputs[0])
    }

    /// The single source input (valid once `is_distributable` holds).
    pub fn source_file(&self) -> Option<&str> {
        match self.inputs.as_slice() {
            [single] if is_source_file(single) => Some(single),
            _ => None,
        }
    }

    /// Argument vector for remote execution: flags in original order,
    /// then include dirs and defines. Inputs and `-o` stay out; the
    /// worker appends its own materialized paths.
    pub fn remote_args(&self) -> Vec<String> {
        let mut args = self.flags.clone();
        for dir in &self.include_dirs {
            args.push(format!("-I{dir}"));
        }
        for def in &self.defines {
            args.push(format!("-D{def}"));
        }
        args
    }
}

// =============================================================================
// Extension tables
// =============================================================================

fn extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// C/C++ source (or already-preprocessed) file.
pub fn is_source_file(path: &str) -> bool {
    matches!(
        extension(path).as_str(),
        "c" | "cc" | "cpp" | "cxx" | "c++" | "i" | "ii"
    )
}

/// Object or library file.
pub fn is_object_file(path: &str) -> bool {
    matches!(extension(path).as_str(), "o" | "obj" | "a" | "so" | "dylib" | "lib")
}

/// Project-local header file.
pub fn is_header_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase().as_str(),
        "h" | "hpp" | "hxx" | "hh"
    )
}

// =============================================================================
// Tests
// =============================================================================
