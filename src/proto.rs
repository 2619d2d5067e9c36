//! Wire contract: generated `hybridgrid.v1` types plus conversions
//! into the crate's core vocabulary.

#![allow(clippy::enum_variant_names)]

tonic::include_proto!("hybridgrid.v1");

use crate::core;
use crate::registry;

// --- Proto ↔ core enum conversions ---

impl From<Arch> for core::Arch {
    fn from(value: Arch) -> Self {
        match value {
            Arch::Unspecified => core::Arch::Unspecified,
            Arch::X8664 => core::Arch::X86_64,
            Arch::Arm64 => core::Arch::Arm64,
            Arch::Armv7 => core::Arch::Armv7,
        }
    }
}

impl From<core::Arch> for Arch {
    fn from(value: core::Arch) -> Self {
        match value {
            core::Arch::Unspecified => Arch::Unspecified,
            core::Arch::X86_64 => Arch::X8664,
            core::Arch::Arm64 => Arch::Arm64,
            core::Arch::Armv7 => Arch::Armv7,
        }
    }
}

impl From<BuildType> for core::BuildType {
    fn from(value: BuildType) -> Self {
        match value {
            BuildType::Unspecified => core::BuildType::Unspecified,
            BuildType::Cpp => core::BuildType::Cpp,
            BuildType::Go => core::BuildType::Go,
            BuildType::Rust => core::BuildType::Rust,
            BuildType::Nodejs => core::BuildType::NodeJs,
            BuildType::Flutter => core::BuildType::Flutter,
        }
    }
}

impl From<core::BuildType> for BuildType {
    fn from(value: core::BuildType) -> Self {
        match value {
            core::BuildType::Unspecified => BuildType::Unspecified,
            core::BuildType::Cpp => BuildType::Cpp,
            core::BuildType::Go => BuildType::Go,
            core::BuildType::Rust => BuildType::Rust,
            core::BuildType::NodeJs => BuildType::Nodejs,
            core::BuildType::Flutter => BuildType::Flutter,
        }
    }
}

// --- Capability conversions ---

impl From<ToolchainCapability> for registry::ToolchainCapability {
    fn from(value: ToolchainCapability) -> Self {
        Self { name: value.name, version: value.version }
    }
}

impl From<&registry::ToolchainCapability> for ToolchainCapability {
    fn from(value: &registry::ToolchainCapability) -> Self {
        Self { name: value.name.clone(), version: value.version.clone() }
    }
}

impl From<WorkerCapabilities> for registry::WorkerCapabilities {
    fn from(value: WorkerCapabilities) -> Self {
        let native_arch = value.native_arch().into();
        Self {
            hostname: value.hostname,
            native_arch,
            os: value.os,
            cpu_cores: value.cpu_cores,
            memory_bytes: value.memory_bytes,
            container_runtime: value.container_runtime,
            cpp: value.cpp.map(|c| registry::CppCapability {
                compilers: c.compilers,
                cross_compile: c.cross_compile,
            }),
            go: value.go.map(Into::into),
            rust: value.rust.map(Into::into),
            nodejs: value.nodejs.map(Into::into),
            flutter: value.flutter.map(Into::into),
            max_parallel_tasks: value.max_parallel_tasks,
        }
    }
}

impl From<&registry::WorkerCapabilities> for WorkerCapabilities {
    fn from(value: &registry::WorkerCapabilities) -> Self {
        Self {
            hostname: value.hostname.clone(),
            native_arch: Arch::from(value.native_arch) as i32,
            os: value.os.clone(),
            cpu_cores: value.cpu_cores,
            memory_bytes: value.memory_bytes,
            container_runtime: value.container_runtime,
            cpp: value.cpp.as_ref().map(|c| CppCapability {
                compilers: c.compilers.clone(),
                cross_compile: c.cross_compile,
            }),
            go: value.go.as_ref().map(Into::into),
            rust: value.rust.as_ref().map(Into::into),
            nodejs: value.nodejs.as_ref().map(Into::into),
            flutter: value.flutter.as_ref().map(Into::into),
            max_parallel_tasks: value.max_parallel_tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_roundtrip() {
        for arch in [
            core::Arch::Unspecified,
            core::Arch::X86_64,
            core::Arch::Arm64,
            core::Arch::Armv7,
        ] {
            let wire: Arch = arch.into();
            let back: core::Arch = wire.into();
            assert_eq!(arch, back);
        }
    }

    #[test]
    fn test_build_type_roundtrip() {
        for bt in [
            core::BuildType::Unspecified,
            core::BuildType::Cpp,
            core::BuildType::Go,
            core::BuildType::Rust,
            core::BuildType::NodeJs,
            core::BuildType::Flutter,
        ] {
            let wire: BuildType = bt.into();
            let back: core::BuildType = wire.into();
            assert_eq!(bt, back);
        }
    }
}
