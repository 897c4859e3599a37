//! Host platform detection and the cloudflared release artifact table.

/// Operating system / architecture pair the artifact table is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl std::fmt::Display for Os {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Darwin => write!(f, "darwin"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Amd64 => write!(f, "amd64"),
            Self::Arm64 => write!(f, "arm64"),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl Platform {
    /// Map Rust target names (`std::env::consts::{OS, ARCH}`) to a platform.
    /// Returns `None` for pairs cloudflared does not publish binaries for.
    pub fn detect(os: &str, arch: &str) -> Option<Self> {
        let os = match os {
            "linux" => Os::Linux,
            "macos" => Os::Darwin,
            "windows" => Os::Windows,
            _ => return None,
        };
        let arch = match arch {
            "x86_64" => Arch::Amd64,
            "aarch64" => Arch::Arm64,
            _ => return None,
        };
        Some(Self { os, arch })
    }
}

/// How a downloaded artifact must be written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Gzip-compressed tarball containing the executable.
    TarGz,
    /// The executable itself.
    Executable,
}

/// Release asset to fetch for a platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub platform: Platform,
    pub file_name: &'static str,
    pub kind: ArtifactKind,
}

impl ArtifactDescriptor {
    /// Look up the release asset for a platform.
    pub const fn for_platform(platform: Platform) -> Self {
        let (file_name, kind) = match (platform.os, platform.arch) {
            (Os::Darwin, Arch::Arm64) => ("cloudflared-darwin-arm64.tgz", ArtifactKind::TarGz),
            (Os::Darwin, Arch::Amd64) => ("cloudflared-darwin-amd64.tgz", ArtifactKind::TarGz),
            (Os::Linux, Arch::Amd64) => ("cloudflared-linux-amd64", ArtifactKind::Executable),
            (Os::Linux, Arch::Arm64) => ("cloudflared-linux-arm64", ArtifactKind::Executable),
            // No native arm64 build is published; the amd64 one runs under emulation.
            (Os::Windows, _) => ("cloudflared-windows-amd64.exe", ArtifactKind::Executable),
        };
        Self {
            platform,
            file_name,
            kind,
        }
    }

    /// Resolve from Rust target names. `None` means unsupported.
    pub fn resolve(os: &str, arch: &str) -> Option<Self> {
        Platform::detect(os, arch).map(Self::for_platform)
    }
}
