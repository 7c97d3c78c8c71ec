use flate2::read::GzDecoder;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tar::Archive;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::InstallError;

pub const DAEMON_BINARY: &str = "nebula";
pub const CERT_BINARY: &str = "nebula-cert";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const USER_AGENT: &str = concat!("nebula-tower/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

/// Platform-specific nebula release archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    pub platform: String,
    pub archive: String,
    pub url: String,
}

impl InstallTarget {
    pub fn format(&self) -> ArchiveFormat {
        if self.archive.ends_with(".zip") {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::TarGz
        }
    }

    /// Executable suffix used inside this target's archive.
    pub fn exe_suffix(&self) -> &'static str {
        if self.platform.starts_with("windows") {
            ".exe"
        } else {
            ""
        }
    }
}

/// Maps an OS/arch pair (as in `std::env::consts`) to its release archive.
pub fn resolve_target(os: &str, arch: &str, base_url: &str) -> Result<InstallTarget, InstallError> {
    let (platform, archive) = match (os, arch) {
        ("macos", "x86_64" | "aarch64") => ("darwin", "nebula-darwin.zip"),
        ("linux", "x86_64") => ("linux-amd64", "nebula-linux-amd64.tar.gz"),
        ("linux", "aarch64") => ("linux-arm64", "nebula-linux-arm64.tar.gz"),
        ("windows", "x86_64") => ("windows-amd64", "nebula-windows-amd64.zip"),
        _ => {
            return Err(InstallError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            })
        }
    };

    Ok(InstallTarget {
        platform: platform.to_string(),
        archive: archive.to_string(),
        url: format!("{}/{}", base_url.trim_end_matches('/'), archive),
    })
}

pub fn current_target(base_url: &str) -> Result<InstallTarget, InstallError> {
    resolve_target(std::env::consts::OS, std::env::consts::ARCH, base_url)
}

fn host_exe_name(name: &str) -> String {
    format!("{}{}", name, std::env::consts::EXE_SUFFIX)
}

/// The two nebula executables at their canonical location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinarySet {
    pub daemon: PathBuf,
    pub cert_tool: PathBuf,
}

impl BinarySet {
    pub fn in_dir(bin_dir: &Path) -> Self {
        Self {
            daemon: bin_dir.join(host_exe_name(DAEMON_BINARY)),
            cert_tool: bin_dir.join(host_exe_name(CERT_BINARY)),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.daemon.is_file() && self.cert_tool.is_file()
    }
}

/// Downloads and installs nebula release archives. One install at a time.
pub struct Installer {
    client: reqwest::Client,
    in_flight: Mutex<()>,
}

impl Installer {
    pub fn new() -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| InstallError::Download {
                url: String::new(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            in_flight: Mutex::new(()),
        })
    }

    /// Rejects with [`InstallError::Busy`] while another install holds the destination.
    pub async fn install(
        &self,
        target: &InstallTarget,
        dest_dir: &Path,
    ) -> Result<BinarySet, InstallError> {
        let _guard = self.in_flight.try_lock().map_err(|_| InstallError::Busy)?;

        info!(url = %target.url, dest = %dest_dir.display(), "Installing nebula binaries");
        tokio::fs::create_dir_all(dest_dir).await?;

        // Removed on drop, including every error path below.
        let scratch = tempfile::Builder::new()
            .prefix("nebula-install-")
            .tempdir()?;

        let archive_path = scratch.path().join(&target.archive);
        self.download(&target.url, &archive_path).await?;

        let target = target.clone();
        let extract_dir = scratch.path().join("extracted");
        let dest = dest_dir.to_path_buf();
        let binaries = tokio::task::spawn_blocking(move || {
            extract_archive(target.format(), &archive_path, &extract_dir)?;
            place_binaries(&extract_dir, &dest, target.exe_suffix())
        })
        .await
        .map_err(|e| InstallError::Io(io::Error::other(e)))??;

        info!(
            daemon = %binaries.daemon.display(),
            cert_tool = %binaries.cert_tool.display(),
            "Nebula binaries installed"
        );
        Ok(binaries)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), InstallError> {
        debug!(url, "Downloading archive");
        let download_err = |reason: String| InstallError::Download {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_err(format!("Failed to download asset: {}", e)))?;

        if !response.status().is_success() {
            return Err(download_err(format!("Server returned status: {}", response.status())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| download_err(format!("Failed to read response bytes: {}", e)))?;

        tokio::fs::write(dest, &bytes).await?;
        debug!(bytes = bytes.len(), path = %dest.display(), "Archive downloaded");
        Ok(())
    }
}

fn extract_archive(format: ArchiveFormat, archive_path: &Path, dest: &Path) -> Result<(), InstallError> {
    let extract_err = |reason: String| InstallError::Extract {
        archive: archive_path.display().to_string(),
        reason,
    };

    fs::create_dir_all(dest)?;
    let file = fs::File::open(archive_path)?;

    match format {
        ArchiveFormat::TarGz => {
            let mut archive = Archive::new(GzDecoder::new(file));
            let entries = archive
                .entries()
                .map_err(|e| extract_err(format!("Failed to read tar archive: {}", e)))?;

            for entry in entries {
                let mut entry =
                    entry.map_err(|e| extract_err(format!("Failed to read tar entry: {}", e)))?;
                if !entry.header().entry_type().is_file() {
                    continue;
                }
                entry
                    .unpack_in(dest)
                    .map_err(|e| extract_err(format!("Failed to unpack tar entry: {}", e)))?;
            }
        }
        ArchiveFormat::Zip => {
            let mut archive = ZipArchive::new(file)
                .map_err(|e| extract_err(format!("Failed to read zip archive: {}", e)))?;

            for i in 0..archive.len() {
                let mut entry = archive
                    .by_index(i)
                    .map_err(|e| extract_err(format!("Failed to read zip entry: {}", e)))?;
                if entry.is_dir() {
                    continue;
                }
                // Entries escaping the extraction root are skipped.
                let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
                    continue;
                };
                let out_path = dest.join(relative);
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = fs::File::create(&out_path)?;
                io::copy(&mut entry, &mut out)
                    .map_err(|e| extract_err(format!("Failed to write zip entry: {}", e)))?;
            }
        }
    }

    Ok(())
}

fn find_file(root: &Path, file_name: &str) -> io::Result<Option<PathBuf>> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_file() && entry.file_name().as_os_str() == std::ffi::OsStr::new(file_name) {
            return Ok(Some(path));
        }
        if file_type.is_dir() {
            if let Some(found) = find_file(&path, file_name)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

/// Copies both executables from the extracted tree into `dest_dir`.
fn place_binaries(extract_dir: &Path, dest_dir: &Path, suffix: &str) -> Result<BinarySet, InstallError> {
    let mut located = Vec::with_capacity(2);
    for name in [DAEMON_BINARY, CERT_BINARY] {
        let file_name = format!("{}{}", name, suffix);
        let source = find_file(extract_dir, &file_name)?
            .ok_or_else(|| InstallError::BinaryNotFound(file_name.clone()))?;
        located.push((source, dest_dir.join(file_name)));
    }

    for (source, dest) in &located {
        install_file(source, dest)?;
        debug!(from = %source.display(), to = %dest.display(), "Installed binary");
    }

    Ok(BinarySet {
        daemon: located[0].1.clone(),
        cert_tool: located[1].1.clone(),
    })
}

/// Staged copy + rename so `dest` is never observed half-written.
fn install_file(source: &Path, dest: &Path) -> io::Result<()> {
    let staged = dest.with_extension("partial");
    fs::copy(source, &staged)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&staged)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&staged, perms)?;
    }

    if let Err(e) = fs::rename(&staged, dest) {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    const SUPPORTED: &[(&str, &str)] = &[
        ("macos", "x86_64"),
        ("macos", "aarch64"),
        ("linux", "x86_64"),
        ("linux", "aarch64"),
        ("windows", "x86_64"),
    ];

    #[test]
    fn test_resolve_supported_targets() {
        for (os, arch) in SUPPORTED {
            let target = resolve_target(os, arch, "https://example.com/dl/").unwrap();
            assert!(!target.archive.is_empty());
            assert_eq!(target.url, format!("https://example.com/dl/{}", target.archive));
        }

        let linux = resolve_target("linux", "aarch64", "https://x").unwrap();
        assert_eq!(linux.archive, "nebula-linux-arm64.tar.gz");
        assert_eq!(linux.format(), ArchiveFormat::TarGz);

        let windows = resolve_target("windows", "x86_64", "https://x").unwrap();
        assert_eq!(windows.format(), ArchiveFormat::Zip);
        assert_eq!(windows.exe_suffix(), ".exe");
    }

    #[test]
    fn test_resolve_unsupported_targets() {
        for (os, arch) in [
            ("linux", "riscv64"),
            ("linux", "x86"),
            ("windows", "aarch64"),
            ("freebsd", "x86_64"),
            ("", ""),
        ] {
            let err = resolve_target(os, arch, "https://x").unwrap_err();
            assert!(matches!(err, InstallError::UnsupportedPlatform { .. }), "{os}/{arch}");
        }
    }

    #[test]
    fn test_place_binaries_walks_nested_tree() {
        let extracted = tempfile::tempdir().unwrap();
        let nested = extracted.path().join("release").join("bin");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("nebula"), b"daemon").unwrap();
        fs::write(extracted.path().join("nebula-cert"), b"cert").unwrap();
        fs::write(extracted.path().join("README.md"), b"docs").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let set = place_binaries(extracted.path(), dest.path(), "").unwrap();

        assert_eq!(fs::read(&set.daemon).unwrap(), b"daemon");
        assert_eq!(fs::read(&set.cert_tool).unwrap(), b"cert");
        assert!(!dest.path().join("README.md").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&set.daemon).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_place_binaries_missing_cert_tool() {
        let extracted = tempfile::tempdir().unwrap();
        fs::write(extracted.path().join("nebula"), b"daemon").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let err = place_binaries(extracted.path(), dest.path(), "").unwrap_err();
        assert!(matches!(err, InstallError::BinaryNotFound(ref name) if name == "nebula-cert"));
        assert!(!dest.path().join("nebula").exists());
    }

    #[test]
    fn test_extract_zip_preserves_paths() {
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("a.zip");
        fs::write(
            &archive,
            test_support::zip(&[("dist/nebula.exe", b"d"), ("dist/nebula-cert.exe", b"c")]),
        )
        .unwrap();

        let out = scratch.path().join("out");
        extract_archive(ArchiveFormat::Zip, &archive, &out).unwrap();
        assert!(out.join("dist").join("nebula.exe").is_file());
        assert!(out.join("dist").join("nebula-cert.exe").is_file());
    }

    #[test]
    fn test_extract_corrupt_archive() {
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("broken.tar.gz");
        fs::write(&archive, b"definitely not gzip").unwrap();

        let err = extract_archive(ArchiveFormat::TarGz, &archive, &scratch.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, InstallError::Extract { .. }));
    }

    fn linux_target(base_url: &str) -> InstallTarget {
        resolve_target("linux", "x86_64", base_url).unwrap()
    }

    #[tokio::test]
    async fn test_install_from_server() {
        let archive = test_support::tar_gz(&[
            ("nebula-linux-amd64/nebula", b"daemon-bytes"),
            ("nebula-linux-amd64/nebula-cert", b"cert-bytes"),
        ]);
        let server = test_support::serve(200, archive, Duration::ZERO).await;
        let dest = tempfile::tempdir().unwrap();

        let installer = Installer::new().unwrap();
        let set = installer
            .install(&linux_target(&server.url("")), dest.path())
            .await
            .unwrap();

        assert_eq!(fs::read(&set.daemon).unwrap(), b"daemon-bytes");
        assert_eq!(fs::read(&set.cert_tool).unwrap(), b"cert-bytes");
    }

    #[tokio::test]
    async fn test_install_download_failure() {
        let server = test_support::serve(404, b"missing".to_vec(), Duration::ZERO).await;
        let dest = tempfile::tempdir().unwrap();

        let installer = Installer::new().unwrap();
        let err = installer
            .install(&linux_target(&server.url("")), dest.path())
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::Download { .. }));
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_install_is_rejected() {
        let archive = test_support::tar_gz(&[("nebula", b"daemon"), ("nebula-cert", b"cert")]);
        let server = test_support::serve(200, archive, Duration::from_millis(100)).await;
        let dest = tempfile::tempdir().unwrap();
        let target = linux_target(&server.url(""));

        let installer = Installer::new().unwrap();
        let (first, second) = tokio::join!(
            installer.install(&target, dest.path()),
            installer.install(&target, dest.path())
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(InstallError::Busy)));
        assert_eq!(server.hits(), 1);

        let mut names: Vec<_> = fs::read_dir(dest.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["nebula", "nebula-cert"]);
        assert_eq!(fs::read(dest.path().join("nebula")).unwrap(), b"daemon");
    }
}
