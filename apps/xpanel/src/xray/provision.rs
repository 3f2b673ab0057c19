use anyhow::{Context, anyhow};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Result;

const LATEST_RELEASE_URL: &str = "https://api.github.com/repos/XTLS/Xray-core/releases/latest";
const USER_AGENT: &str = "xpanel";

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Clone)]
pub struct InstalledBinary {
    pub version: String,
    pub path: PathBuf,
    pub sha256: String,
}

/// Release archive name for an `std::env::consts` OS/arch pair.
pub fn asset_name(os: &str, arch: &str) -> Option<String> {
    let os = match os {
        "linux" => "linux",
        "macos" => "macos",
        "windows" => "windows",
        "freebsd" => "freebsd",
        _ => return None,
    };
    let arch = match arch {
        "x86_64" => "64",
        "x86" => "32",
        "aarch64" => "arm64-v8a",
        "arm" => "arm32-v7a",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        _ => return None,
    };
    Some(format!("Xray-{}-{}.zip", os, arch))
}

/// Pulls the SHA-256 line out of a release `.dgst` file.
pub fn parse_dgst(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (algo, hash) = line.split_once('=')?;
        let algo = algo.trim().to_ascii_uppercase();
        (algo == "SHA2-256" || algo == "SHA256").then(|| hash.trim().to_ascii_lowercase())
    })
}

fn binary_entry_name(os: &str) -> &'static str {
    if os == "windows" { "xray.exe" } else { "xray" }
}

/// Downloads the latest Xray-core release for this host and installs it at `target`.
///
/// The running process keeps its inode; the new binary is picked up on the
/// next start.
pub async fn install_latest(target: &Path) -> Result<InstalledBinary> {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    let wanted = asset_name(os, arch).ok_or_else(|| anyhow!("No Xray build for {}/{}", os, arch))?;

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to build HTTP client")?;

    let response = client
        .get(LATEST_RELEASE_URL)
        .send()
        .await
        .context("Failed to query latest Xray release")?;
    if !response.status().is_success() {
        return Err(anyhow!("Failed to resolve latest Xray release (status {})", response.status()).into());
    }
    let release: GitHubRelease = response.json().await.context("Failed to parse release metadata")?;
    info!("⬇️ Downloading Xray {} ({})", release.tag_name, wanted);

    let archive = release
        .assets
        .iter()
        .find(|a| a.name == wanted)
        .ok_or_else(|| anyhow!("Release {} has no asset {}", release.tag_name, wanted))?;
    let bytes = download(&client, &archive.browser_download_url).await?;

    let digest = hex::encode(Sha256::digest(&bytes));
    let dgst_name = format!("{}.dgst", wanted);
    match release.assets.iter().find(|a| a.name == dgst_name) {
        Some(dgst) => {
            let text = String::from_utf8_lossy(&download(&client, &dgst.browser_download_url).await?).into_owned();
            let expected = parse_dgst(&text).ok_or_else(|| anyhow!("{} has no SHA-256 entry", dgst_name))?;
            if expected != digest {
                return Err(anyhow!("Checksum mismatch! Expected {}, got {}", expected, digest).into());
            }
            info!("✅ Checksum verified: {}", digest);
        }
        None => warn!("⚠️ Release {} has no {}, skipping checksum verification", release.tag_name, dgst_name),
    }

    let target_path = target.to_path_buf();
    let entry = binary_entry_name(os);
    tokio::task::spawn_blocking(move || extract_and_install(&bytes, entry, &target_path))
        .await
        .context("Install task panicked")??;

    info!("✅ Installed Xray {} at {}", release.tag_name, target.display());
    Ok(InstalledBinary {
        version: release.tag_name,
        path: target.to_path_buf(),
        sha256: digest,
    })
}

async fn download(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download {}", url))?;
    if !response.status().is_success() {
        return Err(anyhow!("Failed to download file from {}: Status {}", url, response.status()).into());
    }
    let bytes = response.bytes().await.context("Failed to read download body")?;
    Ok(bytes.to_vec())
}

/// Extracts `entry` from a zip archive and swaps it in at `target`.
pub fn extract_and_install(archive: &[u8], entry: &str, target: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).context("Failed to open release archive")?;
    let mut binary = Vec::new();
    zip.by_name(entry)
        .with_context(|| format!("Archive has no {} entry", entry))?
        .read_to_end(&mut binary)
        .context("Failed to extract binary")?;

    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let file_name = target
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("Invalid binary path: {}", target.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp.{}", file_name, uuid::Uuid::new_v4().simple()));

    let installed = (|| -> std::io::Result<()> {
        let mut tmp_file = std::fs::File::create(&tmp_path)?;
        tmp_file.write_all(&binary)?;
        tmp_file.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o755))?;
        }
        // Rename, not overwrite: the old binary may be executing.
        std::fs::rename(&tmp_path, target)
    })();

    if let Err(e) = installed {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            for (name, data) in entries {
                writer.start_file(*name, zip::write::FileOptions::default()).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn asset_names_follow_release_naming() {
        assert_eq!(asset_name("linux", "x86_64").unwrap(), "Xray-linux-64.zip");
        assert_eq!(asset_name("linux", "aarch64").unwrap(), "Xray-linux-arm64-v8a.zip");
        assert_eq!(asset_name("macos", "aarch64").unwrap(), "Xray-macos-arm64-v8a.zip");
        assert_eq!(asset_name("windows", "x86_64").unwrap(), "Xray-windows-64.zip");
        assert!(asset_name("haiku", "x86_64").is_none());
        assert!(asset_name("linux", "sparc").is_none());
    }

    #[test]
    fn dgst_sha256_line_is_found() {
        let text = "MD5= 0cc175b9c0f1b6a831c399e269772661\n\
                    SHA1= 86f7e437faa5a7fce15d1ddcb9eaeaea377667b8\n\
                    SHA2-256= CA978112CA1BBDCAFAC231B39A23DC4DA786EFF8147C4E72B9807785AFEE48BB\n\
                    SHA2-512= 1f40fc92da241694750979ee6cf582f2d5d7d28e18335de05abc54d0560e0f53\n";
        assert_eq!(
            parse_dgst(text).unwrap(),
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );
        assert!(parse_dgst("MD5= abc\n").is_none());
    }

    #[test]
    fn binary_is_extracted_and_made_executable() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bin/xray");
        let archive = archive_with(&[("geoip.dat", b"geo"), ("xray", b"#!/bin/sh\necho new\n")]);

        extract_and_install(&archive, "xray", &target).unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"#!/bin/sh\necho new\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        let stray: Vec<_> = std::fs::read_dir(dir.path().join("bin"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(stray.is_empty());
    }

    #[test]
    fn archive_without_binary_leaves_target_alone() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("xray");
        std::fs::write(&target, b"old").unwrap();
        let archive = archive_with(&[("README.md", b"docs")]);

        assert!(extract_and_install(&archive, "xray", &target).is_err());
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
    }
}
