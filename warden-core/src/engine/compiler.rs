//! Policy bundle loading - turns a configured policy source into WASM bytes.
//!
//! Three sources are understood:
//! - a compiled `.wasm` module
//! - an OPA bundle (`.tar.gz` / `.tgz`) carrying `/policy.wasm` and an
//!   optional `/data.json`
//! - a directory of Rego, compiled with `opa build -t wasm` for the four
//!   phase entrypoints

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info};

use super::config::OPA_PATH_ENV;
use super::phase::Phase;

const POLICY_WASM: &str = "policy.wasm";
const DATA_JSON: &str = "data.json";

/// Compiled policy plus the bundle's base data document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyBundle {
    pub wasm: Vec<u8>,
    pub data: Option<Value>,
}

/// Find the OPA binary.
///
/// Order: explicit override, `WARDEN_OPA_PATH`, a binary next to the current
/// executable, then `opa` from `PATH`.
pub fn find_opa_binary(override_path: Option<&Path>) -> PathBuf {
    if let Some(path) = override_path {
        debug!("Using configured OPA at: {:?}", path);
        return path.to_path_buf();
    }

    if let Some(path) = std::env::var_os(OPA_PATH_ENV).map(PathBuf::from) {
        if path.exists() {
            debug!("Using OPA from {}: {:?}", OPA_PATH_ENV, path);
            return path;
        }
    }

    let binary = if cfg!(windows) { "opa.exe" } else { "opa" };
    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(exe_dir) = current_exe.parent() {
            let bundled = exe_dir.join(binary);
            if bundled.exists() {
                debug!("Using bundled OPA at: {:?}", bundled);
                return bundled;
            }
        }
    }

    debug!("Using OPA from system PATH");
    PathBuf::from(binary)
}

impl PolicyBundle {
    /// Load whatever `source` points at.
    pub async fn load(source: &Path, package: &str, opa_path: Option<&Path>) -> Result<Self> {
        info!("Loading policy from: {:?}", source);

        let metadata = tokio::fs::metadata(source)
            .await
            .with_context(|| format!("Policy source {} is not accessible", source.display()))?;

        if metadata.is_dir() {
            let opa = find_opa_binary(opa_path);
            let bundle_bytes = compile_rego(source, package, &opa).await?;
            return Self::from_tarball(&bundle_bytes);
        }

        let bytes = tokio::fs::read(source)
            .await
            .with_context(|| format!("Failed to read policy {}", source.display()))?;

        if is_tarball(source) {
            Self::from_tarball(&bytes)
                .with_context(|| format!("Failed to read OPA bundle {}", source.display()))
        } else {
            Ok(Self {
                wasm: bytes,
                data: None,
            })
        }
    }

    /// Read `policy.wasm` and `data.json` out of a gzipped OPA bundle.
    pub fn from_tarball(bytes: &[u8]) -> Result<Self> {
        use flate2::read::GzDecoder;
        use tar::Archive;

        let mut archive = Archive::new(GzDecoder::new(bytes));
        let mut bundle = PolicyBundle::default();
        let mut found_wasm = false;

        for entry in archive.entries().context("Failed to read bundle entries")? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let name = path.to_string_lossy();
            let name = name.trim_start_matches("./").trim_start_matches('/');

            match name {
                POLICY_WASM => {
                    entry.read_to_end(&mut bundle.wasm)?;
                    found_wasm = true;
                }
                DATA_JSON => {
                    let mut content = String::new();
                    entry.read_to_string(&mut content)?;
                    let data: Value =
                        serde_json::from_str(&content).context("Failed to parse bundle data.json")?;
                    bundle.data = Some(data);
                }
                other => debug!("Skipping bundle entry: {}", other),
            }
        }

        if !found_wasm {
            bail!("No {} found in OPA bundle", POLICY_WASM);
        }
        debug!(
            "Read {} bytes of WASM from bundle (data: {})",
            bundle.wasm.len(),
            bundle.data.is_some()
        );
        Ok(bundle)
    }
}

fn is_tarball(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Run `opa build` over `policy_dir` and return the bundle bytes.
pub async fn compile_rego(policy_dir: &Path, package: &str, opa: &Path) -> Result<Vec<u8>> {
    let out_dir = tempfile::tempdir().context("Failed to create build directory")?;
    let bundle_path = out_dir.path().join("bundle.tar.gz");

    let mut opa_cmd = Command::new(opa);
    opa_cmd.arg("build").arg("-t").arg("wasm").arg("-O").arg("2");
    for phase in Phase::ALL {
        opa_cmd.arg("-e").arg(phase.entrypoint(package));
    }
    opa_cmd.arg("-o").arg(&bundle_path).arg(policy_dir);

    info!("Compiling Rego in {:?} with {:?}", policy_dir, opa);
    debug!("OPA command: {:?}", opa_cmd);

    let output = opa_cmd.output().await.with_context(|| {
        format!(
            "Failed to execute {}. Is the OPA CLI installed? Set {} or opa_path to point at it",
            opa.display(),
            OPA_PATH_ENV
        )
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        error!("OPA build failed.\nStderr: {}\nStdout: {}", stderr, stdout);

        let detail = if !stderr.is_empty() {
            format!("stderr: {stderr}")
        } else if !stdout.is_empty() {
            format!("stdout: {stdout}")
        } else {
            format!("no output, exit code {:?}", output.status.code())
        };
        bail!("OPA compilation failed: {}", detail);
    }

    let bytes = tokio::fs::read(&bundle_path)
        .await
        .context("OPA did not produce a bundle")?;
    info!("OPA compilation successful ({} bytes)", bytes.len());
    Ok(bytes)
}
