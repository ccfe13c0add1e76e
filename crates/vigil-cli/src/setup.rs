//! `vigil setup` installs the model artifacts named by a manifest.

use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use vigil_models::{
    verify_file_sha256, verify_models_dir, ModelFile, ModelManifest, ModelPaths, MANIFEST_FILE,
};

/// Outcome of an install run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SetupReport {
    pub downloaded: usize,
    pub skipped: usize,
}

/// Root installs system-wide under `/var/lib/vigil/models`; everyone else
/// gets `$XDG_DATA_HOME/vigil/models`.
pub fn default_model_dir() -> PathBuf {
    if is_root() {
        PathBuf::from("/var/lib/vigil/models")
    } else {
        let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.local/share")
        });
        PathBuf::from(data_home).join("vigil/models")
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

fn resolve_dir(model_dir: Option<PathBuf>) -> PathBuf {
    model_dir.unwrap_or_else(default_model_dir)
}

fn download_model(model: &ModelFile, dest: &Path) -> Result<()> {
    let tmp_path = dest.with_file_name(format!("{}.part", model.name));

    if model.size_display.is_empty() {
        println!("  downloading {}...", model.name);
    } else {
        println!("  downloading {} ({})...", model.name, model.size_display);
    }

    let resp = ureq::get(model.url.as_str())
        .call()
        .with_context(|| format!("failed to download {}", model.url))?;

    let content_length = resp
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut reader = resp.into_body().into_reader();
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut buf = [0u8; 65536];
    let mut total: u64 = 0;
    let mut last_pct: u64 = 0;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        total += n as u64;

        if let Some(len) = content_length.filter(|len| *len > 0) {
            let pct = (total * 100) / len;
            if pct / 10 > last_pct / 10 {
                print!("  {pct}%\r");
                io::stdout().flush().ok();
                last_pct = pct;
            }
        }
    }

    file.flush()?;
    drop(file);

    print!("  verifying checksum... ");
    io::stdout().flush().ok();
    if let Err(e) = verify_file_sha256(&model.name, &tmp_path, &model.sha256) {
        fs::remove_file(&tmp_path).ok();
        return Err(e.into());
    }
    println!("ok");

    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to rename {} -> {}",
            tmp_path.display(),
            dest.display()
        )
    })?;
    tracing::debug!(model = %model.name, bytes = total, "model installed");

    Ok(())
}

/// Install every artifact of `manifest_path` into `dir`, then place the
/// manifest next to them so the directory verifies on its own.
pub fn install(manifest_path: &Path, dir: &Path) -> Result<SetupReport> {
    let text = fs::read_to_string(manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest = ModelManifest::parse(&text)
        .with_context(|| format!("invalid manifest {}", manifest_path.display()))?;

    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut report = SetupReport::default();

    for model in manifest.models() {
        let dest = dir.join(&model.name);
        if dest.exists() {
            match verify_file_sha256(&model.name, &dest, &model.sha256) {
                Ok(()) => {
                    println!("  {} already present (checksum ok)", model.name);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::debug!(model = %model.name, error = %e, "existing file rejected");
                    println!("  {} exists but does not verify, re-downloading", model.name);
                }
            }
        }

        download_model(model, &dest)?;
        report.downloaded += 1;
    }

    fs::write(dir.join(MANIFEST_FILE), text)
        .with_context(|| format!("failed to write manifest into {}", dir.display()))?;

    Ok(report)
}

/// Run the setup command.
pub fn run(manifest_path: PathBuf, model_dir: Option<PathBuf>) -> Result<()> {
    let dir = resolve_dir(model_dir);
    println!("Model directory: {}", dir.display());

    let report = install(&manifest_path, &dir)?;

    println!();
    if report.downloaded > 0 {
        println!(
            "Setup complete: {} model(s) downloaded, {} already present.",
            report.downloaded, report.skipped
        );
    } else {
        println!("All models already present. Nothing to download.");
    }

    Ok(())
}

/// Run the check-models command.
pub fn check(model_dir: Option<PathBuf>) -> Result<ModelPaths> {
    let dir = resolve_dir(model_dir);
    let paths = verify_models_dir(&dir)
        .with_context(|| format!("model directory {} does not verify", dir.display()))?;

    println!("Model directory: {}", dir.display());
    println!("  detector:   {}", paths.detector.display());
    println!("  landmarks:  {}", paths.landmarks.display());
    println!("  recognizer: {}", paths.recognizer.display());
    println!("All models verified.");
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_models::sha256_file_hex;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "vigil-cli-test-{tag}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Writes three model files into `dir` and returns a manifest whose
    /// checksums match them. URLs point at a port nothing listens on.
    fn seed(dir: &Path) -> String {
        let mut entries = String::new();
        for (role, name) in [
            ("detector", "det.onnx"),
            ("landmarks", "lm68.onnx"),
            ("recognizer", "rec.onnx"),
        ] {
            let path = dir.join(name);
            fs::write(&path, format!("weights for {role}")).unwrap();
            let sha = sha256_file_hex(&path).unwrap();
            entries.push_str(&format!(
                "[[model]]\nrole = \"{role}\"\nname = \"{name}\"\nurl = \"http://127.0.0.1:9/{name}\"\nsha256 = \"{sha}\"\n\n"
            ));
        }
        entries
    }

    #[test]
    fn intact_files_are_not_downloaded_again() {
        let dir = scratch_dir("intact");
        let manifest_path = dir.join("source-manifest.toml");
        fs::write(&manifest_path, seed(&dir)).unwrap();

        let report = install(&manifest_path, &dir).unwrap();
        assert_eq!(
            report,
            SetupReport {
                downloaded: 0,
                skipped: 3
            }
        );

        // The manifest now lives in the directory and the directory verifies.
        let paths = check(Some(dir.clone())).unwrap();
        assert_eq!(paths.landmarks, dir.join("lm68.onnx"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_file_triggers_download() {
        let dir = scratch_dir("corrupt");
        let manifest_path = dir.join("source-manifest.toml");
        fs::write(&manifest_path, seed(&dir)).unwrap();
        fs::write(dir.join("rec.onnx"), b"truncated").unwrap();

        // The download fails (nothing listens on port 9), so install errors
        // out and does not publish the manifest.
        assert!(install(&manifest_path, &dir).is_err());
        assert!(!dir.join(MANIFEST_FILE).exists());
        assert!(!dir.join("rec.onnx.part").exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn invalid_manifest_is_rejected_before_touching_the_directory() {
        let dir = scratch_dir("invalid");
        let manifest_path = dir.join("source-manifest.toml");
        fs::write(&manifest_path, "[[model]]\nrole = \"detector\"\n").unwrap();
        let target = dir.join("models");

        assert!(install(&manifest_path, &target).is_err());
        assert!(!target.exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn explicit_model_dir_wins() {
        assert_eq!(
            resolve_dir(Some(PathBuf::from("/opt/models"))),
            PathBuf::from("/opt/models")
        );
    }
}
