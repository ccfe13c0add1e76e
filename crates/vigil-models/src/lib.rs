//! Model manifest and integrity verification.
//!
//! The face pipeline needs three independently loadable artifacts: a face
//! detector, a 68-point landmark predictor and a descriptor network. Which
//! files those are, where they come from and what they hash to is described
//! by a `manifest.toml` shipped next to the models:
//!
//! ```toml
//! [[model]]
//! role = "detector"
//! name = "face_detector.onnx"
//! url = "https://models.example.org/face_detector.onnx"
//! sha256 = "<hex digest>"
//! size_display = "6 MB"
//! ```

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the manifest inside a model directory.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Which stage of the pipeline an artifact serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Detector,
    Landmarks,
    Recognizer,
}

impl ModelRole {
    pub const ALL: [ModelRole; 3] = [ModelRole::Detector, ModelRole::Landmarks, ModelRole::Recognizer];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelRole::Detector => "detector",
            ModelRole::Landmarks => "landmarks",
            ModelRole::Recognizer => "recognizer",
        }
    }
}

/// Model file descriptor: role, file name, source URL, SHA-256 checksum, human-readable size.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelFile {
    pub role: ModelRole,
    pub name: String,
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub size_display: String,
}

/// Parsed `manifest.toml`. Holds exactly one entry per [`ModelRole`].
#[derive(Debug, Clone)]
pub struct ModelManifest {
    models: Vec<ModelFile>,
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(rename = "model", default)]
    models: Vec<ModelFile>,
}

/// Resolved on-disk locations of the three artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub landmarks: PathBuf,
    pub recognizer: PathBuf,
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed manifest: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("manifest has no {} model", .0.as_str())]
    MissingRole(ModelRole),
    #[error("manifest lists more than one {} model", .0.as_str())]
    DuplicateRole(ModelRole),
    #[error("model name must be a plain file name: {0}")]
    InvalidName(String),
}

impl ModelManifest {
    /// Parse and validate a manifest from TOML text.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = toml::from_str(text)?;

        for model in &raw.models {
            let plain = Path::new(&model.name)
                .file_name()
                .is_some_and(|f| f == model.name.as_str());
            if !plain {
                return Err(ManifestError::InvalidName(model.name.clone()));
            }
        }

        for role in ModelRole::ALL {
            match raw.models.iter().filter(|m| m.role == role).count() {
                0 => return Err(ManifestError::MissingRole(role)),
                1 => {}
                _ => return Err(ManifestError::DuplicateRole(role)),
            }
        }

        Ok(Self { models: raw.models })
    }

    /// Load `manifest.toml` from a model directory.
    pub fn load(model_dir: &Path) -> Result<Self, ManifestError> {
        let path = model_dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn models(&self) -> &[ModelFile] {
        &self.models
    }

    /// Entry for a role. Always present after validation.
    pub fn get(&self, role: ModelRole) -> Option<&ModelFile> {
        self.models.iter().find(|m| m.role == role)
    }

    /// Where each artifact lives inside `model_dir`.
    pub fn paths_in(&self, model_dir: &Path) -> Result<ModelPaths, ManifestError> {
        let path_for = |role| {
            self.get(role)
                .map(|m| model_dir.join(&m.name))
                .ok_or(ManifestError::MissingRole(role))
        };
        Ok(ModelPaths {
            detector: path_for(ModelRole::Detector)?,
            landmarks: path_for(ModelRole::Landmarks)?,
            recognizer: path_for(ModelRole::Recognizer)?,
        })
    }
}

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("model file not found: {name} ({path})")]
    MissingModel { name: String, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: String,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_file_sha256(
    name: &str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if !digest.eq_ignore_ascii_case(expected_sha256) {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name: name.to_string(),
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }

    Ok(())
}

/// Verify every artifact listed in the directory's manifest and return their paths.
///
/// All three must be present and intact before any detection call is made.
pub fn verify_models_dir(model_dir: &Path) -> Result<ModelPaths, ModelIntegrityError> {
    let manifest = ModelManifest::load(model_dir)?;
    for model in manifest.models() {
        let path = model_dir.join(&model.name);
        verify_file_sha256(&model.name, &path, &model.sha256)?;
    }

    Ok(manifest.paths_in(model_dir)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "vigil-models-test-{tag}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    fn manifest_text(detector_sha: &str, landmarks_sha: &str, recognizer_sha: &str) -> String {
        format!(
            r#"
[[model]]
role = "detector"
name = "det.onnx"
url = "https://models.invalid/det.onnx"
sha256 = "{detector_sha}"

[[model]]
role = "landmarks"
name = "lm68.onnx"
url = "https://models.invalid/lm68.onnx"
sha256 = "{landmarks_sha}"

[[model]]
role = "recognizer"
name = "rec.onnx"
url = "https://models.invalid/rec.onnx"
sha256 = "{recognizer_sha}"
size_display = "7 MB"
"#
        )
    }

    #[test]
    fn parse_accepts_three_roles() {
        let manifest = ModelManifest::parse(&manifest_text("aa", "bb", "cc")).unwrap();
        assert_eq!(manifest.models().len(), 3);
        assert_eq!(manifest.get(ModelRole::Landmarks).unwrap().name, "lm68.onnx");
        assert_eq!(manifest.get(ModelRole::Recognizer).unwrap().size_display, "7 MB");

        let paths = manifest.paths_in(Path::new("/models")).unwrap();
        assert_eq!(paths.detector, PathBuf::from("/models/det.onnx"));
        assert_eq!(paths.recognizer, PathBuf::from("/models/rec.onnx"));
    }

    #[test]
    fn parse_rejects_missing_role() {
        let text = r#"
[[model]]
role = "detector"
name = "det.onnx"
url = "u"
sha256 = "00"
"#;
        let err = ModelManifest::parse(text).unwrap_err();
        assert!(matches!(err, ManifestError::MissingRole(ModelRole::Landmarks)));
    }

    #[test]
    fn parse_rejects_duplicate_role() {
        let mut text = manifest_text("aa", "bb", "cc");
        text.push_str(
            r#"
[[model]]
role = "detector"
name = "det2.onnx"
url = "u"
sha256 = "00"
"#,
        );
        let err = ModelManifest::parse(&text).unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateRole(ModelRole::Detector)));
    }

    #[test]
    fn parse_rejects_path_traversal_name() {
        let text = manifest_text("aa", "bb", "cc").replace("det.onnx", "../det.onnx");
        let err = ModelManifest::parse(&text).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidName(_)));
    }

    #[test]
    fn verify_file_sha256_rejects_missing() {
        let path = scratch_dir("missing").join("nope.onnx");
        let err = verify_file_sha256("nope.onnx", &path, "00").unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { .. }));
    }

    #[test]
    fn verify_file_sha256_rejects_mismatch() {
        let dir = scratch_dir("mismatch");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.onnx");
        fs::write(&path, b"hello").unwrap();

        let err = verify_file_sha256("model.onnx", &path, "00").unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn verify_models_dir_accepts_intact_set() {
        let dir = scratch_dir("intact");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("det.onnx"), b"detector").unwrap();
        fs::write(dir.join("lm68.onnx"), b"landmarks").unwrap();
        fs::write(dir.join("rec.onnx"), b"recognizer").unwrap();

        let det = sha256_file_hex(&dir.join("det.onnx")).unwrap();
        let lm = sha256_file_hex(&dir.join("lm68.onnx")).unwrap();
        let rec = sha256_file_hex(&dir.join("rec.onnx")).unwrap();
        fs::write(dir.join(MANIFEST_FILE), manifest_text(&det, &lm, &rec)).unwrap();

        let paths = verify_models_dir(&dir).unwrap();
        assert_eq!(paths.landmarks, dir.join("lm68.onnx"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn verify_models_dir_reports_one_missing_artifact() {
        let dir = scratch_dir("partial");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("det.onnx"), b"detector").unwrap();
        let det = sha256_file_hex(&dir.join("det.onnx")).unwrap();
        fs::write(dir.join(MANIFEST_FILE), manifest_text(&det, "bb", "cc")).unwrap();

        let err = verify_models_dir(&dir).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { ref name, .. } if name == "lm68.onnx"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn verify_models_dir_reports_missing_manifest() {
        let err = verify_models_dir(&scratch_dir("no-manifest")).unwrap_err();
        assert!(matches!(
            err,
            ModelIntegrityError::Manifest(ManifestError::Io { .. })
        ));
    }
}
