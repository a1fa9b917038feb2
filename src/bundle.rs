//! Reproducible bundle assembly and retrieval
//!
//! A bundle holds the application source under `app/`, each ecosystem's staged
//! sources under `deps/<ecosystem>/`, and `vendorbox-manifest.json` describing what
//! was resolved. Identical inputs always produce identical bytes.

use crate::archive::{self, DeterministicArchive, VCS_METADATA_DIRS};
use crate::error::{Result, VendorError};
use crate::models::{BundleRef, Dependency, Ecosystem, Package, Request};
use crate::state::RequestState;
use crate::tools::CancelSignal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const MANIFEST_NAME: &str = "vendorbox-manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub packages: Vec<Package>,
    pub dependencies: Vec<Dependency>,
    pub environment_variables: BTreeMap<String, String>,
    /// Variables to resolve against the directory the bundle is extracted to
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub path_variables: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct AssemblyInput {
    /// The working tree written as `app/`
    pub source_root: PathBuf,
    /// Staging directory per ecosystem, written as `deps/<ecosystem>/`
    pub staged: BTreeMap<Ecosystem, PathBuf>,
    pub manifest: BundleManifest,
}

#[derive(Debug, Clone)]
pub struct BundleAssembler {
    bundles_dir: PathBuf,
    timeout: Duration,
}

impl BundleAssembler {
    pub fn new(bundles_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bundles_dir: bundles_dir.into(),
            timeout,
        }
    }

    pub fn bundle_path(&self, request_id: u64) -> PathBuf {
        self.bundles_dir.join(format!("{}.tar.gz", request_id))
    }

    pub async fn assemble(
        &self,
        request_id: u64,
        input: AssemblyInput,
        cancel: &CancelSignal,
    ) -> Result<BundleRef> {
        let tmp_dir = self.bundles_dir.join("tmp");
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|e| VendorError::io(tmp_dir.display(), e))?;
        let staging = tmp_dir.join(format!("{}-{}.tar.gz.part", request_id, uuid::Uuid::new_v4()));
        let target = self.bundle_path(request_id);

        let (write_to, publish_to) = (staging.clone(), target.clone());
        let outcome = cancel
            .guard(
                "assembling the bundle",
                self.timeout,
                crate::scm::blocking(move || {
                    write_bundle(&input, &write_to)?;
                    archive::publish(&write_to, &publish_to)?;
                    let sha256 = archive::sha256_file(&publish_to)?;
                    let size = std::fs::metadata(&publish_to)?.len();
                    Ok((sha256, size))
                }),
            )
            .await;

        let (sha256, size) = match outcome {
            Ok(published) => published,
            Err(err) => {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(err);
            }
        };
        info!(request_id, %sha256, size, "Bundle published");
        Ok(BundleRef {
            path: target,
            sha256,
            size,
        })
    }

    /// Bytes of a completed request's bundle, re-verified against the stored digest
    pub async fn open(&self, request: &Request) -> Result<Vec<u8>> {
        if request.state() != RequestState::Complete {
            return Err(VendorError::InvalidState(format!(
                "The request must be in the \"{}\" state to download its bundle, it is \"{}\"",
                RequestState::Complete,
                request.state()
            )));
        }
        let bundle = request.bundle.as_ref().ok_or_else(|| {
            VendorError::NotFound(format!("The bundle of request {} does not exist", request.id))
        })?;
        let path = bundle.path.clone();
        let (data, actual) = tokio::task::spawn_blocking(move || {
            std::fs::read(&path).map(|data| {
                let digest = crate::resolvers::sha256_hex(&data);
                (data, digest)
            })
        })
        .await
        .map_err(|e| VendorError::Internal(format!("Reading the bundle failed: {}", e)))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VendorError::NotFound(format!("The bundle of request {} does not exist", request.id))
            } else {
                VendorError::io(bundle.path.display(), e)
            }
        })?;
        if actual != bundle.sha256 {
            return Err(VendorError::Integrity(format!(
                "The bundle of request {} does not match its recorded checksum",
                request.id
            )));
        }
        debug!(request_id = request.id, size = data.len(), "Serving bundle");
        Ok(data)
    }
}

fn write_bundle(input: &AssemblyInput, path: &Path) -> anyhow::Result<()> {
    let file = File::create(path)?;
    let mut writer = DeterministicArchive::new(BufWriter::new(file));

    writer.append_tree("app", &input.source_root, VCS_METADATA_DIRS)?;
    writer.append_dir("deps")?;
    for (ecosystem, dir) in &input.staged {
        if dir.is_dir() {
            writer.append_tree(&format!("deps/{}", ecosystem), dir, &[])?;
        }
    }
    let mut manifest = serde_json::to_vec_pretty(&input.manifest)?;
    manifest.push(b'\n');
    writer.append_bytes(MANIFEST_NAME, &manifest)?;

    let buffered = writer.finish()?;
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}
