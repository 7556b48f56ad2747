//! Model archives
//!
//! A saved model is a zip holding two members:
//!
//! - `model_params.json`: `{"init_params": <HyperParams>, "class_attrs": <ClassAttrs>}`
//! - `network.safetensors`: every network variable, keyed by its `VarMap` path
//!
//! Custom losses, factories and metric sets are not written; they have to be
//! attached again after loading.

use crate::classifier::{ClassAttrs, SimsClassifier};
use crate::model_config::HyperParams;
use candle_core::{Device, Tensor};
use scsims_core::{DeviceSpec, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const PARAMS_FILE: &str = "model_params.json";
pub const WEIGHTS_FILE: &str = "network.safetensors";

#[derive(Debug, Serialize, Deserialize)]
struct SavedParams {
    init_params: HyperParams,
    #[serde(default)]
    class_attrs: ClassAttrs,
}

fn zip_error(e: ZipError) -> Error {
    Error::archive(e.to_string())
}

/// `path` with `.zip` appended to its final component
fn archive_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".zip");
    PathBuf::from(name)
}

fn has_zip_extension(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

fn read_member<R: Read + io::Seek>(zip: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut member = zip.by_name(name).map_err(|e| match e {
        ZipError::FileNotFound => Error::archive(format!(
            "Your zip file is missing at least one component ({} not found)",
            name
        )),
        other => zip_error(other),
    })?;
    // members are buffered whole; the weight reader needs a contiguous slice
    let mut bytes = Vec::with_capacity(member.size() as usize);
    member.read_to_end(&mut bytes)?;
    Ok(bytes)
}

impl SimsClassifier {
    /// Write the model to `{path}.zip` and return that path. A `path` already
    /// ending in `.zip` is written as is.
    ///
    /// `path` minus any `.zip` is used as a staging directory and removed once
    /// the archive exists.
    pub fn save_model(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let staging = if has_zip_extension(path) {
            path.with_extension("")
        } else {
            path.to_path_buf()
        };
        let staging = staging.as_path();
        for name in self.unserializable_params() {
            warn!(
                param = name,
                "Not saving custom {}; attach it again after loading", name
            );
        }

        fs::create_dir_all(staging)?;
        let params = SavedParams {
            init_params: self.hparams.clone(),
            class_attrs: self.class_attrs.clone(),
        };
        fs::write(staging.join(PARAMS_FILE), serde_json::to_vec(&params)?)?;
        self.varmap.save(staging.join(WEIGHTS_FILE))?;

        let archive = archive_path(staging);
        let mut zip = ZipWriter::new(File::create(&archive)?);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for member in [PARAMS_FILE, WEIGHTS_FILE] {
            zip.start_file(member, options).map_err(zip_error)?;
            let mut source = File::open(staging.join(member))?;
            io::copy(&mut source, &mut zip)?;
        }
        zip.finish().map_err(zip_error)?.flush()?;

        fs::remove_dir_all(staging)?;
        info!(path = %archive.display(), "Saved model");
        Ok(archive)
    }

    /// Rebuild a classifier from an archive onto `device`, in eval mode
    pub fn load(archive: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let archive = archive.as_ref();
        let file = File::open(archive)?;
        let mut zip = ZipArchive::new(BufReader::new(file)).map_err(zip_error)?;

        let params = read_member(&mut zip, PARAMS_FILE)?;
        let blob = read_member(&mut zip, WEIGHTS_FILE)?;

        let SavedParams {
            mut init_params,
            class_attrs,
        } = serde_json::from_slice(&params)?;
        init_params.device = DeviceSpec::from_device(device);

        let tensors = candle_core::safetensors::load_buffer(&blob, device)
            .map_err(|e| Error::archive(format!("Unreadable weights in {}: {}", WEIGHTS_FILE, e)))?;

        let mut classifier = Self::on_device(init_params, device.clone())?;
        classifier.copy_weights(&tensors)?;
        classifier.eval();
        classifier.class_attrs = class_attrs;

        info!(path = %archive.display(), tensors = tensors.len(), "Loaded model");
        Ok(classifier)
    }

    /// Replace this classifier with the one stored in `archive`, keeping the current device
    pub fn load_model(&mut self, archive: impl AsRef<Path>) -> Result<()> {
        let device = self.device.clone();
        *self = Self::load(archive, &device)?;
        Ok(())
    }

    fn copy_weights(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("variable map lock poisoned"))?;

        for (name, var) in vars.iter() {
            let saved = tensors.get(name).ok_or_else(|| {
                Error::archive(format!("{} has no tensor for '{}'", WEIGHTS_FILE, name))
            })?;
            var.set(&saved.to_dtype(var.dtype())?)?;
        }

        let unused = tensors.keys().filter(|k| !vars.contains_key(*k)).count();
        if unused > 0 {
            debug!(unused, "Ignoring archive tensors without a matching variable");
        }
        Ok(())
    }
}
