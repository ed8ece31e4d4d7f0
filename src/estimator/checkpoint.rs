use crate::error::{CtrError, Result};
use crate::model::Model;
use json::{object, JsonValue};
use ndarray::{ArrayD, IxDyn};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "checkpoint";

/// Write the variables of the model and the global step to `path`
pub fn write_checkpoint(path: &Path, model: &dyn Model, global_step: u64) -> Result<()> {
    let mut variables = JsonValue::new_object();

    for (name, value) in model.variables() {
        let shape: Vec<usize> = value.shape().to_vec();
        let data: Vec<f64> = value.iter().copied().collect();
        variables[name] = object! { shape: shape, data: data };
    }

    let data = object! {
        global_step: global_step,
        variables: variables,
    };

    let mut file = File::create(path)?;
    file.write_all(data.dump().as_bytes())?;

    Ok(())
}

/// Read a checkpoint back into `(global step, variables)`
pub fn read_checkpoint(path: &Path) -> Result<(u64, Vec<(String, ArrayD<f64>)>)> {
    let data = json::parse(&fs::read_to_string(path)?)?;
    let bad = |what: &str| CtrError::Checkpoint(format!("{}: {}", path.display(), what));

    let global_step = data["global_step"].as_u64().ok_or_else(|| bad("missing global_step"))?;
    let mut variables = vec![];

    for (name, value) in data["variables"].entries() {
        let shape = value["shape"]
            .members()
            .map(|x| x.as_usize())
            .collect::<Option<Vec<usize>>>()
            .ok_or_else(|| bad(&format!("bad shape for '{}'", name)))?;
        let values = value["data"]
            .members()
            .map(|x| x.as_f64())
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| bad(&format!("bad data for '{}'", name)))?;
        let array = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| bad(&format!("'{}': {}", name, e)))?;

        variables.push((name.to_string(), array));
    }

    Ok((global_step, variables))
}

/// Saves checkpoints into a model directory, keeping the newest `keep_max`.
/// The directory holds `model.ckpt-<step>.json` files and an index file
/// named `checkpoint` listing the retained ones, oldest first
pub struct CheckpointManager {
    model_dir: PathBuf,
    keep_max: usize,
}

impl CheckpointManager {
    pub fn new(model_dir: &Path, keep_max: usize) -> CheckpointManager {
        CheckpointManager {
            model_dir: model_dir.to_path_buf(),
            keep_max: keep_max.max(1),
        }
    }

    /// File names of the retained checkpoints, oldest first
    pub fn checkpoints(&self) -> Result<Vec<String>> {
        let index = self.model_dir.join(INDEX_FILE);

        if !index.exists() {
            return Ok(vec![]);
        }

        let data = json::parse(&fs::read_to_string(&index)?)?;
        Ok(data["all_model_checkpoint_paths"]
            .members()
            .filter_map(|x| x.as_str().map(str::to_string))
            .collect())
    }

    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.checkpoints()?.last().map(|name| self.model_dir.join(name)))
    }

    pub fn save(&self, model: &dyn Model, global_step: u64) -> Result<PathBuf> {
        fs::create_dir_all(&self.model_dir)?;

        let name = format!("model.ckpt-{}.json", global_step);
        let path = self.model_dir.join(&name);
        write_checkpoint(&path, model, global_step)?;

        let mut all = self.checkpoints()?;
        all.retain(|n| *n != name);
        all.push(name.clone());

        while all.len() > self.keep_max {
            let stale = all.remove(0);
            if let Err(e) = fs::remove_file(self.model_dir.join(&stale)) {
                log::warn!("could not delete old checkpoint {}: {}", stale, e);
            }
        }

        let index = object! {
            model_checkpoint_path: name,
            all_model_checkpoint_paths: all,
        };
        fs::write(self.model_dir.join(INDEX_FILE), index.dump())?;

        Ok(path)
    }

    /// Load the newest checkpoint into the model. Returns its global step
    pub fn restore(&self, model: &mut dyn Model) -> Result<Option<u64>> {
        let Some(path) = self.latest()? else {
            return Ok(None);
        };

        let (global_step, variables) = read_checkpoint(&path)?;
        for (name, value) in variables {
            model.assign(&name, value)?;
        }

        log::info!("Restored parameters from {}", path.display());

        Ok(Some(global_step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::deepfm::{DeepFm, DeepFmParams};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model(seed: u64) -> DeepFm {
        let params = DeepFmParams {
            embedding_dim: 3,
            hidden_units: vec![4, 2],
            ..DeepFmParams::new(8, 2)
        };
        DeepFm::new(&params, &mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn restores_saved_variables() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3);
        let saved = model(1);

        manager.save(&saved, 50).unwrap();

        let mut restored = model(2);
        assert_eq!(manager.restore(&mut restored).unwrap(), Some(50));
        for ((name_a, a), (name_b, b)) in saved.variables().into_iter().zip(restored.variables()) {
            assert_eq!(name_a, name_b);
            assert_eq!(a.shape(), b.shape());
            assert!(a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-12));
        }
    }

    #[test]
    fn keeps_newest_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3);
        let m = model(1);

        for step in [50, 100, 150, 200] {
            manager.save(&m, step).unwrap();
        }

        assert_eq!(
            manager.checkpoints().unwrap(),
            vec!["model.ckpt-100.json", "model.ckpt-150.json", "model.ckpt-200.json"]
        );
        assert!(!dir.path().join("model.ckpt-50.json").exists());
        assert_eq!(
            manager.latest().unwrap(),
            Some(dir.path().join("model.ckpt-200.json"))
        );
    }

    #[test]
    fn empty_directory_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(&dir.path().join("missing"), 3);

        assert_eq!(manager.restore(&mut model(1)).unwrap(), None);
    }

    #[test]
    fn mismatched_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3);
        manager.save(&model(1), 10).unwrap();

        let params = DeepFmParams {
            embedding_dim: 5,
            hidden_units: vec![4, 2],
            ..DeepFmParams::new(8, 2)
        };
        let mut other = DeepFm::new(&params, &mut StdRng::seed_from_u64(0));

        assert!(manager.restore(&mut other).is_err());
    }
}
