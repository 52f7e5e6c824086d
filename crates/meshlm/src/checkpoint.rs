// Checkpoint hooks: restore before the first step, save at step boundaries
//
// A CheckpointHook is called by the step controller:
//
//   restore(store)            once, before any computation that reads a
//                             variable; may return the restored global step
//   after_update(step, store) after the updates of `step` are applied
//
// FileCheckpointHook writes `model.ckpt-{step}.mlm` files into a directory
// every `steps_per_checkpoint` steps and restores the newest one.
//
// Binary format (.mlm):
//
//   Header:
//     magic:   [u8; 4]  = b"MSLM"
//     version: u32 LE   = 1
//     step:    u64 LE
//     count:   u32 LE   = number of variables
//
//   For each variable:
//     key_len:  u32 LE
//     key:      [u8; key_len]  (UTF-8 variable path, e.g. "h0/attn/q")
//     dtype:    u8             (0=F16, 1=BF16, 2=F32, 3=F64, 4=I64)
//     ndim:     u32 LE
//     dims:     ndim × (name_len u32 LE, name [u8], size u32 LE)
//     data_len: u64 LE         (in bytes)
//     data:     [u8; data_len] (little-endian, storage dtype)

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use meshlm_core::{DType, Dim, Error, Result, Shape, VarStore, Variable};

const MAGIC: &[u8; 4] = b"MSLM";
const VERSION: u32 = 1;
const PREFIX: &str = "model.ckpt-";
const EXTENSION: &str = ".mlm";

/// Persistence around training steps.
pub trait CheckpointHook {
    /// Load saved state into `store`. Returns the step it was saved at.
    fn restore(&mut self, store: &VarStore) -> Result<Option<u64>>;

    /// Called once the updates of `step` are applied.
    fn after_update(&mut self, step: u64, store: &VarStore) -> Result<()>;
}

/// One variable as stored in a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub path: String,
    pub shape: Shape,
    pub dtype: DType,
    pub data: Vec<f64>,
}

// Encoding

fn encode(data: &[f64], dtype: DType) -> Vec<u8> {
    match dtype {
        DType::F16 => data
            .iter()
            .flat_map(|&v| half::f16::from_f64(v).to_le_bytes())
            .collect(),
        DType::BF16 => data
            .iter()
            .flat_map(|&v| half::bf16::from_f64(v).to_le_bytes())
            .collect(),
        DType::F32 => data.iter().flat_map(|&v| (v as f32).to_le_bytes()).collect(),
        DType::F64 => data.iter().flat_map(|&v| v.to_le_bytes()).collect(),
        DType::I64 => data.iter().flat_map(|&v| (v as i64).to_le_bytes()).collect(),
    }
}

fn decode(bytes: &[u8], dtype: DType) -> Vec<f64> {
    match dtype {
        DType::F16 => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f64())
            .collect(),
        DType::BF16 => bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f64())
            .collect(),
        DType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        DType::F64 => bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect(),
        DType::I64 => bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64)
            .collect(),
    }
}

// Low-level IO helpers

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_str(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_str(r: &mut impl Read) -> Result<String> {
    let len = read_u32(r)? as usize;
    String::from_utf8(read_bytes(r, len)?)
        .map_err(|e| Error::msg(format!("invalid UTF-8 in checkpoint: {e}")))
}

// Read / write

/// Write `variables` in their storage dtype.
pub fn write_checkpoint(
    writer: &mut impl Write,
    step: u64,
    variables: &[&Variable],
) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u32(writer, VERSION)?;
    write_u64(writer, step)?;
    write_u32(writer, variables.len() as u32)?;

    for var in variables {
        write_str(writer, var.path())?;
        let dtype = var.dtype().storage;
        writer.write_all(&[dtype.to_u8()])?;
        let dims = var.shape().dims();
        write_u32(writer, dims.len() as u32)?;
        for d in dims {
            write_str(writer, d.name())?;
            write_u32(writer, d.size() as u32)?;
        }
        let data = encode(&var.tensor().to_f64_vec()?, dtype);
        write_u64(writer, data.len() as u64)?;
        writer.write_all(&data)?;
    }
    Ok(())
}

/// Read a checkpoint: the saved step and every record.
pub fn read_checkpoint(reader: &mut impl Read) -> Result<(u64, Vec<Record>)> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::msg(format!(
            "invalid checkpoint: expected magic {MAGIC:?}, got {magic:?}"
        )));
    }
    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(Error::msg(format!(
            "unsupported checkpoint version {version} (expected {VERSION})"
        )));
    }
    let step = read_u64(reader)?;
    let count = read_u32(reader)? as usize;

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let path = read_str(reader)?;
        let dtype = DType::from_u8(read_u8(reader)?)?;
        let ndim = read_u32(reader)? as usize;
        let mut dims = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            let name = read_str(reader)?;
            dims.push(Dim::new(name, read_u32(reader)? as usize));
        }
        let data_len = read_u64(reader)? as usize;
        let data = decode(&read_bytes(reader, data_len)?, dtype);
        records.push(Record {
            path,
            shape: Shape::new(dims)?,
            dtype,
            data,
        });
    }
    Ok((step, records))
}

/// Save every variable of `store` to `path`.
pub fn save_store(path: impl AsRef<Path>, step: u64, store: &VarStore) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        let vars: Vec<&Variable> = store.variables().collect();
        write_checkpoint(&mut writer, step, &vars)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load `path` into `store`. Every saved variable must exist in the store
/// with the same named shape. Returns the saved step.
pub fn load_store(path: impl AsRef<Path>, store: &VarStore) -> Result<u64> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let (step, records) = read_checkpoint(&mut reader)?;
    for r in &records {
        let var = store
            .get(&r.path)
            .ok_or_else(|| Error::msg(format!("checkpoint variable '{}' is not in the model", r.path)))?;
        if !var.shape().same_dims(&r.shape) {
            return Err(Error::shape(format!(
                "checkpoint variable '{}' has shape {}, the model has {}",
                r.path,
                r.shape,
                var.shape()
            )));
        }
        let data = if var.shape() == &r.shape {
            r.data.clone()
        } else {
            meshlm_core::Tensor::new(r.data.clone(), r.shape.clone(), DType::F64)?
                .to_f64_vec_in(var.shape())?
        };
        var.assign(&data)?;
    }
    Ok(step)
}

/// Directory-backed hook saving every `steps_per_checkpoint` steps.
#[derive(Debug, Clone)]
pub struct FileCheckpointHook {
    dir: PathBuf,
    steps_per_checkpoint: usize,
}

impl FileCheckpointHook {
    /// `steps_per_checkpoint = 0` never saves.
    pub fn new(dir: impl Into<PathBuf>, steps_per_checkpoint: usize) -> Self {
        Self {
            dir: dir.into(),
            steps_per_checkpoint,
        }
    }

    pub fn path_for(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{step}{EXTENSION}"))
    }

    /// The newest checkpoint in the directory, if any.
    pub fn latest(&self) -> Result<Option<(u64, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let mut best = None;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(PREFIX))
                .and_then(|n| n.strip_suffix(EXTENSION))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(step) = step {
                if best.as_ref().map_or(true, |(s, _)| step > *s) {
                    best = Some((step, path));
                }
            }
        }
        Ok(best)
    }
}

impl CheckpointHook for FileCheckpointHook {
    fn restore(&mut self, store: &VarStore) -> Result<Option<u64>> {
        match self.latest()? {
            Some((_, path)) => {
                let step = load_store(&path, store)?;
                log::info!("restored {} variables from {}", store.len(), path.display());
                Ok(Some(step))
            }
            None => {
                log::info!("no checkpoint in {}, starting fresh", self.dir.display());
                Ok(None)
            }
        }
    }

    fn after_update(&mut self, step: u64, store: &VarStore) -> Result<()> {
        if self.steps_per_checkpoint == 0 || step % self.steps_per_checkpoint as u64 != 0 {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(step);
        save_store(&path, step, store)?;
        log::info!("saved step {step} to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::{Init, VariableDType};

    fn store(precision: VariableDType, seed: u64) -> VarStore {
        let mut vs = VarStore::new(precision, seed);
        let mut root = vs.root();
        root.get(
            "wte",
            Shape::from_pairs(&[("vocab", 5), ("embd", 3)]).unwrap(),
            Init::Normal { std: 1.0 },
        )
        .unwrap();
        root.pp("ln_f")
            .get("g", Shape::from_pairs(&[("embd", 3)]).unwrap(), Init::Ones)
            .unwrap();
        vs
    }

    #[test]
    fn test_roundtrip_in_memory() {
        let vs = store(VariableDType::from_preset("bfloat16").unwrap(), 1);
        let vars: Vec<&Variable> = vs.variables().collect();
        let mut buf = Vec::new();
        write_checkpoint(&mut buf, 7, &vars).unwrap();
        let (step, records) = read_checkpoint(&mut buf.as_slice()).unwrap();
        assert_eq!(step, 7);
        assert_eq!(records.len(), 2);
        let wte = records.iter().find(|r| r.path == "wte").unwrap();
        assert_eq!(wte.shape.names(), vec!["vocab", "embd"]);
        assert_eq!(wte.data, vs.get("wte").unwrap().tensor().to_f64_vec().unwrap());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes: &[u8] = b"NOPE\x01\x00\x00\x00";
        assert!(read_checkpoint(&mut bytes).is_err());
    }

    #[test]
    fn test_hook_saves_on_schedule_and_restores_latest() {
        let dir = tempfile::tempdir().unwrap();
        let precision = VariableDType::uniform(DType::F32);
        let saved = store(precision, 1);
        let mut hook = FileCheckpointHook::new(dir.path(), 2);
        hook.after_update(1, &saved).unwrap();
        assert!(hook.latest().unwrap().is_none());
        hook.after_update(2, &saved).unwrap();
        hook.after_update(4, &saved).unwrap();
        assert_eq!(hook.latest().unwrap().unwrap().0, 4);

        let fresh = store(precision, 2);
        assert_ne!(
            fresh.get("wte").unwrap().tensor().to_f64_vec().unwrap(),
            saved.get("wte").unwrap().tensor().to_f64_vec().unwrap()
        );
        assert_eq!(hook.restore(&fresh).unwrap(), Some(4));
        assert_eq!(
            fresh.get("wte").unwrap().tensor().to_f64_vec().unwrap(),
            saved.get("wte").unwrap().tensor().to_f64_vec().unwrap()
        );
    }

    #[test]
    fn test_restore_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let precision = VariableDType::uniform(DType::F64);
        let path = dir.path().join("model.ckpt-1.mlm");
        save_store(&path, 1, &store(precision, 1)).unwrap();

        let mut other = VarStore::new(precision, 0);
        other
            .root()
            .get("wte", Shape::from_pairs(&[("vocab", 4), ("embd", 3)]).unwrap(), Init::Zeros)
            .unwrap();
        other
            .root()
            .pp("ln_f")
            .get("g", Shape::from_pairs(&[("embd", 3)]).unwrap(), Init::Ones)
            .unwrap();
        assert!(load_store(&path, &other).unwrap_err().is_shape_error());
    }
}
