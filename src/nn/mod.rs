//! Subprocess model bridge
//!
//! Training and inference talk to an external executable over newline-
//! delimited JSON: one `{"x":[...],"y":[...]}` record per stdin line; for
//! inference the process answers with one JSON float array per line, in
//! input order. The trainer writes a JSON artifact containing at least a
//! `threshold` field, which is persisted into the store's calibration row.
//!
//! `ModelRunner` is the capability seam: a pure in-process model can stand in
//! for the subprocess without touching the pipeline.

use crate::store::{Store, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// One training/inference record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSample {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
}

/// Trainer options, passed to the subprocess as CLI flags.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub hidden: usize,
    pub epochs: usize,
    pub lr: f32,
    pub val_split: f32,
    pub patience: usize,
    pub calibrate: bool,
    pub checkpoint: Option<String>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            hidden: 64,
            epochs: 10,
            lr: 0.01,
            val_split: 0.2,
            patience: 3,
            calibrate: true,
            checkpoint: None,
        }
    }
}

#[derive(Debug)]
pub enum ModelError {
    Io(std::io::Error),
    Exit(String),
    Decode(String),
    Store(StoreError),
    NoSamples,
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Io(e) => write!(f, "model subprocess I/O error: {}", e),
            ModelError::Exit(msg) => write!(f, "model subprocess failed: {}", msg),
            ModelError::Decode(msg) => write!(f, "model output decode error: {}", msg),
            ModelError::Store(e) => write!(f, "model store error: {}", e),
            ModelError::NoSamples => write!(f, "no labeled samples to train on"),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<std::io::Error> for ModelError {
    fn from(e: std::io::Error) -> Self {
        ModelError::Io(e)
    }
}

impl From<StoreError> for ModelError {
    fn from(e: StoreError) -> Self {
        ModelError::Store(e)
    }
}

/// Capability interface over the external predictor.
#[async_trait]
pub trait ModelRunner: Send + Sync {
    async fn train(&self, samples: &[FeatureSample], opts: &TrainOptions) -> Result<(), ModelError>;
    async fn infer(&self, samples: &[FeatureSample]) -> Result<Vec<Vec<f32>>, ModelError>;
}

/// Runs the external model binary as a subprocess.
pub struct SubprocessModel {
    binary_path: String,
    model_path: String,
}

impl SubprocessModel {
    pub fn new(binary_path: &str, model_path: &str) -> Self {
        Self {
            binary_path: binary_path.to_string(),
            model_path: model_path.to_string(),
        }
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    async fn run(&self, args: &[String], stdin_payload: String) -> Result<Vec<u8>, ModelError> {
        let mut child = Command::new(&self.binary_path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ModelError::Exit("subprocess stdin unavailable".to_string()))?;
        // write concurrently with output collection so a child that streams
        // predictions cannot deadlock on a full pipe; dropping stdin sends EOF
        let writer = tokio::spawn(async move {
            let _ = stdin.write_all(stdin_payload.as_bytes()).await;
        });

        let output = child.wait_with_output().await?;
        let _ = writer.await;
        if !output.status.success() {
            return Err(ModelError::Exit(format!(
                "{} {:?}: {}",
                self.binary_path,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

fn encode_jsonl(samples: &[FeatureSample]) -> Result<String, ModelError> {
    let mut buf = String::new();
    for s in samples {
        let line = serde_json::to_string(s).map_err(|e| ModelError::Decode(e.to_string()))?;
        buf.push_str(&line);
        buf.push('\n');
    }
    Ok(buf)
}

#[async_trait]
impl ModelRunner for SubprocessModel {
    async fn train(&self, samples: &[FeatureSample], opts: &TrainOptions) -> Result<(), ModelError> {
        let mut args: Vec<String> = vec![
            "train".to_string(),
            "--out".to_string(),
            self.model_path.clone(),
            "--hidden".to_string(),
            opts.hidden.to_string(),
            "--epochs".to_string(),
            opts.epochs.to_string(),
            "--lr".to_string(),
            opts.lr.to_string(),
            "--val-split".to_string(),
            opts.val_split.to_string(),
            "--patience".to_string(),
            opts.patience.to_string(),
        ];
        if opts.calibrate {
            args.push("--calibrate".to_string());
        }
        if let Some(ckpt) = &opts.checkpoint {
            args.push("--checkpoint".to_string());
            args.push(ckpt.clone());
        }

        let payload = encode_jsonl(samples)?;
        self.run(&args, payload).await?;
        Ok(())
    }

    async fn infer(&self, samples: &[FeatureSample]) -> Result<Vec<Vec<f32>>, ModelError> {
        let args = vec![
            "infer".to_string(),
            "--model".to_string(),
            self.model_path.clone(),
        ];
        let payload = encode_jsonl(samples)?;
        let stdout = self.run(&args, payload).await?;

        let text = String::from_utf8_lossy(&stdout);
        let mut preds = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let arr: Vec<f32> = serde_json::from_str(line)
                .map_err(|e| ModelError::Decode(format!("bad prediction line {:?}: {}", line, e)))?;
            preds.push(arr);
        }
        if preds.len() != samples.len() {
            return Err(ModelError::Decode(format!(
                "expected {} prediction lines, got {}",
                samples.len(),
                preds.len()
            )));
        }
        Ok(preds)
    }
}

/// Reads the `threshold` field of a JSON model artifact. None when the file
/// is missing or unparsable.
pub fn artifact_threshold(path: &str) -> Option<f64> {
    let raw = std::fs::read_to_string(path).ok()?;
    #[derive(Deserialize)]
    struct Artifact {
        threshold: Option<f64>,
    }
    serde_json::from_str::<Artifact>(&raw).ok()?.threshold
}

/// Trains on every labeled window in `[start, end)` and persists the artifact
/// threshold into the calibration row. Returns the sample count.
pub async fn train_from_store(
    store: &Store,
    runner: &dyn ModelRunner,
    model_path: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    opts: &TrainOptions,
) -> Result<usize, ModelError> {
    let (_, xs, ys) = store.load_features(start, end)?;
    let samples: Vec<FeatureSample> = xs
        .into_iter()
        .zip(ys)
        .filter(|(_, y)| *y >= 0.0)
        .map(|(x, y)| FeatureSample { x, y: vec![y] })
        .collect();
    if samples.is_empty() {
        return Err(ModelError::NoSamples);
    }

    runner.train(&samples, opts).await?;

    if let Some(thr) = artifact_threshold(model_path) {
        if thr > 0.0 {
            store.save_threshold(thr)?;
            log::info!("🎯 Calibration threshold saved: {:.4}", thr);
        }
    }
    Ok(samples.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use std::sync::Mutex;

    struct RecordingRunner {
        trained: Mutex<Vec<FeatureSample>>,
    }

    #[async_trait]
    impl ModelRunner for RecordingRunner {
        async fn train(
            &self,
            samples: &[FeatureSample],
            _opts: &TrainOptions,
        ) -> Result<(), ModelError> {
            self.trained.lock().unwrap().extend(samples.iter().cloned());
            Ok(())
        }

        async fn infer(&self, samples: &[FeatureSample]) -> Result<Vec<Vec<f32>>, ModelError> {
            Ok(samples.iter().map(|_| vec![0.5]).collect())
        }
    }

    #[tokio::test]
    async fn test_train_from_store_filters_unlabeled() {
        let store = Store::open_in_memory().unwrap();
        let w0 = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let w1 = Utc.with_ymd_and_hms(2024, 3, 4, 10, 15, 0).unwrap();
        store.put_feature(w0, &[1.0, 2.0], Some(0.7), None).unwrap();
        store.put_feature(w1, &[3.0, 4.0], None, None).unwrap(); // unlabeled

        let runner = RecordingRunner {
            trained: Mutex::new(Vec::new()),
        };
        let n = train_from_store(
            &store,
            &runner,
            "/nonexistent/model.json",
            w0,
            w1 + chrono::Duration::minutes(15),
            &TrainOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(n, 1);
        let trained = runner.trained.lock().unwrap();
        assert_eq!(trained.len(), 1);
        assert_eq!(trained[0].x, vec![1.0, 2.0]);
        assert_eq!(trained[0].y, vec![0.7]);
    }

    #[tokio::test]
    async fn test_train_from_store_errors_without_labels() {
        let store = Store::open_in_memory().unwrap();
        let w = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        store.put_feature(w, &[1.0], None, None).unwrap();

        let runner = RecordingRunner {
            trained: Mutex::new(Vec::new()),
        };
        let err = train_from_store(
            &store,
            &runner,
            "/nonexistent/model.json",
            w,
            w + chrono::Duration::minutes(15),
            &TrainOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ModelError::NoSamples));
    }

    #[test]
    fn test_artifact_threshold_parsing() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"threshold": 0.31, "w1": []}}"#).unwrap();
        let path = f.path().to_str().unwrap();
        assert_eq!(artifact_threshold(path), Some(0.31));
        assert_eq!(artifact_threshold("/nonexistent/model.json"), None);
    }

    #[test]
    fn test_jsonl_encoding_shape() {
        let samples = vec![
            FeatureSample {
                x: vec![1.0, 2.0],
                y: vec![0.5],
            },
            FeatureSample {
                x: vec![3.0],
                y: vec![],
            },
        ];
        let jsonl = encode_jsonl(&samples).unwrap();
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"x":[1.0,2.0],"y":[0.5]}"#);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_protocol_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        // stand-in model binary: emits one prediction line per input line
        // and, for train, writes an artifact with a threshold to --out ($3)
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fake-nn");
        let model = dir.path().join("model.json");
        std::fs::write(
            &bin,
            "#!/bin/sh\n\
             if [ \"$1\" = \"train\" ]; then\n\
             cat > /dev/null\n\
             echo '{\"threshold\": 0.42}' > \"$3\"\n\
             else\n\
             while read line; do echo '[0.25]'; done\n\
             fi\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&bin).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&bin, perms).unwrap();

        let runner = SubprocessModel::new(bin.to_str().unwrap(), model.to_str().unwrap());
        let samples = vec![
            FeatureSample {
                x: vec![1.0],
                y: vec![0.0],
            },
            FeatureSample {
                x: vec![2.0],
                y: vec![1.0],
            },
        ];

        runner.train(&samples, &TrainOptions::default()).await.unwrap();
        assert_eq!(artifact_threshold(model.to_str().unwrap()), Some(0.42));

        let preds = runner.infer(&samples).await.unwrap();
        assert_eq!(preds, vec![vec![0.25], vec![0.25]]);
    }
}
