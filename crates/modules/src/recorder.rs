//! Recorder - writes every received item to a JSON-lines dataset

use std::fs::File;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use contracts::{ModuleBlueprint, ModuleDriver, ModuleFeatures, TestSubject};
use engine::{Module, ModuleContext, ModuleError, OptionalWaitCondition};
use parking_lot::Mutex;
use serde::Serialize;
use stream::{InputPort, ModulePorts, StreamItem};
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::registry::resolve_driver;

pub const KIND: &str = "recorder";

/// Id of the input port
pub const INPUT_PORT: &str = "in";

/// File extension of recorded datasets
pub const DATA_EXTENSION: &str = "jsonl";

/// Poll interval while no input is connected
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Configuration for [`Recorder`]
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Dataset purpose, also the file stem
    pub purpose: String,
    pub driver: ModuleDriver,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            purpose: "data".to_string(),
            driver: ModuleDriver::ThreadDedicated,
        }
    }
}

impl RecorderConfig {
    /// Create config from a blueprint entry
    pub fn from_blueprint(bp: &ModuleBlueprint) -> Result<Self> {
        Ok(Self {
            purpose: bp.param_str("purpose").unwrap_or("data").to_string(),
            driver: resolve_driver(bp, ModuleDriver::ThreadDedicated, &[ModuleDriver::ThreadDedicated])?,
        })
    }
}

/// Sink that persists items of type `T` into the run's collection.
///
/// Runs without storage only count what they receive.
pub struct Recorder<T: StreamItem + Serialize> {
    name: String,
    config: RecorderConfig,
    ports: ModulePorts,
    input: Arc<InputPort<T>>,
    writer: Mutex<Option<(PathBuf, BufWriter<File>)>>,
    received: AtomicU64,
    _item: PhantomData<fn(T)>,
}

impl<T: StreamItem + Serialize> Recorder<T> {
    pub fn new(name: impl Into<String>, config: RecorderConfig) -> Self {
        let mut ports = ModulePorts::new();
        let input = ports.add_input(INPUT_PORT, "Recorded items");
        Self {
            name: name.into(),
            config,
            ports,
            input,
            writer: Mutex::new(None),
            received: AtomicU64::new(0),
            _item: PhantomData,
        }
    }

    /// Create from a blueprint entry (for the registry)
    pub fn from_blueprint(bp: &ModuleBlueprint) -> Result<Self> {
        Ok(Self::new(&bp.name, RecorderConfig::from_blueprint(bp)?))
    }

    /// Items received during the last run
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn write_item(&self, item: &T) -> std::result::Result<(), ModuleError> {
        let mut guard = self.writer.lock();
        if let Some((path, writer)) = guard.as_mut() {
            serde_json::to_writer(&mut *writer, item)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                .and_then(|()| writer.write_all(b"\n"))
                .map_err(|e| {
                    error!(module = %self.name, path = %path.display(), error = %e, "write failed");
                    ModuleError::from(e)
                })?;
        }
        Ok(())
    }

    fn finish(&self) -> std::result::Result<(), ModuleError> {
        if let Some((path, mut writer)) = self.writer.lock().take() {
            writer.flush()?;
            info!(
                module = %self.name,
                path = %path.display(),
                items = self.received(),
                "dataset written"
            );
        }
        Ok(())
    }
}

impl<T: StreamItem + Serialize> Module for Recorder<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        KIND
    }

    fn driver(&self) -> ModuleDriver {
        self.config.driver
    }

    fn features(&self) -> ModuleFeatures {
        ModuleFeatures::WRITES_DATA
    }

    fn ports(&self) -> &ModulePorts {
        &self.ports
    }

    #[instrument(name = "recorder_prepare", skip_all, fields(module = %self.name))]
    fn prepare(&self, ctx: &ModuleContext, _test_subject: &TestSubject) -> std::result::Result<(), ModuleError> {
        self.received.store(0, Ordering::Relaxed);
        let writer = match ctx.dataset_dir(&self.config.purpose)? {
            Some(dir) => {
                let path = dir.join(format!("{}.{DATA_EXTENSION}", self.config.purpose));
                let file = File::create(&path)?;
                debug!(path = %path.display(), "dataset file created");
                Some((path, BufWriter::new(file)))
            }
            None => None,
        };
        *self.writer.lock() = writer;
        Ok(())
    }

    fn run_thread(
        &self,
        ctx: &ModuleContext,
        start_wait: &OptionalWaitCondition,
    ) -> std::result::Result<(), ModuleError> {
        start_wait.wait();

        match self.input.subscription() {
            Some(subscription) => {
                while let Some(item) = subscription.next() {
                    self.received.fetch_add(1, Ordering::Relaxed);
                    self.write_item(&item)?;
                }
            }
            None => {
                debug!("no input connected, idling");
                while ctx.is_running() {
                    std::thread::sleep(IDLE_POLL);
                }
            }
        }

        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::SynchronizerConfig;

    #[test]
    fn test_config_from_blueprint() {
        let mut bp = ModuleBlueprint {
            name: "rec".into(),
            kind: KIND.into(),
            driver: None,
            events_group: None,
            sync: SynchronizerConfig::default(),
            params: Default::default(),
        };
        assert_eq!(RecorderConfig::from_blueprint(&bp).unwrap().purpose, "data");

        bp.params.insert("purpose".into(), serde_json::json!("eeg"));
        let recorder = Recorder::<u64>::from_blueprint(&bp).unwrap();
        assert_eq!(recorder.config.purpose, "eeg");
        assert_eq!(recorder.features(), ModuleFeatures::WRITES_DATA);
        assert!(recorder.ports().input(INPUT_PORT).is_some());
    }

    #[test]
    fn test_items_without_writer_are_counted_only() {
        let recorder = Recorder::<u64>::new("rec", RecorderConfig::default());
        recorder.write_item(&7).unwrap();
        assert!(recorder.finish().is_ok());
    }

    #[test]
    fn test_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let recorder = Recorder::<(u64, i64)>::new("rec", RecorderConfig::default());
        *recorder.writer.lock() = Some((path.clone(), BufWriter::new(File::create(&path).unwrap())));

        recorder.write_item(&(1, -5)).unwrap();
        recorder.write_item(&(2, 10)).unwrap();
        recorder.finish().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "[1,-5]\n[2,10]\n");
        assert!(recorder.writer.lock().is_none());
    }
}
