//! # Integration Tests
//!
//! Cross-crate end-to-end scenarios:
//! - blueprint text -> registry -> engine run -> collection on disk
//! - datasets and TimeSyncFiles written by real runs
//! - engine events folded into the run summary

#[cfg(test)]
mod e2e_tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::{
        CollectionManifest, ContractError, EngineEvent, RunBlueprint, ShutdownConfig,
        TimeSyncDataType, TimeSyncStrategies,
    };
    use engine::{
        Collection, DirectoryStorage, Engine, EngineContext, RecordingTuning, StorageBackend,
    };
    use modules::ModuleRegistry;
    use observability::RunStatsAggregator;
    use sync_engine::TimeSyncFileReader;
    use tokio::sync::broadcast::error::TryRecvError;

    const BLUEPRINT: &str = r#"
        [test_subject]
        id = "S01"

        [engine]
        collection_name = "bench"

        [[modules]]
        name = "daq"
        kind = "sample_counter"
        [modules.sync]
        calibration_window = 10
        [modules.params]
        frequency_hz = 1000.0
        block_size = 10

        [[modules]]
        name = "rec"
        kind = "recorder"

        [[modules]]
        name = "cam"
        kind = "clock_frames"
        driver = "events_shared"
        events_group = "video"
        [modules.sync]
        calibration_window = 10
        [modules.params]
        frame_rate_hz = 100.0
        clock_offset_us = 1000000

        [[modules]]
        name = "cam_rec"
        kind = "recorder"
        [modules.params]
        item = "frames"
        purpose = "frames"

        [[modules]]
        name = "probe"
        kind = "latency_probe"
        [modules.params]
        item = "frames"

        [[connections]]
        source = "daq"
        output = "samples"
        target = "rec"
        input = "in"

        [[connections]]
        source = "cam"
        output = "frames"
        target = "cam_rec"
        input = "in"

        [[connections]]
        source = "cam"
        output = "frames"
        target = "probe"
        input = "in"
    "#;

    fn load_blueprint(export_dir: &Path) -> RunBlueprint {
        let mut blueprint = ConfigLoader::load_from_str(BLUEPRINT, ConfigFormat::Toml).unwrap();
        blueprint.engine.export_dir = Some(export_dir.to_path_buf());
        blueprint.engine.shutdown = ShutdownConfig {
            drain_window_ms: 200,
            join_timeout_ms: 3000,
            join_retry_timeout_ms: 1000,
        };
        for name in ["daq", "cam"] {
            let module = blueprint.modules.iter_mut().find(|m| m.name == name).unwrap();
            module.sync.strategies |= TimeSyncStrategies::WRITE_TSYNCFILE;
        }
        blueprint
    }

    /// Directory storage where a directory already occupies the sample tsync path
    struct BlockedTsyncStorage(DirectoryStorage);

    impl StorageBackend for BlockedTsyncStorage {
        fn create_collection(&self, name: &str) -> Result<Collection, ContractError> {
            self.0.create_collection(name)
        }

        fn dataset_dir(
            &self,
            collection: &Collection,
            module: &str,
            purpose: &str,
        ) -> Result<std::path::PathBuf, ContractError> {
            let dir = self.0.dataset_dir(collection, module, purpose)?;
            if purpose == "samples" {
                std::fs::create_dir_all(dir.join("samples.tsync"))?;
            }
            Ok(dir)
        }

        fn save_manifest(
            &self,
            collection: &Collection,
            manifest: &CollectionManifest,
        ) -> Result<(), ContractError> {
            self.0.save_manifest(collection, manifest)
        }
    }

    fn build_engine(blueprint: &RunBlueprint) -> Engine {
        let context = EngineContext::default()
            .with_tuning(Arc::new(RecordingTuning::new()))
            .with_test_subject(blueprint.test_subject.clone())
            .with_seed(7);
        install(context, blueprint)
    }

    fn install(context: EngineContext, blueprint: &RunBlueprint) -> Engine {
        let mut engine = Engine::new(context, blueprint.engine.clone());
        ModuleRegistry::with_builtins()
            .install(&mut engine, blueprint)
            .unwrap();
        engine
    }

    fn stop_after(engine: &Engine, delay: Duration) {
        let stop = engine.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            stop.request_stop();
        });
    }

    fn read_json_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_blueprint_execution_order() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = build_engine(&load_blueprint(tmp.path()));
        assert_eq!(
            engine.execution_order(),
            vec!["daq", "cam", "rec", "cam_rec", "probe"]
        );
        assert_eq!(engine.stop_order(), engine.execution_order());
    }

    #[tokio::test]
    async fn test_persistent_run_records_collection() {
        let tmp = tempfile::tempdir().unwrap();
        let blueprint = load_blueprint(tmp.path());
        let mut engine = build_engine(&blueprint);

        let mut events = engine.subscribe_events();
        stop_after(&engine, Duration::from_millis(1500));
        let report = engine.run().await.unwrap();
        assert!(report.success, "{:?}", report.failure_reason);
        assert!(report.errors.is_empty());

        let collection = report.collection.unwrap();
        assert!(collection.root.starts_with(tmp.path()));

        // manifest
        let manifest = DirectoryStorage::load_manifest(&collection.root).unwrap();
        assert!(manifest.success);
        assert_eq!(manifest.collection_id, collection.id);
        assert_eq!(manifest.test_subject.id, "S01");
        let mut datasets: Vec<(String, String)> = manifest
            .datasets
            .iter()
            .map(|d| (d.module.clone(), d.purpose.clone()))
            .collect();
        datasets.sort();
        assert_eq!(
            datasets,
            vec![
                ("cam".to_string(), "frames".to_string()),
                ("cam_rec".to_string(), "frames".to_string()),
                ("daq".to_string(), "samples".to_string()),
                ("rec".to_string(), "data".to_string()),
            ]
        );

        // sample blocks: recorded in order with non-decreasing master time
        let blocks = read_json_lines(&collection.root.join("rec/data/data.jsonl"));
        assert!(blocks.len() > 20, "only {} blocks recorded", blocks.len());
        let master: Vec<i64> = blocks.iter().map(|b| b["master_us"].as_i64().unwrap()).collect();
        assert!(master.windows(2).all(|w| w[0] <= w[1]));
        assert!(blocks.iter().all(|b| b["indices"].as_array().unwrap().len() == 10));

        // frames: contiguous indices, monotonic master time
        let frames = read_json_lines(&collection.root.join("cam_rec/frames/frames.jsonl"));
        assert!(frames.len() > 50, "only {} frames recorded", frames.len());
        for (expected, frame) in frames.iter().enumerate() {
            assert_eq!(frame["index"].as_u64().unwrap(), expected as u64);
        }
        let master: Vec<i64> = frames.iter().map(|f| f["master_us"].as_i64().unwrap()).collect();
        assert!(master.windows(2).all(|w| w[0] <= w[1]));

        // time sync files
        let tsync = TimeSyncFileReader::open(collection.root.join("daq/samples/samples.tsync")).unwrap();
        assert_eq!(tsync.header.module_name, "daq");
        assert_eq!(tsync.header.collection_id, collection.id);
        assert_eq!(tsync.header.time_dtypes[0], TimeSyncDataType::UInt64);
        assert!(!tsync.pairs.is_empty());

        let tsync = TimeSyncFileReader::open(collection.root.join("cam/frames/frames.tsync")).unwrap();
        assert_eq!(tsync.header.module_name, "cam");
        assert!(!tsync.pairs.is_empty());
        // device clock runs one second ahead of the master clock
        let (device_us, master_us) = tsync.pairs[0];
        assert!(device_us - master_us > 900_000);

        // event stream
        let mut stats = RunStatsAggregator::new();
        let mut started = false;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    if matches!(event, EngineEvent::RunStarted { .. }) {
                        started = true;
                    }
                    stats.update(&event);
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert!(started);
        let summary = stats.summary();
        assert_eq!(summary.success, Some(true));
        assert!(summary.module_errors.is_empty());
        assert!(summary.sync.iter().any(|(id, _)| id == "daq/samples"));
    }

    #[tokio::test]
    async fn test_unwritable_tsync_file_does_not_fail_run() {
        let tmp = tempfile::tempdir().unwrap();
        let blueprint = load_blueprint(tmp.path());
        let context = EngineContext::default()
            .with_tuning(Arc::new(RecordingTuning::new()))
            .with_seed(7)
            .with_storage(Arc::new(BlockedTsyncStorage(DirectoryStorage::new(tmp.path()))));
        let mut engine = install(context, &blueprint);

        stop_after(&engine, Duration::from_millis(800));
        let report = engine.run().await.unwrap();
        assert!(report.success, "{:?}", report.failure_reason);
        assert!(report.errors.is_empty());

        let root = report.collection.unwrap().root;
        assert!(root.join("daq/samples/samples.tsync").is_dir());
        let blocks = read_json_lines(&root.join("rec/data/data.jsonl"));
        assert!(!blocks.is_empty());
        // the other synchronizer still writes its file
        assert!(TimeSyncFileReader::open(root.join("cam/frames/frames.tsync")).is_ok());
    }

    #[tokio::test]
    async fn test_ephemeral_run_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let blueprint = load_blueprint(tmp.path());
        let mut engine = build_engine(&blueprint);

        stop_after(&engine, Duration::from_millis(300));
        let report = engine.run_ephemeral().await.unwrap();
        assert!(report.success, "{:?}", report.failure_reason);
        assert!(report.collection.is_none());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_consecutive_runs_create_separate_collections() {
        let tmp = tempfile::tempdir().unwrap();
        let blueprint = load_blueprint(tmp.path());
        let mut engine = build_engine(&blueprint);

        let mut roots = Vec::new();
        for _ in 0..2 {
            stop_after(&engine, Duration::from_millis(300));
            let report = engine.run().await.unwrap();
            assert!(report.success, "{:?}", report.failure_reason);
            roots.push(report.collection.unwrap().root);
        }
        assert_ne!(roots[0], roots[1]);
        for root in &roots {
            assert!(DirectoryStorage::load_manifest(root).unwrap().success);
            assert!(root.join("rec/data/data.jsonl").is_file());
        }
    }

    #[tokio::test]
    async fn test_run_without_export_dir_is_configuration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut blueprint = load_blueprint(tmp.path());
        blueprint.engine.export_dir = None;
        let mut engine = build_engine(&blueprint);

        let err = engine.run().await.unwrap_err();
        assert!(err.is_configuration_error());
    }
}

#[cfg(test)]
mod config_tests {
    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::ContractError;
    use engine::{Engine, EngineContext};
    use modules::{ModuleRegistry, RegistryError};

    #[test]
    fn test_toml_and_json_blueprints_agree() {
        let toml = r#"
            [[modules]]
            name = "daq"
            kind = "sample_counter"
            [modules.params]
            frequency_hz = 500.0
        "#;
        let json = r#"{
            "modules": [
                { "name": "daq", "kind": "sample_counter", "params": { "frequency_hz": 500.0 } }
            ]
        }"#;
        let from_toml = ConfigLoader::load_from_str(toml, ConfigFormat::Toml).unwrap();
        let from_json = ConfigLoader::load_from_str(json, ConfigFormat::Json).unwrap();
        assert_eq!(from_toml.modules[0].params, from_json.modules[0].params);
        assert_eq!(from_toml.engine, from_json.engine);
    }

    #[test]
    fn test_duplicate_modules_rejected_before_engine() {
        let toml = r#"
            [[modules]]
            name = "daq"
            kind = "sample_counter"

            [[modules]]
            name = "daq"
            kind = "recorder"
        "#;
        let err = ConfigLoader::load_from_str(toml, ConfigFormat::Toml).unwrap_err();
        assert!(matches!(err, ContractError::DuplicateModule { .. }));
    }

    #[test]
    fn test_unknown_port_rolls_back_install() {
        let toml = r#"
            [[modules]]
            name = "daq"
            kind = "sample_counter"

            [[modules]]
            name = "rec"
            kind = "recorder"

            [[connections]]
            source = "daq"
            output = "analog"
            target = "rec"
            input = "in"
        "#;
        let blueprint = ConfigLoader::load_from_str(toml, ConfigFormat::Toml).unwrap();
        let mut engine = Engine::new(EngineContext::default(), blueprint.engine.clone());
        let err = ModuleRegistry::with_builtins()
            .install(&mut engine, &blueprint)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Engine(_)));
        assert!(engine.module_names().is_empty());
    }
}
