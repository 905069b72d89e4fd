//! Drives real echo-backend processes through the orchestrator.

use futures::StreamExt;
use infergate_orchestrator::{
    BackendKey, BackendMonitor, BackendState, BackendRegistry, InferenceService, LaunchRecipe, LoadOptions,
    LocalProcessSpawner, ModelCatalog, ModelDir, OrchestratorConfig, OrchestratorError,
    PredictRequest, RegistrySettings, ResourceSampler, StaticBackendConfigs, SysinfoSampler,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const ECHO: &str = env!("CARGO_BIN_EXE_echo-backend");

fn models_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("tiny.gguf"), b"GGUF fake weights").unwrap();
    // No known extension or magic, so only `default_backend` can place it.
    std::fs::write(dir.path().join("plain.echo"), b"echo weights").unwrap();
    dir
}

fn config(models: &Path, env: &[(&str, &str)]) -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        models_path: models.to_path_buf(),
        load_timeout: Duration::from_secs(20),
        stop_grace: Duration::from_secs(2),
        ..Default::default()
    };
    config.backends.insert(
        "echo".to_string(),
        LaunchRecipe {
            executable: PathBuf::from(ECHO),
            args: Vec::new(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        },
    );
    config.default_backend = Some("echo".to_string());
    config
}

fn registry(config: OrchestratorConfig) -> BackendRegistry {
    let settings = RegistrySettings::from(&config);
    BackendRegistry::new(Arc::new(LocalProcessSpawner::new(Arc::new(config))), settings)
}

fn echo_options(model: &str) -> LoadOptions {
    LoadOptions::new(model).with_backend("echo")
}

#[tokio::test]
async fn spawned_backend_serves_and_is_torn_down_on_unload() {
    let models = models_dir();
    let registry = registry(config(models.path(), &[]));
    let key = BackendKey::new("tiny.gguf").unwrap();

    let lease = registry.load(&key, echo_options("tiny.gguf")).await.unwrap();
    let pid = registry.pid_of(&key).unwrap();
    assert_eq!(lease.handle().pid(), Some(pid));
    assert_eq!(lease.handle().kind(), "echo");

    let reply = lease.predict(&PredictRequest::new("hello from the gateway")).await.unwrap();
    assert_eq!(reply.text(), "hello from the gateway");
    assert_eq!(reply.tokens, 4);

    let configs = StaticBackendConfigs::from_yaml_str("- name: tiny-chat\n  model: tiny.gguf\n").unwrap();
    let monitor =
        BackendMonitor::new(registry.clone(), Arc::new(SysinfoSampler)).with_configs(Arc::new(configs));
    let sample = monitor.sample(&key).await.unwrap();
    assert_eq!(sample.pid, pid);
    assert!(sample.rss_bytes > 0);

    // Model names resolve through their config; unknown names are not found.
    assert_eq!(monitor.sample_model("tiny-chat").await.unwrap().pid, pid);
    assert_eq!(monitor.sample_model("tiny.gguf").await.unwrap().pid, pid);
    assert_eq!(
        monitor.sample_model("tiny").await.unwrap_err(),
        OrchestratorError::BackendNotFound("tiny".into())
    );

    drop(lease);
    registry.unload(&key).await.unwrap();
    assert!(registry.is_empty());

    assert!(matches!(
        monitor.sample(&key).await,
        Err(OrchestratorError::BackendNotFound(_))
    ));
    assert!(matches!(
        SysinfoSampler.sample(pid).await,
        Err(OrchestratorError::ProcessUnavailable { .. })
    ));

    // A fresh process comes up on the next load.
    let again = registry.load(&key, echo_options("tiny.gguf")).await.unwrap();
    assert_ne!(again.handle().pid(), Some(pid));
    drop(again);
    registry.shutdown().await;
}

#[tokio::test]
async fn concurrent_loads_share_one_process() {
    let models = models_dir();
    let registry = registry(config(models.path(), &[("ECHO_LOAD_DELAY_MS", "300")]));
    let key = BackendKey::new("tiny.gguf").unwrap();

    let loads = (0..8).map(|_| {
        let registry = registry.clone();
        let key = key.clone();
        async move { registry.load(&key, echo_options("tiny.gguf")).await }
    });
    let leases: Vec<_> = futures::future::join_all(loads)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    let pids: std::collections::HashSet<_> = leases.iter().map(|l| l.handle().pid()).collect();
    assert_eq!(pids.len(), 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.loaded()[0].in_use, 8);

    drop(leases);
    registry.shutdown().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn streaming_and_tokenizing_through_the_catalog() {
    let models = models_dir();
    let config = config(models.path(), &[("ECHO_TOKEN_DELAY_MS", "5")]);
    let configs = StaticBackendConfigs::from_yaml_str(
        r#"
- name: tiny-chat
  backend: echo
  model: tiny.gguf
  threads: 2
"#,
    )
    .unwrap();
    let catalog = ModelCatalog::new(
        Arc::new(ModelDir::new(models.path())),
        Arc::new(configs),
    );
    let service = InferenceService::new(registry(config), catalog);

    let stream = service
        .predict_stream("tiny-chat", &PredictRequest::new("one two three four"))
        .await
        .unwrap();
    let chunks: Vec<String> = stream.map(|chunk| chunk.unwrap().text()).collect().await;
    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks.concat(), "one two three four");

    let tokens = service.tokenize("tiny-chat", "a b a").await.unwrap();
    assert_eq!(tokens.len(), 3);
    assert_eq!(tokens.tokens[0], tokens.tokens[2]);

    // Loose files fall back to the default backend kind.
    let loose = service
        .predict("plain.echo", &PredictRequest::new("loose file"))
        .await
        .unwrap();
    assert_eq!(loose.text(), "loose file");
    assert_eq!(service.registry().len(), 2);

    service.registry().shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn backend_crashing_mid_stream_is_taken_out_of_service() {
    let models = models_dir();
    let registry = registry(config(models.path(), &[("ECHO_TOKEN_DELAY_MS", "200")]));
    let key = BackendKey::new("tiny.gguf").unwrap();

    let lease = registry.load(&key, echo_options("tiny.gguf")).await.unwrap();
    let pid = lease.handle().pid().unwrap();
    let mut stream = lease
        .predict_stream(&PredictRequest::new("one two three four five six seven eight"))
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap().text(), "one ");

    let killed = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .unwrap();
    assert!(
        rest.iter().any(|item| matches!(item, Err(OrchestratorError::RpcFailure { .. }))),
        "{rest:?}"
    );
    assert_eq!(lease.handle().state(), BackendState::Failed);
    assert_eq!(registry.state(&key), None);

    drop(lease);
    let again = registry.load(&key, echo_options("tiny.gguf")).await.unwrap();
    assert_ne!(again.handle().pid(), Some(pid));
    assert_eq!(
        again.predict(&PredictRequest::new("back again")).await.unwrap().text(),
        "back again"
    );
    drop(again);
    registry.shutdown().await;
}

#[tokio::test]
async fn backend_exiting_early_fails_fast() {
    let models = models_dir();
    let registry = registry(config(models.path(), &[("ECHO_EXIT_CODE", "3")]));
    let key = BackendKey::new("tiny.gguf").unwrap();

    let started = Instant::now();
    let err = registry.load(&key, echo_options("tiny.gguf")).await.unwrap_err();
    match err {
        OrchestratorError::SpawnFailed { reason, .. } => {
            assert!(reason.contains("exited before becoming ready"), "{reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn missing_model_file_is_reported_by_the_backend() {
    let models = models_dir();
    let registry = registry(config(models.path(), &[]));
    let key = BackendKey::new("absent.gguf").unwrap();

    let err = registry.load(&key, echo_options("absent.gguf")).await.unwrap_err();
    match err {
        OrchestratorError::SpawnFailed { reason, .. } => {
            assert!(reason.contains("not found"), "{reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn attaches_to_an_externally_started_backend() {
    let models = models_dir();
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let address = format!("127.0.0.1:{port}");
    let mut external = tokio::process::Command::new(ECHO)
        .args(["--addr", &address])
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let registry = registry(config(models.path(), &[]));
    let key = BackendKey::new("tiny.gguf").unwrap();
    let lease = registry
        .load(&key, LoadOptions::new("tiny.gguf").with_grpc_address(&address))
        .await
        .unwrap();
    assert_eq!(lease.handle().pid(), None);

    let reply = lease.predict(&PredictRequest::new("attached")).await.unwrap();
    assert_eq!(reply.text(), "attached");

    drop(lease);
    registry.unload(&key).await.unwrap();
    // Attached processes are not ours to stop.
    assert!(external.try_wait().unwrap().is_none());
    external.kill().await.unwrap();
}
