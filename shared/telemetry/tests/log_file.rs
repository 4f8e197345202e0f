use tessera_telemetry::{logging, LogOutput};
use tracing::Level;

#[test]
fn log_file_receives_events_and_appends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.log");
    std::fs::write(&path, "previous run\n").unwrap();

    let subscriber = logging()
        .with_output(LogOutput::None)
        .with_level(Level::DEBUG)
        .with_log_file(path.clone())
        .build()
        .unwrap();
    tracing::subscriber::with_default(subscriber, || {
        tracing::info!(dataset = 3, "Built sample index");
        tracing::trace!("below the configured level");
    });

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.starts_with("previous run\n"));
    assert!(contents.contains("Built sample index"));
    assert!(contents.contains("dataset=3"));
    assert!(!contents.contains("below the configured level"));
}

#[test]
fn every_output_builds() {
    for output in [LogOutput::Console, LogOutput::Json, LogOutput::None] {
        assert!(logging().with_output(output).build().is_ok(), "{output:?}");
    }
}
