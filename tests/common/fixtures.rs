//! Report repository fixtures: a fake bulk endpoint and service helpers

use report_ingest::{ImportConfig, TaskConfig, TaskServices};
use std::path::{Path, PathBuf};
use std::time::Duration;
use wiremock::{Request, Respond, ResponseTemplate};

/// Username accepted by the fake repository
pub const USERNAME: &str = "importer";
/// Password accepted by the fake repository
pub const PASSWORD: &str = "s3cret";
/// Ontology every fake report belongs to
pub const ONTOLOGY: &str = "cardio-7";

/// Started services with a small pool
pub fn started_services() -> TaskServices {
    let services = TaskServices::new(&TaskConfig {
        max_workers: 16,
        scheduler_threads: Some(2),
        shutdown_grace: Duration::from_millis(200),
    });
    services.start();
    services
}

/// Import settings with short polling so group tests finish quickly
pub fn fast_import_config() -> ImportConfig {
    ImportConfig {
        poll_interval: Duration::from_millis(20),
        tick_timeout: Duration::from_secs(5),
        import_timeout: Duration::from_secs(10),
        ..ImportConfig::default()
    }
}

/// `count` ids of the form `<prefix>-0000`
pub fn report_ids(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}-{i:04}")).collect()
}

/// XML body the fake repository serves for `id`
pub fn report_body(id: &str) -> String {
    format!("<report id=\"{id}\"><finding>normal</finding></report>")
}

/// Answers `{"ids": [...]}` with a JSON array holding one report per id
pub struct BulkResponder;

impl Respond for BulkResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let ids = requested_ids(request);
        let reports: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "globalId": id,
                    "ontologyId": ONTOLOGY,
                    "content": report_body(id),
                })
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(reports)
    }
}

/// Ids carried by a bulk request body
pub fn requested_ids(request: &Request) -> Vec<String> {
    serde_json::from_slice::<serde_json::Value>(&request.body)
        .ok()
        .and_then(|body| body.get("ids").cloned())
        .and_then(|ids| serde_json::from_value(ids).ok())
        .unwrap_or_default()
}

/// Every regular file under `root`
pub fn stored_files(root: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}
