#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pack_core::{
    FilesystemGrants, InstallMode, InstallSource, Limits, NetworkGrants, Pack, PackFileName,
    PackType, Permissions,
};
use pack_runner_host::host::{HttpClient, HttpError, HttpRequest, HttpResponse};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// Records every request and answers with a canned response.
pub struct RecordingHttp {
    pub requests: Mutex<Vec<HttpRequest>>,
    status: u16,
    body: String,
    fail: bool,
}

impl RecordingHttp {
    pub fn ok(body: Value) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            status: 200,
            body: body.to_string(),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            status: 0,
            body: String::new(),
            fail: true,
        })
    }

    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl HttpClient for RecordingHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let url = request.url.clone();
        self.requests.lock().push(request);
        if self.fail {
            // Echo the URL the way a careless backend would.
            return Err(HttpError(format!("connection refused by {url}")));
        }
        Ok(HttpResponse {
            status: self.status,
            headers: BTreeMap::new(),
            body: self.body.clone(),
        })
    }
}

pub struct PackSpec<'a> {
    pub id: &'a str,
    pub pack_type: PackType,
    pub entry: &'a str,
    pub connect: &'a [&'a str],
    pub read: &'a [&'a str],
    pub required_secrets: &'a [&'a str],
}

impl<'a> PackSpec<'a> {
    pub fn workflow(id: &'a str) -> Self {
        Self {
            id,
            pack_type: PackType::Workflow,
            entry: "workflow.json",
            connect: &[],
            read: &[],
            required_secrets: &[],
        }
    }
}

/// A committed pack record pointing at `dir`, which the caller populates.
pub fn pack_at(dir: &Path, spec: PackSpec<'_>) -> Pack {
    std::fs::create_dir_all(dir).expect("pack dir");
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    Pack {
        id: spec.id.to_string(),
        name: spec.id.to_string(),
        version: "1.0.0".into(),
        pack_type: spec.pack_type,
        entry: spec.entry.to_string(),
        install_mode: InstallMode::Dev,
        install_source: InstallSource::Dev {
            branch: "main".into(),
            artifact_url: "https://example.com/actions/artifacts/1".into(),
            fetched_at: Utc::now(),
        },
        file_name: PackFileName {
            variant: "demo".into(),
            target: "universal".into(),
            version: "1.0.0".into(),
        },
        permissions: Permissions {
            filesystem: FilesystemGrants {
                read: strings(spec.read),
                write: Vec::new(),
            },
            network: NetworkGrants {
                connect: strings(spec.connect),
                listen_localhost: false,
            },
        },
        limits: Limits {
            memory_mb: 16,
            cpu_ms_per_sec: 100,
        },
        required_secrets: strings(spec.required_secrets),
        install_path: dir.to_path_buf(),
        installed_at: Utc::now(),
    }
}

pub fn write_workflow(dir: &Path, steps: Value) {
    let doc = json!({ "workflow_version": 1, "id": "test-flow", "steps": steps });
    std::fs::write(dir.join("workflow.json"), doc.to_string()).expect("write workflow");
}
