mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tempfile::TempDir;

use motion_bridge_lib::broadcasting::{hub, HubHandle};
use motion_bridge_lib::error::UpstreamError;
use motion_bridge_lib::generation::{
    self, BackendReply, GenerateRequest, GenerationContext, GenerationOrchestrator, MotionBackend, MotionSession,
    Submission,
};
use motion_bridge_lib::library::{ArtifactLibrary, Folder};
use motion_bridge_lib::motion::ClipConverter;

use common::{next_message, sample_clip};

/// What the scripted server does on the next connection.
enum Script {
    Refuse(&'static str),
    Reply(BackendReply),
    /// The session panics while waiting for the reply.
    Crash(&'static str),
}

struct ScriptedBackend {
    script: Script,
    requests: Arc<Mutex<Vec<GenerateRequest>>>,
}

struct ScriptedSession {
    reply: Result<BackendReply, &'static str>,
    requests: Arc<Mutex<Vec<GenerateRequest>>>,
}

#[async_trait]
impl MotionBackend for ScriptedBackend {
    async fn connect(&self) -> Result<Box<dyn MotionSession>, UpstreamError> {
        match &self.script {
            Script::Refuse(reason) => Err(UpstreamError::Connect(reason.to_string())),
            Script::Reply(reply) => Ok(Box::new(ScriptedSession {
                reply: Ok(reply.clone()),
                requests: Arc::clone(&self.requests),
            })),
            Script::Crash(message) => Ok(Box::new(ScriptedSession {
                reply: Err(message),
                requests: Arc::clone(&self.requests),
            })),
        }
    }
}

#[async_trait]
impl MotionSession for ScriptedSession {
    async fn send(&mut self, request: &GenerateRequest) -> Result<(), UpstreamError> {
        self.requests.lock().expect("lock").push(request.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Result<BackendReply, UpstreamError> {
        match &self.reply {
            Ok(reply) => Ok(reply.clone()),
            Err(message) => panic!("{}", message),
        }
    }

    async fn close(&mut self) {}
}

struct Bridge {
    _dir: TempDir,
    hub: HubHandle,
    library: ArtifactLibrary,
    orchestrator: GenerationOrchestrator,
    requests: Arc<Mutex<Vec<GenerateRequest>>>,
}

fn bridge(script: Script) -> Bridge {
    let dir = tempfile::tempdir().expect("tempdir");
    let library = ArtifactLibrary::open(dir.path()).expect("library");

    let (hub_task, hub) = hub::channel();
    tokio::spawn(hub_task.run());

    let requests = Arc::new(Mutex::new(Vec::new()));
    let (orchestrator, jobs) = generation::channel();
    let ctx = Arc::new(GenerationContext {
        hub: hub.clone(),
        backend: Arc::new(ScriptedBackend {
            script,
            requests: Arc::clone(&requests),
        }),
        converter: Arc::new(ClipConverter::humanoid()),
        library: library.clone(),
    });
    tokio::spawn(generation::run_dispatcher(jobs, ctx));

    Bridge {
        _dir: dir,
        hub,
        library,
        orchestrator,
        requests,
    }
}

fn status(message: &Value) -> (&str, &str) {
    assert_eq!(message["type"], "status", "unexpected message {message}");
    (
        message["state"].as_str().expect("state"),
        message["message"].as_str().expect("message"),
    )
}

async fn wait_until_idle(orchestrator: &GenerationOrchestrator) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while orchestrator.is_busy() {
        assert!(Instant::now() < deadline, "slot was never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn successful_run_publishes_stages_and_persists_clip() {
    let payload = Bytes::from(sample_clip(8).to_npz().to_bytes().expect("encode"));
    let b = bridge(Script::Reply(BackendReply::Motion(payload)));
    let mut viewer = b.hub.connect();

    assert_eq!(b.orchestrator.submit("a person waves", 2.0, 12), Submission::Accepted);

    assert_eq!(status(&next_message(&mut viewer).await), ("generating", "Generating: 'a person waves'"));
    assert_eq!(status(&next_message(&mut viewer).await), ("generating", "Waiting for server response..."));
    assert_eq!(status(&next_message(&mut viewer).await), ("generating", "Converting motion data..."));

    let motion = next_message(&mut viewer).await;
    assert_eq!(motion["type"], "motion");
    assert_eq!(motion["name"], "[T2M] a person waves");
    assert_eq!(motion["clip"]["joint_pos"].as_array().expect("rows").len(), 8);
    let source = motion["source"].as_str().expect("source").to_string();
    assert!(source.starts_with("gen_"));

    assert_eq!(status(&next_message(&mut viewer).await), ("done", "Done: 'a person waves'"));
    wait_until_idle(&b.orchestrator).await;

    let generated: Vec<String> = b
        .library
        .list()
        .into_iter()
        .filter(|e| e.folder == Folder::Generated)
        .map(|e| e.name)
        .collect();
    assert_eq!(generated, vec![source.clone()]);
    let stored = b
        .library
        .load(Folder::Generated, &source, &ClipConverter::humanoid())
        .expect("stored clip loads");
    assert_eq!(stored, sample_clip(8));

    let requests = b.requests.lock().expect("lock");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].text, "a person waves");
    assert_eq!(requests[0].motion_length, 2.0);
    assert_eq!(requests[0].num_inference_steps, 12);
}

#[tokio::test]
async fn error_payload_is_reported_and_frees_the_slot() {
    let b = bridge(Script::Reply(BackendReply::from_text(r#"{"error": "CUDA out of memory"}"#)));
    let mut viewer = b.hub.connect();

    assert_eq!(b.orchestrator.submit("jump", 4.0, 10), Submission::Accepted);
    assert_eq!(status(&next_message(&mut viewer).await).1, "Generating: 'jump'");
    assert_eq!(status(&next_message(&mut viewer).await).1, "Waiting for server response...");
    assert_eq!(
        status(&next_message(&mut viewer).await),
        ("error", "Server error: CUDA out of memory")
    );

    wait_until_idle(&b.orchestrator).await;
    assert!(b.library.list().is_empty());
    assert_eq!(b.orchestrator.submit("jump again", 4.0, 10), Submission::Accepted);
}

#[tokio::test]
async fn refused_connection_is_reported() {
    let b = bridge(Script::Refuse("connection refused"));
    let mut viewer = b.hub.connect();

    assert_eq!(b.orchestrator.submit("spin", 4.0, 10), Submission::Accepted);
    assert_eq!(status(&next_message(&mut viewer).await).1, "Generating: 'spin'");
    assert_eq!(
        status(&next_message(&mut viewer).await),
        ("error", "Failed to connect to motion server: connection refused")
    );
    wait_until_idle(&b.orchestrator).await;
    assert!(b.requests.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn undecodable_payload_fails_the_run() {
    let b = bridge(Script::Reply(BackendReply::Motion(Bytes::from_static(b"garbage"))));
    let mut viewer = b.hub.connect();

    assert_eq!(b.orchestrator.submit("crawl", 4.0, 10), Submission::Accepted);
    for _ in 0..3 {
        assert_eq!(status(&next_message(&mut viewer).await).0, "generating");
    }
    let failure = next_message(&mut viewer).await;
    let (state, message) = status(&failure);
    assert_eq!(state, "error");
    assert!(message.starts_with("Generation failed: "), "message was {message}");

    wait_until_idle(&b.orchestrator).await;
    assert!(b.library.list().is_empty());
}

#[tokio::test]
async fn panicking_run_reports_failure_and_frees_the_slot() {
    let b = bridge(Script::Crash("boom"));
    let mut viewer = b.hub.connect();

    assert_eq!(b.orchestrator.submit("cartwheel", 4.0, 10), Submission::Accepted);
    assert_eq!(status(&next_message(&mut viewer).await).1, "Generating: 'cartwheel'");
    assert_eq!(status(&next_message(&mut viewer).await).1, "Waiting for server response...");

    let failure = next_message(&mut viewer).await;
    let (state, message) = status(&failure);
    assert_eq!(state, "error");
    assert!(message.starts_with("Generation failed: "), "message was {message}");
    assert!(message.contains("boom"), "message was {message}");

    wait_until_idle(&b.orchestrator).await;
    assert!(b.library.list().is_empty());
    assert_eq!(b.orchestrator.submit("cartwheel again", 4.0, 10), Submission::Accepted);
}
