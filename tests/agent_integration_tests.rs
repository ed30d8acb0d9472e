// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests running the full agent against files in a temporary
//! directory, publishing to a file sink.

use logship::harvester::HarvesterTimings;
use logship::init::agent::Agent;
use logship::init::args::AgentRun;
use logship::registrar::OffsetStore;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tower::BoxError;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn fast_timings() -> HarvesterTimings {
    HarvesterTimings {
        open_backoff: Duration::from_millis(50),
        read_timeout: Duration::from_millis(100),
        idle_poll: Duration::from_millis(10),
    }
}

fn agent_args(dir: &Path, config: PathBuf) -> AgentRun {
    AgentRun {
        config,
        offsets_path: dir.join("offsets.json"),
        tail_new_files: false,
        scan_interval: Duration::from_millis(100),
        spool_size: 4,
        idle_flush: Duration::from_millis(100),
        event_queue_size: 16,
    }
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("logship.json");
    fs::write(&path, body).unwrap();
    path
}

fn append(path: &Path, content: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
}

fn start(args: AgentRun) -> (CancellationToken, JoinHandle<Result<(), BoxError>>) {
    let cancel = CancellationToken::new();
    let agent = Agent::new(Box::new(args)).with_timings(fast_timings());
    let handle = tokio::spawn(agent.run(cancel.clone()));
    (cancel, handle)
}

async fn stop(cancel: CancellationToken, handle: JoinHandle<Result<(), BoxError>>) {
    cancel.cancel();
    let res = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    assert!(res.is_ok(), "agent failed: {:?}", res);
}

fn published(path: &Path) -> Vec<Value> {
    match fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn wait_for_published(path: &Path, count: usize) -> Vec<Value> {
    timeout(TEST_TIMEOUT, async {
        loop {
            let events = published(path);
            if events.len() >= count {
                return events;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap()
}

fn messages(events: &[Value]) -> Vec<&str> {
    events
        .iter()
        .map(|e| e["message"].as_str().unwrap())
        .collect()
}

#[tokio::test]
async fn test_ships_lines_and_resumes_from_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    let out = dir.path().join("out.json");
    append(&log, "first\nsecond\nthird\n");

    let config = write_config(
        dir.path(),
        &format!(
            r#"{{
                # shipped from the start on the first run
                "files": [{{
                    "paths": ["{}"],
                    "fields": {{"service": "api"}},
                    "harvest_from_beginning_on_new_file": true
                }}],
                "publisher": {{"file": {{"path": "{}"}}}}
            }}"#,
            dir.path().join("*.log").display(),
            out.display()
        ),
    );

    let (cancel, handle) = start(agent_args(dir.path(), config.clone()));
    let events = wait_for_published(&out, 3).await;
    assert_eq!(vec!["first", "second", "third"], messages(&events));
    assert_eq!("api", events[0]["service"]);
    assert_eq!(log.to_string_lossy(), events[0]["path"].as_str().unwrap());

    // Lines appended while running are picked up by the same harvester
    append(&log, "fourth\n");
    let events = wait_for_published(&out, 4).await;
    assert_eq!("fourth", events[3]["message"]);
    stop(cancel, handle).await;

    let store = OffsetStore::open(dir.path().join("offsets.json")).unwrap();
    let state = store.get(&log.to_string_lossy()).unwrap();
    assert_eq!(fs::metadata(&log).unwrap().len(), state.offset);

    // A restart only ships what was written while the agent was down
    append(&log, "fifth\n");
    let (cancel, handle) = start(agent_args(dir.path(), config));
    let events = wait_for_published(&out, 5).await;
    assert_eq!(
        vec!["first", "second", "third", "fourth", "fifth"],
        messages(&events)
    );

    sleep(Duration::from_millis(300)).await;
    stop(cancel, handle).await;
    assert_eq!(5, published(&out).len());
}

#[tokio::test]
async fn test_multiline_records_are_flushed_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("java.log");
    let out = dir.path().join("out.json");
    append(
        &log,
        "2024-01-01 ERROR boom\n  at Foo.bar\n  at Baz.qux\n2024-01-01 INFO done\n",
    );

    let config = write_config(
        dir.path(),
        &format!(
            r#"{{
                "files": [{{
                    "paths": ["{}"],
                    "harvest_from_beginning_on_new_file": true,
                    "multiline": {{"pattern": "^\\d{{4}}-"}}
                }}],
                "publisher": {{"file": {{"path": "{}"}}}}
            }}"#,
            log.display(),
            out.display()
        ),
    );

    let (cancel, handle) = start(agent_args(dir.path(), config));
    let events = wait_for_published(&out, 1).await;
    assert_eq!(
        "2024-01-01 ERROR boom\n  at Foo.bar\n  at Baz.qux",
        events[0]["message"]
    );

    // The trailing record is held until cancellation flushes it
    stop(cancel, handle).await;
    let events = published(&out);
    assert_eq!(2, events.len());
    assert_eq!("2024-01-01 INFO done", events[1]["message"]);

    let store = OffsetStore::open(dir.path().join("offsets.json")).unwrap();
    let state = store.get(&log.to_string_lossy()).unwrap();
    assert_eq!(fs::metadata(&log).unwrap().len(), state.offset);
}

#[tokio::test]
async fn test_config_without_files_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), r#"{"files": []}"#);

    let (_cancel, handle) = start(agent_args(dir.path(), config));
    let res = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    assert!(res.is_err());
}

#[tokio::test]
async fn test_over_long_lines_are_dropped_whole() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("big.log");
    let out = dir.path().join("out.json");
    append(&log, &format!("short\n{}\n123456789\nok\n", "x".repeat(30)));

    let config = write_config(
        dir.path(),
        &format!(
            r#"{{
                "files": [{{
                    "paths": ["{}"],
                    "harvest_from_beginning_on_new_file": true,
                    "max_bytes": 8
                }}],
                "publisher": {{"file": {{"path": "{}"}}}}
            }}"#,
            log.display(),
            out.display()
        ),
    );

    let (cancel, handle) = start(agent_args(dir.path(), config));
    wait_for_published(&out, 2).await;
    sleep(Duration::from_millis(300)).await;
    stop(cancel, handle).await;

    let events = published(&out);
    assert_eq!(vec!["short", "ok"], messages(&events));

    let store = OffsetStore::open(dir.path().join("offsets.json")).unwrap();
    let state = store.get(&log.to_string_lossy()).unwrap();
    assert_eq!(fs::metadata(&log).unwrap().len(), state.offset);
}
