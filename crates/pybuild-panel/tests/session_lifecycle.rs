#![cfg(unix)]

// `/bin/sh -u setup.py ...` runs setup.py as a shell script, which lets these tests drive
// the controller without a Python toolchain.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pybuild_panel::ErrorKind;
use pybuild_panel::matcher::{ErrorRecord, ToolchainFlavor};
use pybuild_panel::project::{BuildAction, Project};
use pybuild_panel::session::{
    BuildRequest, CallbackSink, Controller, PostAction, SessionEvent, SessionSink, SessionState,
};

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().expect("events lock").clone()
    }

    fn output(&self) -> String {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                SessionEvent::Output { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    fn notes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                SessionEvent::Note { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl SessionSink for RecordingSink {
    fn emit(&self, ev: SessionEvent) {
        self.events.lock().expect("events lock").push(ev);
    }
}

fn project_with_script(script: &str) -> tempfile::TempDir {
    let tmp = tempfile::tempdir().expect("tempdir");
    fs::write(tmp.path().join("setup.py"), script).expect("write setup.py");
    tmp
}

fn sh_request(dir: &Path, args: &[&str]) -> BuildRequest {
    let mut req = BuildRequest::new(dir, "/bin/sh");
    req.environment = BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]);
    req.arguments = args.iter().map(|s| s.to_string()).collect();
    req
}

fn controller() -> (Controller, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    (Controller::new(sink.clone()), sink)
}

#[test]
fn successful_build_reports_no_records() {
    let tmp = project_with_script("echo \"args: $*\"\nexit 0\n");
    let (controller, sink) = controller();

    let session = controller
        .execute(sh_request(tmp.path(), &["build_ext", "-i"]))
        .expect("execute");
    assert_eq!(session.command(), "/bin/sh -u setup.py build_ext -i");
    let outcome = session.wait().expect("outcome");

    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.succeeded());
    assert!(!outcome.terminated);
    assert!(outcome.records.is_empty());
    assert_eq!(outcome.output, "args: build_ext -i\n");
    assert_eq!(sink.output(), outcome.output);
    assert_eq!(
        sink.notes(),
        vec!["\n\n======== SUCCESS: build_ext -i ========\n".to_string()]
    );
}

#[test]
fn failed_build_harvests_compiler_error() {
    let tmp = project_with_script("echo 'foo.c:10:5: error: bar' >&2\nexit 2\n");
    let (controller, sink) = controller();

    let outcome = controller
        .execute(sh_request(tmp.path(), &["build_ext", "-i"]))
        .expect("execute")
        .wait()
        .expect("outcome");

    assert_eq!(outcome.exit_code, 2);
    assert!(!outcome.should_show_log());
    assert_eq!(
        outcome.records,
        vec![ErrorRecord {
            file: "foo.c".into(),
            line: 10,
            column: 5,
            message: "error: bar".into(),
            flavor: ToolchainFlavor::GccClangCython,
        }]
    );
    assert_eq!(
        sink.notes().last().map(String::as_str),
        Some("\n\n======== FAILED: build_ext -i ========\n")
    );
}

#[test]
fn failure_without_recognised_errors_asks_for_the_log() {
    let tmp = project_with_script("echo 'something went wrong'\nexit 1\n");
    let (controller, _sink) = controller();

    let outcome = controller
        .execute(sh_request(tmp.path(), &["build_ext", "-i"]))
        .expect("execute")
        .wait()
        .expect("outcome");
    assert_eq!(outcome.exit_code, 1);
    assert!(outcome.should_show_log());
}

#[test]
fn events_arrive_in_lifecycle_order() {
    let tmp = project_with_script("echo one\necho two >&2\necho three\nexit 3\n");
    let (controller, sink) = controller();

    let session = controller
        .execute(sh_request(tmp.path(), &["build_ext", "-i"]))
        .expect("execute");
    let id = session.id();
    session.wait().expect("outcome");

    let events = sink.events();
    assert!(events.iter().all(|ev| ev.session() == id));
    assert!(matches!(events.first(), Some(SessionEvent::Started { .. })));
    assert!(matches!(events.last(), Some(SessionEvent::Completed { .. })));

    let kinds: Vec<u8> = events
        .iter()
        .map(|ev| match ev {
            SessionEvent::Started { .. } => 0,
            SessionEvent::Output { .. } => 1,
            SessionEvent::Note { .. } => 2,
            SessionEvent::Completed { .. } => 3,
            SessionEvent::StartFailed { .. } => 4,
        })
        .collect();
    let mut sorted = kinds.clone();
    sorted.sort();
    assert_eq!(kinds, sorted, "events out of order: {kinds:?}");
    assert_eq!(kinds.iter().filter(|k| **k == 1).count(), 3);
    assert!(!kinds.contains(&4));
}

#[test]
fn child_sees_exactly_the_supplied_environment() {
    let tmp = project_with_script("echo \"FOO=$FOO HOME=${HOME:-unset}\"\n");
    let (controller, _sink) = controller();

    let mut req = sh_request(tmp.path(), &[]);
    req.environment.insert("FOO".into(), "bar".into());
    let outcome = controller
        .execute(req)
        .expect("execute")
        .wait()
        .expect("outcome");
    assert_eq!(outcome.output, "FOO=bar HOME=unset\n");
}

#[test]
fn terminate_kills_the_build_and_parses_partial_output() {
    let tmp = project_with_script(
        "echo 'foo.c:1:2: error: half done'\necho started\nsleep 30\necho never\n",
    );
    let (controller, sink) = controller();

    let session = controller
        .execute(sh_request(tmp.path(), &["build_ext", "-i"]))
        .expect("execute");

    let deadline = Instant::now() + Duration::from_secs(10);
    while !sink.output().contains("started") {
        assert!(Instant::now() < deadline, "build never produced output");
        std::thread::sleep(Duration::from_millis(20));
    }

    session.terminate();
    session.terminate();
    assert!(matches!(
        session.state(),
        SessionState::Terminating | SessionState::Finished { .. }
    ));

    let started = Instant::now();
    let outcome = session.wait().expect("outcome");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(outcome.terminated);
    assert_eq!(outcome.exit_code, 128 + libc::SIGKILL);
    assert!(!outcome.output.contains("never"));
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].message, "error: half done");
}

#[test]
fn background_child_holding_the_pipes_does_not_delay_completion() {
    let tmp = project_with_script("sleep 8 &\necho done\nexit 0\n");
    let (controller, sink) = controller();

    let started = Instant::now();
    let outcome = controller
        .execute(sh_request(tmp.path(), &["build_ext", "-i"]))
        .expect("execute")
        .wait()
        .expect("outcome");

    assert!(
        started.elapsed() < Duration::from_secs(4),
        "completion waited for the background process: {:?}",
        started.elapsed()
    );
    assert_eq!(outcome.exit_code, 0);
    assert!(!outcome.terminated);
    assert_eq!(outcome.output, "done\n");
    assert!(matches!(
        sink.events().last(),
        Some(SessionEvent::Completed { .. })
    ));
}

#[test]
fn multibyte_output_survives_the_chunk_cap() {
    let payload = format!("{}é\nfoo.c:2:1: error: naïve\n", "a".repeat(16 * 1024 - 1));
    let tmp = project_with_script("cat payload.txt\nexit 1\n");
    fs::write(tmp.path().join("payload.txt"), &payload).expect("write payload");
    let (controller, _sink) = controller();

    let outcome = controller
        .execute(sh_request(tmp.path(), &["build_ext", "-i"]))
        .expect("execute")
        .wait()
        .expect("outcome");
    assert_eq!(outcome.output, payload);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].message, "error: naïve");
}

#[test]
fn terminate_after_exit_is_a_no_op() {
    let tmp = project_with_script("exit 0\n");
    let (controller, _sink) = controller();
    let session = controller
        .execute(sh_request(tmp.path(), &[]))
        .expect("execute");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !session.is_finished() {
        assert!(Instant::now() < deadline, "build never finished");
        std::thread::sleep(Duration::from_millis(10));
    }
    session.terminate();
    assert_eq!(session.state(), SessionState::Finished { exit_code: 0 });
    assert!(session.state().is_terminal());
    let outcome = session.wait().expect("outcome");
    assert!(!outcome.terminated);
}

#[test]
fn missing_interpreter_reports_start_failure_only() {
    let tmp = project_with_script("exit 0\n");
    let (controller, sink) = controller();

    let mut req = sh_request(tmp.path(), &["build_ext", "-i"]);
    req.interpreter = tmp.path().join("no-such-python");
    let session = controller.execute(req).expect("execute");
    assert_eq!(session.state(), SessionState::StartFailed);
    session.terminate();

    let err = match session.wait() {
        Ok(_) => panic!("expected start failure"),
        Err(e) => e,
    };
    assert_eq!(err.kind(), ErrorKind::StartFailure);

    let events = sink.events();
    assert_eq!(events.len(), 1, "unexpected events: {events:?}");
    assert!(matches!(events[0], SessionEvent::StartFailed { .. }));
}

#[test]
fn missing_project_directory_is_rejected_before_spawn() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (controller, sink) = controller();
    let res = controller.execute(sh_request(&tmp.path().join("gone"), &[]));
    match res {
        Ok(_) => panic!("expected configuration error"),
        Err(e) => assert!(e.is_config()),
    }
    assert!(sink.events().is_empty());
}

#[test]
fn clean_runs_the_sweep_before_the_banner() {
    let tmp = project_with_script("echo cleaning\n");
    let root = tmp.path();
    fs::write(
        root.join("pybuild.toml"),
        r#"
[python]
interpreter = "/bin/sh"

[environment]
inherit = false

[environment.vars]
PATH = "/usr/bin:/bin"
"#,
    )
    .expect("write config");
    fs::write(root.join("a.o"), "").expect("a.o");
    fs::create_dir_all(root.join("pkg")).expect("pkg");
    fs::write(root.join("pkg/b.so"), "").expect("b.so");
    fs::write(root.join("pkg/c.cpp"), "/* Generated by Cython 3.0 */\n").expect("c.cpp");
    fs::write(root.join("pkg/d.cpp"), "// hand written\n").expect("d.cpp");

    let project = Project::open(root).expect("project");
    let request = project.request(&BuildAction::CleanAll).expect("request");
    assert_eq!(request.arguments, vec!["clean", "-a"]);
    assert_eq!(request.post_action, PostAction::CleanupScan);

    let (controller, sink) = controller();
    let outcome = controller
        .run(&project, &BuildAction::CleanAll)
        .expect("run")
        .wait()
        .expect("outcome");
    assert!(outcome.succeeded());
    assert_eq!(outcome.output, "cleaning\n");

    assert_eq!(
        sink.notes(),
        vec![
            "Removing a.o\n".to_string(),
            "Removing pkg/b.so\n".to_string(),
            "Removing pkg/c.cpp\n".to_string(),
            "\n\n======== SUCCESS: clean -a ========\n".to_string(),
        ]
    );
    assert!(!root.join("a.o").exists());
    assert!(!root.join("pkg/b.so").exists());
    assert!(!root.join("pkg/c.cpp").exists());
    assert!(root.join("pkg/d.cpp").exists());
    assert!(root.join("setup.py").exists());
}

#[test]
fn callback_sink_sees_output_then_completion() {
    let tmp = project_with_script("echo 'foo.c:3:1: warning: unused'\nexit 0\n");
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));

    let on_output = {
        let seen = Arc::clone(&seen);
        move |text: &str| seen.lock().expect("seen").push(format!("out {text}"))
    };
    let on_complete = {
        let seen = Arc::clone(&seen);
        move |o: &pybuild_panel::session::BuildOutcome| {
            seen.lock()
                .expect("seen")
                .push(format!("done {} {}", o.exit_code, o.records.len()))
        }
    };
    let on_failed = {
        let seen = Arc::clone(&seen);
        move |e: &str| seen.lock().expect("seen").push(format!("failed {e}"))
    };
    let on_note = {
        let seen = Arc::clone(&seen);
        move |text: &str| seen.lock().expect("seen").push(format!("note {}", text.trim()))
    };
    let sink = CallbackSink::new(on_output, on_complete, on_failed).with_notes(on_note);
    let controller = Controller::new(Arc::new(sink));

    controller
        .execute(sh_request(tmp.path(), &["build_ext", "-i"]))
        .expect("execute")
        .wait()
        .expect("outcome");

    assert_eq!(
        *seen.lock().expect("seen"),
        vec![
            "out foo.c:3:1: warning: unused\n".to_string(),
            "note ======== SUCCESS: build_ext -i ========".to_string(),
            "done 0 1".to_string(),
        ]
    );
}
