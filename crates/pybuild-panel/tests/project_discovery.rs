use std::fs;
use std::path::PathBuf;

use pybuild_panel::project::{BuildAction, Project};
use pybuild_panel::session::PostAction;

fn write(path: PathBuf, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, body).expect("write");
}

#[test]
fn discovers_project_from_a_nested_source_directory() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().canonicalize().expect("canonical root");
    write(root.join("setup.py"), "");
    write(root.join("pkg/sub/mod.pyx"), "");

    let project = Project::discover(&root.join("pkg/sub")).expect("discover");
    assert_eq!(project.dir, root);
    assert_eq!(project.build_descriptor(), root.join("setup.py"));
}

#[test]
fn layered_config_drives_the_build_request() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    write(root.join("setup.py"), "");
    write(
        root.join("shared/base.toml"),
        r#"
[python]
interpreter = "/opt/py/bin/python3"

[environment]
inherit = false

[environment.vars]
CFLAGS = "-O2"
CC = "gcc"
"#,
    );
    write(
        root.join("pybuild.toml"),
        r#"
extends = "shared/base.toml"

[environment.vars]
CFLAGS = "-O0"

[commands]
build = ["build_ext", "--inplace", "--force"]

[cleanup]
enabled = false
"#,
    );
    write(root.join(".env"), "CC=clang\nFROM_DOTENV=1\n");

    let project = Project::open(root).expect("open");
    let req = project.request(&BuildAction::BuildInPlace).expect("request");
    assert_eq!(req.interpreter, PathBuf::from("/opt/py/bin/python3"));
    assert_eq!(req.arguments, vec!["build_ext", "--inplace", "--force"]);
    assert_eq!(req.environment.get("CFLAGS").map(String::as_str), Some("-O0"));
    // Config vars win over the dotenv file.
    assert_eq!(req.environment.get("CC").map(String::as_str), Some("gcc"));
    assert_eq!(req.environment.get("FROM_DOTENV").map(String::as_str), Some("1"));
    assert!(!req.environment.contains_key("PATH"));

    let clean = project.request(&BuildAction::CleanAll).expect("clean request");
    assert_eq!(clean.arguments, vec!["clean", "-a"]);
    assert_eq!(clean.post_action, PostAction::None);
}

#[test]
fn malformed_config_is_a_configuration_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    write(tmp.path().join("setup.py"), "");
    write(tmp.path().join("pybuild.toml"), "[python\ninterpreter = 3\n");

    let err = Project::open(tmp.path()).expect_err("bad toml");
    assert!(err.is_config(), "unexpected error: {err}");
}
