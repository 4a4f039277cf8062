use assert_cmd::Command;
use assert_fs::prelude::*;

fn object_args(root: &std::path::Path) -> Vec<String> {
    vec![
        "--root".into(), root.to_str().unwrap().into(),
        "--name".into(), "small".into(),
        "--nbdata".into(), "2".into(),
        "--nbparity".into(), "1".into(),
        "--chunksize".into(), "64".into(),
        "--placement".into(), "x".into(),
        "--placement".into(), "y".into(),
        "--placement".into(), "z".into(),
    ]
}

#[test]
fn write_and_read_a_small_object_by_offset_and_length() {
    let td = assert_fs::TempDir::new().unwrap();
    let archives = td.child("archives");
    archives.create_dir_all().unwrap();
    let input = td.child("file.txt");
    input.write_str("hello world, this is a small erasure-coded object").unwrap();

    Command::cargo_bin("parx")
        .unwrap()
        .args(object_args(archives.path()))
        .arg("write")
        .arg(input.path())
        .assert()
        .success();

    let output = td.child("slice.txt");
    Command::cargo_bin("parx")
        .unwrap()
        .args(object_args(archives.path()))
        .arg("read")
        .args(["--offset", "6", "--length", "5"])
        .arg(output.path())
        .assert()
        .success();

    assert_eq!(std::fs::read_to_string(output.path()).unwrap(), "world");
}
