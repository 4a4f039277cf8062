use assert_cmd::Command;
use assert_fs::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

fn write_random(path: &std::path::Path, bytes: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    std::fs::write(path, data).unwrap();
}

fn object_args(root: &std::path::Path) -> Vec<String> {
    vec![
        "--root".into(), root.to_str().unwrap().into(),
        "--name".into(), "demo".into(),
        "--nbdata".into(), "4".into(),
        "--nbparity".into(), "2".into(),
        "--chunksize".into(), "4096".into(),
        "--placement".into(), "a".into(),
        "--placement".into(), "b".into(),
        "--placement".into(), "c".into(),
        "--placement".into(), "d".into(),
        "--placement".into(), "e".into(),
        "--placement".into(), "f".into(),
    ]
}

#[test]
fn write_then_read_round_trips_bytes() {
    let td = assert_fs::TempDir::new().unwrap();
    let archives = td.child("archives");
    archives.create_dir_all().unwrap();
    let input = td.child("input.bin");
    write_random(input.path(), 200 * 1024, 1);
    let output = td.child("output.bin");

    let mut write = Command::cargo_bin("parx").unwrap();
    write
        .args(object_args(archives.path()))
        .arg("write")
        .arg(input.path())
        .assert()
        .success();

    let mut read = Command::cargo_bin("parx").unwrap();
    read.args(object_args(archives.path()))
        .arg("read")
        .arg(output.path())
        .assert()
        .success();

    assert_eq!(
        std::fs::read(input.path()).unwrap(),
        std::fs::read(output.path()).unwrap()
    );
}

#[test]
fn check_reports_clean_object_and_repair_is_a_no_op() {
    let td = assert_fs::TempDir::new().unwrap();
    let archives = td.child("archives");
    archives.create_dir_all().unwrap();
    let input = td.child("input.bin");
    write_random(input.path(), 64 * 1024, 7);

    Command::cargo_bin("parx")
        .unwrap()
        .args(object_args(archives.path()))
        .arg("write")
        .arg(input.path())
        .assert()
        .success();

    Command::cargo_bin("parx")
        .unwrap()
        .args(object_args(archives.path()))
        .arg("check")
        .assert()
        .success();

    let mut repair_args = object_args(archives.path());
    repair_args.push("--replacement".into());
    repair_args.push("spare".into());
    Command::cargo_bin("parx")
        .unwrap()
        .args(repair_args)
        .arg("repair")
        .assert()
        .success();
}
