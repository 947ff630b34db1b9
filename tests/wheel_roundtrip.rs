mod common;

use std::io::{Read, Write};

use common::{DylibBuilder, WheelBuilder};
use delocate::arch::{ArchCheckError, parse_arch_spec};
use delocate::system_tools::SystemTools;
use delocate::wheel::{WheelError, WheelOptions, delocate_wheel, unpack_wheel};

const EPOCH: u64 = 1_700_000_000;

fn zip_names(path: &std::path::Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

#[test]
fn delocating_a_wheel_vendors_its_external_libraries() {
    let base = tempfile::tempdir().unwrap();
    let external = base.path().join("opt").join("x");
    DylibBuilder::x86_64()
        .id(&format!("{}/libfoo.1.dylib", external.display()))
        .dep("/usr/lib/libSystem.B.dylib")
        .write(&external.join("libfoo.1.dylib"));

    let ext = DylibBuilder::x86_64()
        .bundle()
        .dep(&format!("{}/libfoo.1.dylib", external.display()))
        .build();
    let wheel = WheelBuilder::new("mypkg", "1.0", "cp311-cp311-macosx_10_9_x86_64")
        .file("mypkg/__init__.py", b"")
        .file("mypkg/ext.so", &ext)
        .top_level("mypkg")
        .write(base.path());

    let fixed = base.path().join("fixed.whl");
    let opts = WheelOptions {
        source_date_epoch: Some(EPOCH),
        ..WheelOptions::default()
    };
    delocate_wheel(&wheel, &fixed, &opts, &SystemTools::new()).unwrap();

    let names = zip_names(&fixed);
    assert!(
        names.contains(&"mypkg/.dylibs/libfoo.1.dylib".to_string()),
        "archive contains {names:?}"
    );

    // unpacking verifies RECORD hashes and sizes for every row
    let staging = unpack_wheel(&fixed).unwrap();
    let mach = delocate::macho::MachFile::open(&staging.root.join("mypkg/ext.so"))
        .unwrap()
        .unwrap();
    assert!(
        mach.dependencies
            .contains(&"@loader_path/.dylibs/libfoo.1.dylib".to_string())
    );
}

#[test]
fn delocation_is_idempotent_under_a_fixed_epoch() {
    let base = tempfile::tempdir().unwrap();
    let external = base.path().join("opt").join("x");
    DylibBuilder::x86_64()
        .id(&format!("{}/libfoo.dylib", external.display()))
        .write(&external.join("libfoo.dylib"));

    let ext = DylibBuilder::x86_64()
        .bundle()
        .dep(&format!("{}/libfoo.dylib", external.display()))
        .build();
    let wheel = WheelBuilder::new("mypkg", "1.0", "cp311-cp311-macosx_10_9_x86_64")
        .file("mypkg/__init__.py", b"")
        .file("mypkg/ext.so", &ext)
        .write(base.path());

    let opts = WheelOptions {
        source_date_epoch: Some(EPOCH),
        ..WheelOptions::default()
    };
    let once = base.path().join("once.whl");
    delocate_wheel(&wheel, &once, &opts, &SystemTools::new()).unwrap();
    let twice = base.path().join("twice.whl");
    delocate_wheel(&once, &twice, &opts, &SystemTools::new()).unwrap();

    assert_eq!(
        std::fs::read(&once).unwrap(),
        std::fs::read(&twice).unwrap(),
        "a delocated wheel must come back byte-identical"
    );
}

#[test]
fn a_wheel_without_external_dependencies_keeps_its_contents() {
    let base = tempfile::tempdir().unwrap();
    let wheel = WheelBuilder::new("purepkg", "2.0", "py3-none-any")
        .file("purepkg/__init__.py", b"VERSION = '2.0'\n")
        .write(base.path());

    let out = base.path().join("out.whl");
    let opts = WheelOptions {
        source_date_epoch: Some(EPOCH),
        ..WheelOptions::default()
    };
    delocate_wheel(&wheel, &out, &opts, &SystemTools::new()).unwrap();

    let names = zip_names(&out);
    assert!(!names.iter().any(|n| n.contains(".dylibs")));
    let staging = unpack_wheel(&out).unwrap();
    assert_eq!(
        std::fs::read(staging.root.join("purepkg/__init__.py")).unwrap(),
        b"VERSION = '2.0'\n"
    );
}

#[test]
fn overwriting_the_input_in_place_goes_through_a_rename() {
    let base = tempfile::tempdir().unwrap();
    let wheel = WheelBuilder::new("purepkg", "2.0", "py3-none-any")
        .file("purepkg/__init__.py", b"")
        .write(base.path());

    let opts = WheelOptions {
        source_date_epoch: Some(EPOCH),
        ..WheelOptions::default()
    };
    delocate_wheel(&wheel, &wheel, &opts, &SystemTools::new()).unwrap();
    // still a readable, verifiable wheel
    unpack_wheel(&wheel).unwrap();
}

#[test]
fn tampered_contents_are_rejected_as_corrupt() {
    let base = tempfile::tempdir().unwrap();
    let wheel = WheelBuilder::new("purepkg", "2.0", "py3-none-any")
        .file("purepkg/__init__.py", b"x = 1\n")
        .write(base.path());

    // rebuild the archive with one member altered and RECORD left stale
    let mut members: Vec<(String, Vec<u8>)> = Vec::new();
    {
        let file = std::fs::File::open(&wheel).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).unwrap();
            members.push((entry.name().to_string(), contents));
        }
    }
    let file = std::fs::File::create(&wheel).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in &members {
        zip.start_file(name.clone(), options).unwrap();
        if name == "purepkg/__init__.py" {
            zip.write_all(b"x = 2\n").unwrap();
        } else {
            zip.write_all(contents).unwrap();
        }
    }
    zip.finish().unwrap();

    let err = unpack_wheel(&wheel).unwrap_err();
    assert!(matches!(err, WheelError::Corrupt { .. }), "got {err}");
}

#[test]
fn a_wheel_without_record_is_corrupt() {
    let base = tempfile::tempdir().unwrap();
    let wheel_path = base.path().join("broken-1.0-py3-none-any.whl");
    let file = std::fs::File::create(&wheel_path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    zip.start_file("broken/__init__.py", options).unwrap();
    zip.write_all(b"").unwrap();
    zip.start_file("broken-1.0.dist-info/WHEEL", options).unwrap();
    zip.write_all(b"Wheel-Version: 1.0\nTag: py3-none-any\n").unwrap();
    zip.finish().unwrap();

    let err = unpack_wheel(&wheel_path).unwrap_err();
    assert!(matches!(err, WheelError::Corrupt { .. }), "got {err}");
}

#[test]
fn missing_required_architectures_are_reported_per_file() {
    let base = tempfile::tempdir().unwrap();
    let external = base.path().join("opt").join("x");
    DylibBuilder::x86_64()
        .id(&format!("{}/libfoo.1.dylib", external.display()))
        .write(&external.join("libfoo.1.dylib"));

    let ext = DylibBuilder::x86_64()
        .bundle()
        .dep(&format!("{}/libfoo.1.dylib", external.display()))
        .build();
    let wheel = WheelBuilder::new("mypkg", "1.0", "cp311-cp311-macosx_10_9_x86_64")
        .file("mypkg/__init__.py", b"")
        .file("mypkg/ext.so", &ext)
        .write(base.path());

    let opts = WheelOptions {
        require_archs: Some(parse_arch_spec("intel").unwrap()),
        source_date_epoch: Some(EPOCH),
        ..WheelOptions::default()
    };
    let out = base.path().join("out.whl");
    let err = delocate_wheel(&wheel, &out, &opts, &SystemTools::new()).unwrap_err();

    let WheelError::Archs(ArchCheckError::Deficit { deficits }) = &err else {
        panic!("expected an architecture deficit, got {err}");
    };
    assert!(
        deficits
            .iter()
            .any(|d| d.file.ends_with("libfoo.1.dylib")
                && d.missing.iter().any(|a| a.name() == "i386")),
        "deficits were {deficits:?}"
    );
    // nothing was produced
    assert!(!out.exists());
}
