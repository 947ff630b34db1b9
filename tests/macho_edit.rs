mod common;

use std::collections::BTreeSet;

use common::DylibBuilder;
use delocate::arch::Arch;
use delocate::macho::MachFile;
use delocate::macho::edit::{MachEdits, apply_edits};
use delocate::macho::universal::make_universal;
use delocate::system_tools::SystemTools;

#[test]
fn reads_id_dependencies_and_rpaths() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("libfoo.1.dylib");
    DylibBuilder::x86_64()
        .id("/opt/x/libfoo.1.dylib")
        .dep("/usr/lib/libSystem.B.dylib")
        .dep("/opt/x/libbar.dylib")
        .rpath("/opt/x")
        .write(&lib);

    let mach = MachFile::open(&lib).unwrap().unwrap();
    assert_eq!(mach.install_id.as_deref(), Some("/opt/x/libfoo.1.dylib"));
    assert_eq!(
        mach.dependencies,
        vec![
            "/usr/lib/libSystem.B.dylib".to_string(),
            "/opt/x/libbar.dylib".to_string()
        ]
    );
    assert_eq!(mach.rpaths, vec!["/opt/x".to_string()]);
    assert_eq!(
        mach.architectures,
        [Arch::X86_64].into_iter().collect::<BTreeSet<_>>()
    );
    assert!(!mach.is_signed());
}

#[test]
fn bundles_have_no_install_id() {
    let dir = tempfile::tempdir().unwrap();
    let ext = dir.path().join("ext.so");
    DylibBuilder::arm64()
        .bundle()
        .dep("/opt/x/libfoo.dylib")
        .write(&ext);

    let mach = MachFile::open(&ext).unwrap().unwrap();
    assert_eq!(mach.install_id, None);
    assert_eq!(
        mach.architectures,
        [Arch::Arm64].into_iter().collect::<BTreeSet<_>>()
    );
}

#[test]
fn rewrites_id_dependency_and_rpaths_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("libfoo.1.dylib");
    DylibBuilder::x86_64()
        .id("/opt/x/libfoo.1.dylib")
        .dep("/opt/x/libbar.dylib")
        .rpath("/opt/x")
        .write(&lib);

    let edits = MachEdits {
        set_id: Some("@loader_path/libfoo.1.dylib".to_string()),
        // longer than the original, forcing a load command rebuild
        change_deps: vec![(
            "/opt/x/libbar.dylib".to_string(),
            "@loader_path/.dylibs/some-much-longer-name/libbar.dylib".to_string(),
        )],
        add_rpaths: vec!["@loader_path/.dylibs".to_string()],
        delete_rpaths: vec!["/opt/x".to_string()],
    };
    apply_edits(&lib, &edits, &SystemTools::new()).unwrap();

    let mach = MachFile::open(&lib).unwrap().unwrap();
    assert_eq!(
        mach.install_id.as_deref(),
        Some("@loader_path/libfoo.1.dylib")
    );
    assert_eq!(
        mach.dependencies,
        vec!["@loader_path/.dylibs/some-much-longer-name/libbar.dylib".to_string()]
    );
    assert_eq!(mach.rpaths, vec!["@loader_path/.dylibs".to_string()]);
}

#[test]
fn edits_keep_the_file_size_stable() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("libfoo.dylib");
    DylibBuilder::x86_64()
        .id("/opt/x/libfoo.dylib")
        .dep("/opt/x/libbar.dylib")
        .write(&lib);
    let before = std::fs::metadata(&lib).unwrap().len();

    let edits = MachEdits {
        set_id: Some("@loader_path/libfoo.dylib".to_string()),
        ..MachEdits::default()
    };
    apply_edits(&lib, &edits, &SystemTools::new()).unwrap();

    assert_eq!(std::fs::metadata(&lib).unwrap().len(), before);
}

#[test]
fn a_change_that_outgrows_the_pad_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("libtight.dylib");
    DylibBuilder::x86_64()
        .id("/opt/x/libtight.dylib")
        .pad(0)
        .write(&lib);
    let before = std::fs::read(&lib).unwrap();

    let edits = MachEdits {
        set_id: Some(format!("@loader_path/{}.dylib", "x".repeat(200))),
        ..MachEdits::default()
    };
    // no pad to grow into, and no install_name_tool fallback off macOS
    if which::which("install_name_tool").is_err() {
        assert!(apply_edits(&lib, &edits, &SystemTools::new()).is_err());
        // the failed edit must leave the file untouched
        assert_eq!(std::fs::read(&lib).unwrap(), before);
    }
}

#[test]
fn universal_files_carry_the_union_of_slices() {
    let dir = tempfile::tempdir().unwrap();
    let intel = dir.path().join("libfoo-x86_64.dylib");
    let arm = dir.path().join("libfoo-arm64.dylib");
    DylibBuilder::x86_64()
        .id("/opt/x/libfoo.dylib")
        .dep("/opt/x/libbar.dylib")
        .write(&intel);
    DylibBuilder::arm64()
        .id("/opt/x/libfoo.dylib")
        .dep("/opt/x/libbar.dylib")
        .write(&arm);

    let fat = dir.path().join("libfoo.dylib");
    let archs = make_universal(&fat, &[intel.as_path(), arm.as_path()]).unwrap();
    let expected: BTreeSet<Arch> = [Arch::X86_64, Arch::Arm64].into_iter().collect();
    assert_eq!(archs, expected);

    let mach = MachFile::open(&fat).unwrap().unwrap();
    assert_eq!(mach.architectures, expected);
    assert_eq!(mach.install_id.as_deref(), Some("/opt/x/libfoo.dylib"));

    // assembly is normalized, so the opposite order gives identical bytes
    let fat_rev = dir.path().join("libfoo-rev.dylib");
    make_universal(&fat_rev, &[arm.as_path(), intel.as_path()]).unwrap();
    assert_eq!(
        std::fs::read(&fat).unwrap(),
        std::fs::read(&fat_rev).unwrap()
    );
}

#[test]
fn duplicate_slices_cannot_be_fused() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.dylib");
    let b = dir.path().join("b.dylib");
    DylibBuilder::x86_64().id("/opt/a.dylib").write(&a);
    DylibBuilder::x86_64().id("/opt/b.dylib").write(&b);

    let out = dir.path().join("fat.dylib");
    assert!(make_universal(&out, &[a.as_path(), b.as_path()]).is_err());
}

#[test]
fn edits_apply_to_every_slice_of_a_fat_file() {
    let dir = tempfile::tempdir().unwrap();
    let intel = dir.path().join("thin-x86_64.dylib");
    let arm = dir.path().join("thin-arm64.dylib");
    DylibBuilder::x86_64()
        .id("/opt/x/libfoo.dylib")
        .dep("/opt/x/libbar.dylib")
        .write(&intel);
    DylibBuilder::arm64()
        .id("/opt/x/libfoo.dylib")
        .dep("/opt/x/libbar.dylib")
        .write(&arm);
    let fat = dir.path().join("libfoo.dylib");
    make_universal(&fat, &[intel.as_path(), arm.as_path()]).unwrap();

    let edits = MachEdits {
        change_deps: vec![(
            "/opt/x/libbar.dylib".to_string(),
            "@loader_path/libbar.dylib".to_string(),
        )],
        ..MachEdits::default()
    };
    apply_edits(&fat, &edits, &SystemTools::new()).unwrap();

    // check both slices, not just the first
    let data = std::fs::read(&fat).unwrap();
    let goblin::mach::Mach::Fat(multi) = goblin::mach::Mach::parse(&data).unwrap() else {
        panic!("expected a fat file");
    };
    let arches: Vec<_> = multi.iter_arches().map(Result::unwrap).collect();
    assert_eq!(arches.len(), 2);
    for arch in arches {
        let slice = &data[arch.offset as usize..(arch.offset + arch.size) as usize];
        let macho = goblin::mach::MachO::parse(slice, 0).unwrap();
        assert!(
            macho
                .libs
                .iter()
                .any(|lib| *lib == "@loader_path/libbar.dylib"),
            "slice is missing the rewritten dependency"
        );
    }
}
