mod common;

use common::*;
use objcache::{CacheConfig, CacheRuntime, InstallError, InstallOutcome, ObjCacheMode};

fn config(dir: &std::path::Path, mode: ObjCacheMode) -> CacheConfig {
    CacheConfig {
        mode,
        cache_dir: Some(dir.to_path_buf()),
        code_buffer_size: 4096,
        perf_map: false,
        ..CacheConfig::default()
    }
}

#[test]
fn fragment_compiled_in_one_run_installs_in_the_next() {
    let dir = tempfile::tempdir().expect("tempdir");
    let arch = HostArch::native().unwrap_or(HostArch::X86_64);
    let thunks = ThunkTable::new();
    thunks.register(thunk_hash(), 0x6000_0000);

    let compiled_code = {
        let runtime =
            CacheRuntime::from_config(config(dir.path(), ObjCacheMode::ReadWrite), arch, symbols())
                .expect("runtime starts");
        let compiled = compile_mixed(arch, runtime.symbols(), &thunks);
        let code = compiled.record.fragment.code.clone();
        let installed = runtime
            .install_fresh(compiled, &thunks)
            .expect("fresh install succeeds");
        assert!(runtime.is_live(&installed));
        assert_eq!(runtime.cache().len(), 1);
        code
    };

    // the next run maps its helpers and thunks elsewhere
    let moved_symbols = NamedSymbolTable::from_fn(|symbol| 0x8800_0000 + u64::from(symbol.id()));
    let moved_thunks = ThunkTable::new();
    moved_thunks.register(thunk_hash(), 0x6100_0000);
    let runtime =
        CacheRuntime::from_config(config(dir.path(), ObjCacheMode::Read), arch, moved_symbols)
            .expect("runtime starts");
    assert_eq!(runtime.cache().len(), 1);

    let installed = match runtime.install_cached(ENTRY_A, &moved_thunks) {
        InstallOutcome::Installed(installed) => installed,
        other => panic!("expected install, got {other:?}"),
    };
    let record = runtime.cache().lookup(ENTRY_A).expect("record cached");
    assert_eq!(record.fragment.code, compiled_code);
    let expected = record
        .fragment
        .relocated(arch, &runtime.context(ENTRY_A, &moved_thunks))
        .expect("relocates");
    runtime.code_buffer().with_buffer(|buffer| {
        assert_eq!(buffer.installed_bytes(&installed), Some(expected.as_slice()));
    });
    assert_ne!(expected, compiled_code);

    assert!(matches!(
        runtime.install_cached(ENTRY_B, &moved_thunks),
        InstallOutcome::Miss
    ));
    assert!(matches!(
        runtime.install_cached(ENTRY_A, &NoThunks),
        InstallOutcome::Uninstallable(InstallError::UnresolvedThunk { .. })
    ));
}

#[test]
fn off_mode_never_caches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let arch = HostArch::X86_64;
    let runtime = CacheRuntime::from_config(config(dir.path(), ObjCacheMode::Off), arch, symbols())
        .expect("runtime starts");
    let compiled = CompiledFragment {
        guest_entry: ENTRY_A,
        record: CacheRecord::new(
            vec![GuestRange::new(ENTRY_A, ENTRY_A + 0x20)],
            guest_move_fragment(),
        ),
    };
    runtime
        .install_fresh(compiled, &NoThunks)
        .expect("fresh install succeeds");
    assert!(runtime.cache().is_empty());
    assert!(matches!(
        runtime.install_cached(ENTRY_A, &NoThunks),
        InstallOutcome::Miss
    ));
    assert_eq!(std::fs::read_dir(dir.path()).expect("dir readable").count(), 0);
}

#[test]
fn invalidation_removes_overlapping_records() {
    let dir = tempfile::tempdir().expect("tempdir");
    let arch = HostArch::X86_64;
    let runtime =
        CacheRuntime::from_config(config(dir.path(), ObjCacheMode::ReadWrite), arch, symbols())
            .expect("runtime starts");
    for entry in [ENTRY_A, ENTRY_B] {
        let compiled = CompiledFragment {
            guest_entry: entry,
            record: CacheRecord::new(
                vec![GuestRange::new(entry, entry + 0x20)],
                guest_move_fragment(),
            ),
        };
        runtime
            .install_fresh(compiled, &NoThunks)
            .expect("fresh install succeeds");
    }
    assert_eq!(
        runtime
            .invalidate_range(ENTRY_A + 0x1F, ENTRY_A + 0x21)
            .expect("invalidation persists"),
        1
    );
    assert!(runtime.cache().lookup(ENTRY_A).is_none());
    assert!(runtime.cache().lookup(ENTRY_B).is_some());
}
