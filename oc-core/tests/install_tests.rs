mod common;

use common::*;
use objcache::{InstallError, apply_relocations, install, install_with_reset};

#[test]
fn relocating_against_two_entries_changes_only_the_move() {
    let symbols = symbols();
    let fragment = guest_move_fragment();
    let arch = HostArch::X86_64;

    let at_a = fragment
        .relocated(arch, &ResolutionContext::new(ENTRY_A, &symbols, &NoThunks))
        .expect("relocates at A");
    let at_b = fragment
        .relocated(arch, &ResolutionContext::new(ENTRY_B, &symbols, &NoThunks))
        .expect("relocates at B");

    assert_eq!(at_a.len(), 32);
    assert_eq!(at_b.len(), 32);
    let width = arch.move_width();
    assert_eq!(&at_a[..4], &at_b[..4]);
    assert_eq!(&at_a[4 + width..], &at_b[4 + width..]);
    assert_eq!(
        &at_a[4..4 + width],
        arch.padded_move_bytes(0, ENTRY_A + 0x10)
            .expect("move encodes")
            .as_slice()
    );
    assert_eq!(
        &at_b[4..4 + width],
        arch.padded_move_bytes(0, ENTRY_B + 0x10)
            .expect("move encodes")
            .as_slice()
    );
    assert_ne!(at_a, at_b);
    // the stored fragment itself is never patched
    assert_eq!(fragment.code, vec![0x90; 32]);
}

#[test]
fn installing_at_two_entries_patches_only_the_guest_move() {
    let arch = HostArch::X86_64;
    let symbols = NamedSymbolTable::from_fn(|_| 0xAAAA_0000);
    let fragment = CodeFragment::new(
        vec![0x90; 32],
        vec![
            Relocation::GuestAddressMove {
                offset: 4,
                delta: 0x10,
                register: 0,
            },
            Relocation::NamedSymbolLiteral {
                offset: 20,
                symbol: NamedSymbol::ExitFunctionLinker,
            },
        ],
    );
    let mut buffer = CodeBuffer::new(arch, 4096).expect("code buffer allocates");

    let at_a = install(
        &fragment,
        &ResolutionContext::new(ENTRY_A, &symbols, &NoThunks),
        &mut buffer,
    )
    .expect("installs at A");
    let at_b = install(
        &fragment,
        &ResolutionContext::new(ENTRY_B, &symbols, &NoThunks),
        &mut buffer,
    )
    .expect("installs at B");
    assert_eq!((at_a.offset, at_b.offset), (0, 32));

    let bytes_a = buffer.installed_bytes(&at_a).expect("A is live").to_vec();
    let bytes_b = buffer.installed_bytes(&at_b).expect("B is live").to_vec();
    let differing = (0..32)
        .filter(|&i| bytes_a[i] != bytes_b[i])
        .collect::<Vec<_>>();
    assert!(!differing.is_empty());
    assert!(differing.iter().all(|i| (4..14).contains(i)), "{differing:?}");
    for bytes in [&bytes_a, &bytes_b] {
        assert_eq!(&bytes[20..28], &0xAAAA_0000u64.to_le_bytes());
        assert_eq!(&bytes[..4], &[0x90; 4]);
        assert_eq!(&bytes[28..], &[0x90; 4]);
    }
}

#[test]
fn reinstalling_a_compiled_fragment_reproduces_its_bytes() {
    let symbols = symbols();
    let thunks = ThunkTable::new();
    thunks.register(thunk_hash(), 0x6000_1234_5678);

    for arch in HostArch::ALL {
        let compiled = compile_mixed(arch, &symbols, &thunks);
        assert_eq!(compiled.record.fragment.relocations.len(), 4);
        let ctx = ResolutionContext::new(ENTRY_A, &symbols, &thunks);
        let reinstalled = compiled
            .record
            .fragment
            .relocated(arch, &ctx)
            .expect("relocation succeeds");
        assert_eq!(reinstalled, compiled.record.fragment.code, "{arch}");
    }
}

#[test]
fn relocation_is_independent_of_emission_context() {
    let symbols = symbols();
    let thunks = ThunkTable::new();
    thunks.register(thunk_hash(), 0x6000_0000);
    let compiled = compile_mixed(HostArch::X86_64, &symbols, &thunks);

    // a second process sees different thunk and symbol addresses
    let other_symbols = NamedSymbolTable::from_fn(|symbol| 0x9100_0000 + u64::from(symbol.id()));
    let other_thunks = ThunkTable::new();
    other_thunks.register(thunk_hash(), 0x6100_0000);

    let fragment = &compiled.record.fragment;
    let mut direct = fragment.code.clone();
    let ctx = ResolutionContext::new(ENTRY_B, &other_symbols, &other_thunks);
    apply_relocations(HostArch::X86_64, &mut direct, &fragment.relocations, &ctx)
        .expect("relocations apply");
    let relocated = fragment
        .relocated(HostArch::X86_64, &ctx)
        .expect("relocations apply");
    assert_eq!(direct, relocated);
    assert_eq!(relocated.len(), fragment.code.len());

    for relocation in &fragment.relocations {
        let start = relocation.offset() as usize;
        let end = start + relocation.patch_width(HostArch::X86_64);
        let expected = ctx.resolve(relocation).expect("resolves");
        match relocation.register() {
            Some(register) => assert_eq!(
                &relocated[start..end],
                HostArch::X86_64
                    .padded_move_bytes(register, expected)
                    .expect("move encodes")
                    .as_slice()
            ),
            None => assert_eq!(&relocated[start..end], &expected.to_le_bytes()),
        }
    }
}

#[test]
fn unresolved_thunk_leaves_buffer_untouched() {
    let arch = HostArch::native().unwrap_or(HostArch::X86_64);
    let symbols = symbols();
    let registered = ThunkTable::new();
    registered.register(thunk_hash(), 0x6000_0000);
    let compiled = compile_mixed(arch, &symbols, &registered);

    let mut buffer = CodeBuffer::new(arch, 4096).expect("code buffer allocates");
    let empty = ThunkTable::new();
    let ctx = ResolutionContext::new(ENTRY_A, &symbols, &empty);
    let err = install(&compiled.record.fragment, &ctx, &mut buffer)
        .expect_err("thunk is not registered");
    assert!(
        matches!(err, InstallError::UnresolvedThunk { index: 1, hash } if hash == thunk_hash()),
        "{err:?}"
    );
    assert_eq!(buffer.used(), 0);

    empty.register(thunk_hash(), 0x6000_0000);
    let installed =
        install(&compiled.record.fragment, &ctx, &mut buffer).expect("install succeeds");
    assert_eq!(installed.offset, 0);
    assert_eq!(
        buffer.installed_bytes(&installed),
        Some(compiled.record.fragment.code.as_slice())
    );
}

#[test]
fn full_buffer_resets_exactly_once() {
    let arch = HostArch::X86_64;
    let symbols = symbols();
    let shared = shared_buffer(arch, 64);
    let fragment = guest_move_fragment();
    let ctx = ResolutionContext::new(ENTRY_A, &symbols, &NoThunks);

    let first = install_with_reset(&shared, &fragment, &ctx).expect("first fits");
    let second = install_with_reset(&shared, &fragment, &ctx).expect("second fits");
    assert_eq!((first.offset, second.offset), (0, 32));
    assert_eq!(shared.reset_count(), 0);

    let third = install_with_reset(&shared, &fragment, &ctx).expect("third fits after reset");
    assert_eq!(shared.reset_count(), 1);
    assert_eq!(third.offset, 0);
    assert_eq!(third.generation, first.generation + 1);
    assert!(!shared.is_live(&first));
    assert!(!shared.is_live(&second));
    assert!(shared.is_live(&third));
    shared.with_buffer(|buffer| {
        assert_eq!(buffer.installed_bytes(&first), None);
        assert_eq!(buffer.used(), 32);
    });
}

#[test]
fn oversized_fragment_never_resets() {
    let symbols = symbols();
    let shared = shared_buffer(HostArch::X86_64, 16);
    let ctx = ResolutionContext::new(ENTRY_A, &symbols, &NoThunks);
    let err = install_with_reset(&shared, &guest_move_fragment(), &ctx)
        .expect_err("fragment exceeds capacity");
    assert!(matches!(
        err,
        InstallError::FragmentTooLarge {
            len: 32,
            capacity: 16
        }
    ));
    assert_eq!(shared.reset_count(), 0);
}

#[test]
fn concurrent_installs_reset_once_per_generation() {
    let symbols = symbols();
    let shared = shared_buffer(HostArch::X86_64, 32 * 8);
    let fragment = guest_move_fragment();

    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let (shared, fragment, symbols) = (&shared, &fragment, &symbols);
            scope.spawn(move || {
                let ctx =
                    ResolutionContext::new(ENTRY_A + worker * 0x1000, symbols, &NoThunks);
                for _ in 0..6 {
                    install_with_reset(shared, fragment, &ctx).expect("install succeeds");
                }
            });
        }
    });

    // 24 installs of 32 bytes fill exactly three generations of 8 slots
    assert_eq!(shared.reset_count(), 2);
    assert_eq!(shared.generation(), 2);
}
