use super::*;
use crate::access::AccessMode;
use crate::config::LinkerConfig;
use crate::descriptor::{Carrier, MethodType};
use crate::error::LayoutViolation;
use crate::interop::{NativeInvoker, Value};
use crate::layout::{align_up, MemoryLayout, ScalarKind, ValueLayout};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

fn int() -> MemoryLayout {
    ValueLayout::INT.into()
}

fn long() -> MemoryLayout {
    ValueLayout::LONG.into()
}

fn pad(n: u64) -> MemoryLayout {
    MemoryLayout::padding(n).unwrap()
}

fn strukt(members: Vec<MemoryLayout>) -> MemoryLayout {
    MemoryLayout::struct_layout(members).unwrap()
}

fn union(members: Vec<MemoryLayout>) -> MemoryLayout {
    MemoryLayout::union_layout(members).unwrap()
}

fn bytes(n: u64) -> MemoryLayout {
    MemoryLayout::sequence_layout(n, ValueLayout::BYTE.into()).unwrap()
}

fn check(layout: &MemoryLayout) -> Result<(), LayoutViolation> {
    LayoutValidator::new(&PlatformLinker::current()).check_layout(layout)
}

extern "C" fn add_i32(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

#[test]
fn test_padded_struct_validates() {
    let layout = strukt(vec![int(), pad(4), long()]);
    assert_eq!(layout.byte_size(), 16);
    assert_eq!(layout.byte_alignment(), 8);
    assert_eq!(check(&layout), Ok(()));
}

#[test]
fn test_missing_padding_reports_member() {
    let layout = strukt(vec![int(), long()]);
    match check(&layout) {
        Err(LayoutViolation::UnexpectedOffset {
            member,
            index,
            found,
            expected,
            ..
        }) => {
            assert_eq!(member, long().to_string());
            assert_eq!(index, 1);
            assert_eq!((found, expected), (4, 8));
        }
        other => panic!("expected offset error, got {:?}", other),
    }
}

#[test]
fn test_outermost_error_wins() {
    // The inner struct is also broken, but the outer offset is checked first
    let inner = strukt(vec![int(), long()]);
    let outer = strukt(vec![ValueLayout::SHORT.into(), inner]);
    assert!(matches!(
        check(&outer),
        Err(LayoutViolation::UnexpectedOffset { index: 1, found: 2, expected: 8, .. })
    ));
}

#[test]
fn test_trailing_padding_must_match() {
    let short_tail = strukt(vec![long(), int()]);
    assert!(matches!(
        check(&short_tail),
        Err(LayoutViolation::UnexpectedSize { found: 12, expected: 16, .. })
    ));

    let exact = strukt(vec![long(), int(), pad(4)]);
    assert_eq!(check(&exact), Ok(()));

    let excess = strukt(vec![long(), int(), pad(12)]);
    assert!(matches!(
        check(&excess),
        Err(LayoutViolation::UnexpectedSize { found: 24, expected: 16, .. })
    ));
}

#[test]
fn test_all_padding_struct_rejected() {
    let layout = strukt(vec![pad(4)]);
    assert!(matches!(check(&layout), Err(LayoutViolation::OnlyPadding { .. })));

    // The empty struct is fine
    assert_eq!(check(&strukt(vec![])), Ok(()));
}

#[test]
fn test_overaligned_struct_rejected() {
    let layout = strukt(vec![int(), int()]).with_byte_alignment(16).unwrap();
    assert!(matches!(
        check(&layout),
        Err(LayoutViolation::UnnaturalAlignment { .. })
    ));
}

#[test]
fn test_union_padding_rules() {
    let superfluous = union(vec![int(), pad(4)]);
    assert!(matches!(
        check(&superfluous),
        Err(LayoutViolation::SuperfluousPadding { .. })
    ));

    let padded = union(vec![bytes(12), long(), pad(16)]);
    assert_eq!(padded.byte_size(), 16);
    assert_eq!(check(&padded), Ok(()));

    let twice = union(vec![bytes(12), long(), pad(16), pad(16)]);
    assert!(matches!(
        check(&twice),
        Err(LayoutViolation::MultiplePadding { .. })
    ));

    let unrounded = union(vec![bytes(12), long()]);
    assert!(matches!(
        check(&unrounded),
        Err(LayoutViolation::UnexpectedSize { found: 12, expected: 16, .. })
    ));
}

#[test]
fn test_sequences() {
    let top = MemoryLayout::sequence_layout(4, int()).unwrap();
    assert!(matches!(
        check(&top),
        Err(LayoutViolation::TopLevelSequence { .. })
    ));

    let nested = strukt(vec![top]);
    assert_eq!(check(&nested), Ok(()));

    let of_padding = strukt(vec![MemoryLayout::sequence_layout(2, pad(4)).unwrap()]);
    assert!(matches!(
        check(&of_padding),
        Err(LayoutViolation::PaddingSequence { .. })
    ));
}

#[test]
fn test_scalar_membership() {
    assert_eq!(check(&ValueLayout::INT.with_name("x").into()), Ok(()));

    let pointer = ValueLayout::ADDRESS.with_target_layout(int()).unwrap();
    assert_eq!(check(&pointer.into()), Ok(()));

    let foreign_order = if cfg!(target_endian = "little") {
        crate::layout::ByteOrder::BigEndian
    } else {
        crate::layout::ByteOrder::LittleEndian
    };
    let swapped = ValueLayout::INT.with_order(foreign_order);
    assert!(matches!(
        check(&swapped.into()),
        Err(LayoutViolation::Unsupported { .. })
    ));

    let packed = ValueLayout::INT.with_byte_alignment(1).unwrap();
    assert!(matches!(
        check(&strukt(vec![packed.into()])),
        Err(LayoutViolation::Unsupported { .. })
    ));
}

#[test]
fn test_aix_accepts_power_aligned_double() {
    let double4 = ValueLayout::DOUBLE.with_byte_alignment(4).unwrap();
    let layout = strukt(vec![int(), double4.clone().into()]);
    assert_eq!(layout.byte_size(), 12);

    let aix = LayoutValidator::new(&PlatformLinker::AixPpc64);
    assert_eq!(aix.check_layout(&layout), Ok(()));

    // First member: regular rules apply
    let leading = strukt(vec![double4.into(), int()]);
    assert!(matches!(
        aix.check_layout(&leading),
        Err(LayoutViolation::Unsupported { .. })
    ));

    let sysv = LayoutValidator::new(&PlatformLinker::SysVx64);
    assert!(matches!(
        sysv.check_layout(&layout),
        Err(LayoutViolation::Unsupported { .. })
    ));
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[test]
fn test_strip_names_recursively() {
    let target = strukt(vec![int().with_name("x"), int().with_name("y")]).with_name("point");
    let pointer = ValueLayout::ADDRESS.with_target_layout(target).unwrap().with_name("p");
    let named = strukt(vec![pointer.into(), bytes(8).with_name("tag")]).with_name("outer");

    let stripped = strip_names(&named);
    let expected_target = strukt(vec![int(), int()]);
    let expected = strukt(vec![
        ValueLayout::ADDRESS.with_target_layout(expected_target).unwrap().into(),
        bytes(8),
    ]);
    assert_eq!(stripped, expected);
    assert_eq!(stripped.byte_size(), named.byte_size());
    assert_eq!(stripped.byte_alignment(), named.byte_alignment());
}

#[test]
fn test_normalize_keeps_explicit_alignment() {
    let aligned = strukt(vec![int()]).with_byte_alignment(8).unwrap().with_name("a");
    let stripped = strip_names(&aligned);
    assert_eq!(stripped.byte_alignment(), 8);
    assert_eq!(stripped.name(), None);
}

/// Struct of the given scalars with the padding a C compiler would insert
fn c_struct(kinds: &[(ScalarKind, Option<String>)]) -> MemoryLayout {
    let mut members = Vec::new();
    let mut offset = 0;
    let mut max_align = 1;
    for (kind, name) in kinds {
        let value = ValueLayout::of(*kind);
        let align = value.byte_alignment();
        max_align = max_align.max(align);
        let aligned = align_up(offset, align);
        if aligned > offset {
            members.push(pad(aligned - offset));
        }
        let member: MemoryLayout = match name {
            Some(name) => value.with_name(name.clone()).into(),
            None => value.into(),
        };
        offset = aligned + member.byte_size();
        members.push(member);
    }
    let end = align_up(offset, max_align);
    if end > offset {
        members.push(pad(end - offset));
    }
    strukt(members)
}

fn scalar_kind() -> impl Strategy<Value = ScalarKind> {
    prop_oneof![
        Just(ScalarKind::Bool),
        Just(ScalarKind::Byte),
        Just(ScalarKind::Char),
        Just(ScalarKind::Short),
        Just(ScalarKind::Int),
        Just(ScalarKind::Long),
        Just(ScalarKind::Float),
        Just(ScalarKind::Double),
        Just(ScalarKind::Address),
    ]
}

proptest! {
    #[test]
    fn prop_normalization_preserves_validity(
        fields in prop::collection::vec((scalar_kind(), prop::option::of("[a-z]{1,6}")), 1..8)
    ) {
        let layout = c_struct(&fields);
        prop_assert_eq!(check(&layout), Ok(()));

        let stripped = strip_names(&layout);
        prop_assert_eq!(check(&stripped), Ok(()));
        prop_assert_eq!(stripped.byte_size(), layout.byte_size());
        prop_assert_eq!(stripped.byte_alignment(), layout.byte_alignment());

        let unnamed: Vec<_> = fields.iter().map(|(k, _)| (*k, None)).collect();
        prop_assert_eq!(stripped, c_struct(&unnamed));
    }
}

// ---------------------------------------------------------------------------
// Options and variadic policy
// ---------------------------------------------------------------------------

fn printf_like(tail: ValueLayout) -> FunctionDescriptor {
    FunctionDescriptor::of(int(), [ValueLayout::ADDRESS.into(), tail.into()]).unwrap()
}

#[test]
fn test_variadic_float_rejected_double_accepted() {
    let linker = Linker::new(PlatformLinker::current());
    let variadic = [LinkOption::first_variadic_arg(1)];

    let float = FunctionDescriptor::of(int(), [int(), ValueLayout::FLOAT.into()]).unwrap();
    assert!(matches!(
        linker.downcall_handle_unbound(&float, &variadic),
        Err(LinkError::UnsupportedVariadicArgument { index: 1, .. })
    ));

    let double = FunctionDescriptor::of(int(), [int(), ValueLayout::DOUBLE.into()]).unwrap();
    let handle = linker.downcall_handle_unbound(&double, &variadic).unwrap();
    assert_eq!(handle.descriptor(), &double);
}

#[test]
fn test_variadic_policy_ignores_fixed_prefix() {
    let options = LinkerOptions::for_downcall(
        &printf_like(ValueLayout::DOUBLE),
        &[LinkOption::first_variadic_arg(1)],
    )
    .unwrap();
    let fixed_short =
        FunctionDescriptor::of(int(), [ValueLayout::SHORT.into(), ValueLayout::LONG.into()]).unwrap();
    assert_eq!(check_variadic_layouts(&fixed_short, &options), Ok(()));

    for narrow in [ValueLayout::BOOL, ValueLayout::BYTE, ValueLayout::CHAR, ValueLayout::SHORT] {
        assert!(check_variadic_layouts(&printf_like(narrow), &options).is_err());
    }
}

#[test]
fn test_option_validation() {
    let desc = printf_like(ValueLayout::INT);

    assert!(LinkerOptions::for_downcall(&desc, &[LinkOption::first_variadic_arg(2)]).is_ok());
    assert!(matches!(
        LinkerOptions::for_downcall(&desc, &[LinkOption::first_variadic_arg(3)]),
        Err(LinkError::InvalidOption { .. })
    ));

    let dup = [LinkOption::critical(false), LinkOption::critical(true)];
    assert!(matches!(
        LinkerOptions::for_downcall(&desc, &dup),
        Err(LinkError::InvalidOption { .. })
    ));

    assert!(LinkOption::capture_call_state(["errno"]).is_ok());
    assert!(matches!(
        LinkOption::capture_call_state(["nope"]),
        Err(LinkError::InvalidOption { .. })
    ));

    assert!(matches!(
        LinkerOptions::for_upcall(&desc, &[LinkOption::critical(false)]),
        Err(LinkError::InvalidOption { .. })
    ));
}

#[test]
fn test_options_take_part_in_identity() {
    let linker = Linker::new(PlatformLinker::current());
    let desc = FunctionDescriptor::of(int(), [int(), int()]).unwrap();

    let plain = linker.downcall_handle_unbound(&desc, &[]).unwrap();
    let critical = linker
        .downcall_handle_unbound(&desc, &[LinkOption::critical(false)])
        .unwrap();
    assert!(!plain.shares_artifact(&critical));
    assert_eq!(linker.downcall_cache_stats().misses, 2);
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[test]
fn test_name_insensitive_identity() {
    let linker = Linker::new(PlatformLinker::current());
    let a = FunctionDescriptor::of(
        long(),
        [strukt(vec![int().with_name("x"), int().with_name("y")]).with_name("point")],
    )
    .unwrap();
    let b = FunctionDescriptor::of(
        long().with_name("result"),
        [strukt(vec![int().with_name("u"), int().with_name("v")])],
    )
    .unwrap();

    let ha = linker.downcall_handle_unbound(&a, &[]).unwrap();
    let hb = linker.downcall_handle_unbound(&b, &[]).unwrap();
    assert!(ha.shares_artifact(&hb));

    let stats = linker.downcall_cache_stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
}

#[test]
fn test_bound_handle_calls_target() {
    let linker = Linker::new(PlatformLinker::current());
    let desc = FunctionDescriptor::of(int(), [int(), int()]).unwrap();
    let handle = linker
        .downcall_handle(add_i32 as *const (), &desc, &[])
        .unwrap();
    assert!(handle.is_bound());
    let result = unsafe { handle.invoke(&[Value::Int(40), Value::Int(2)]) };
    assert_eq!(result, Ok(Value::Int(42)));

    let unbound = linker.downcall_handle_unbound(&desc, &[]).unwrap();
    assert!(unbound.shares_artifact(&handle));
    let result = unsafe {
        unbound.invoke(&[Value::Address(add_i32 as usize), Value::Int(1), Value::Int(2)])
    };
    assert_eq!(result, Ok(Value::Int(3)));
}

#[test]
fn test_null_symbol_checked_before_validation() {
    let linker = Linker::new(PlatformLinker::current());
    let broken = FunctionDescriptor::of_void([strukt(vec![int(), long()])]).unwrap();
    assert_eq!(
        linker.downcall_handle(core::ptr::null(), &broken, &[]).unwrap_err(),
        LinkError::NullInput { what: "symbol" }
    );
    assert!(matches!(
        linker.downcall_handle(add_i32 as *const (), &broken, &[]),
        Err(LinkError::InvalidLayout(_))
    ));
}

#[test]
fn test_access_checked_first() {
    let mut config = LinkerConfig::default();
    config.access.mode = AccessMode::Deny;
    let linker = Linker::with_config(PlatformLinker::current(), &config);
    let desc = FunctionDescriptor::of_void([]).unwrap();

    assert!(matches!(
        linker.downcall_handle(core::ptr::null(), &desc, &[]),
        Err(LinkError::NativeAccessDenied { operation: "downcallHandle", .. })
    ));
    assert!(matches!(
        linker.upcall_stub_factory(&desc, &[]),
        Err(LinkError::NativeAccessDenied { operation: "upcallStub", .. })
    ));
    assert_eq!(linker.downcall_cache_stats().misses, 0);
}

#[test]
fn test_reclaim_rebuilds_unheld_artifacts() {
    let linker = Linker::new(PlatformLinker::current());
    let desc = FunctionDescriptor::of(int(), [int(), int()]).unwrap();

    let held = linker.downcall_handle_unbound(&desc, &[]).unwrap();
    assert_eq!(linker.reclaim(), 1);
    let again = linker.downcall_handle_unbound(&desc, &[]).unwrap();
    assert!(held.shares_artifact(&again));

    drop((held, again));
    linker.reclaim();
    let rebuilt = linker.downcall_handle_unbound(&desc, &[]).unwrap();
    assert_eq!(rebuilt.descriptor(), &desc);
    assert_eq!(linker.downcall_cache_stats().misses, 2);
}

#[test]
fn test_upcall_target_checks() {
    let linker = Linker::new(PlatformLinker::current());
    let arena = Arena::new();
    let desc = FunctionDescriptor::of(int(), [int()]).unwrap();

    let wrong = UpcallTarget::new(MethodType::new([Carrier::Long], Some(Carrier::Int)), |_| {
        Value::Int(0)
    });
    assert!(matches!(
        linker.upcall_stub(wrong, &desc, &arena, &[]),
        Err(LinkError::SignatureMismatch { .. })
    ));

    let fallible = UpcallTarget::fallible(desc.to_method_type(), |_| Ok(Value::Int(0)));
    assert!(matches!(
        linker.upcall_stub(fallible, &desc, &arena, &[]),
        Err(LinkError::TargetMayFail { .. })
    ));

    let fine = UpcallTarget::new(desc.to_method_type(), |args| args[0].clone());
    assert!(matches!(
        linker.upcall_stub(fine, &desc, &arena, &[LinkOption::critical(false)]),
        Err(LinkError::InvalidOption { .. })
    ));
    assert_eq!(linker.upcall_cache_stats().misses, 0);
}

/// Platform strategy that counts and slows down downcall arrangement
struct CountingAbi {
    inner: PlatformLinker,
    downcalls: AtomicUsize,
}

impl AbiDispatch for CountingAbi {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn canonical_layouts(&self) -> &CanonicalLayouts {
        self.inner.canonical_layouts()
    }

    fn arrange_downcall(
        &self,
        method_type: &MethodType,
        descriptor: &FunctionDescriptor,
        options: &LinkerOptions,
    ) -> Result<NativeInvoker, LinkError> {
        self.downcalls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(25));
        self.inner.arrange_downcall(method_type, descriptor, options)
    }

    fn arrange_upcall(
        &self,
        method_type: &MethodType,
        descriptor: &FunctionDescriptor,
        options: &LinkerOptions,
    ) -> Result<UpcallStubFactory, LinkError> {
        self.inner.arrange_upcall(method_type, descriptor, options)
    }
}

#[test]
fn test_concurrent_requests_dispatch_once() {
    let linker = Arc::new(Linker::new(CountingAbi {
        inner: PlatformLinker::current(),
        downcalls: AtomicUsize::new(0),
    }));
    let barrier = Arc::new(Barrier::new(8));

    let threads: Vec<_> = (0..8)
        .map(|i| {
            let linker = linker.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                // Names differ per thread; the request is the same
                let desc = FunctionDescriptor::of(
                    long().with_name(format!("r{}", i)),
                    [int().with_name(format!("a{}", i)), ValueLayout::DOUBLE.into()],
                )
                .unwrap();
                barrier.wait();
                linker.downcall_handle_unbound(&desc, &[]).unwrap()
            })
        })
        .collect();

    let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(linker.abi().downcalls.load(Ordering::SeqCst), 1);
    assert!(handles.windows(2).all(|w| w[0].shares_artifact(&w[1])));
    assert_eq!(linker.platform_name(), "counting");
}
