use std::sync::Arc;
use std::thread;
use typthon_link::config::{CacheConfig, LinkerConfig};
use typthon_link::{
    native_linker, Arena, CallContext, Carrier, FunctionDescriptor, InvokeError, LinkError,
    LinkOption, Linker, MemoryLayout, MemorySegment, MethodType, PlatformLinker, SegmentAllocator,
    UpcallTarget, Value, ValueLayout,
};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Pair {
    a: i32,
    b: i64,
}

extern "C" fn make_pair(a: i32, b: i64) -> Pair {
    Pair { a, b }
}

extern "C" fn apply(f: extern "C" fn(i32) -> i32, x: i32) -> i32 {
    f(x) + 1
}

#[cfg(target_os = "linux")]
extern "C" fn fail_with(code: i32) -> i32 {
    unsafe { *libc::__errno_location() = code };
    -1
}

fn int() -> MemoryLayout {
    ValueLayout::INT.into()
}

fn long() -> MemoryLayout {
    ValueLayout::LONG.into()
}

fn address() -> MemoryLayout {
    ValueLayout::ADDRESS.into()
}

fn pair_layout() -> MemoryLayout {
    MemoryLayout::struct_layout([
        MemoryLayout::from(ValueLayout::INT.with_name("a")),
        MemoryLayout::padding(4).unwrap(),
        MemoryLayout::from(ValueLayout::LONG.with_name("b")),
    ])
    .unwrap()
}

#[test]
fn test_canonical_layouts() {
    let layouts = native_linker().canonical_layouts();
    assert_eq!(layouts.get("int"), Some(&ValueLayout::INT));
    assert_eq!(layouts.get("long long"), Some(&ValueLayout::LONG));
    assert_eq!(layouts.get("double"), Some(&ValueLayout::DOUBLE));
    assert_eq!(layouts.get("void*"), Some(&ValueLayout::ADDRESS));
    assert_eq!(
        layouts.get("size_t").map(|l| l.byte_size()),
        Some(core::mem::size_of::<usize>() as u64)
    );
    assert_eq!(layouts.get("__int128"), None);
}

#[test]
fn test_struct_return_needs_allocator() {
    let linker = Linker::new(PlatformLinker::current());
    let desc = FunctionDescriptor::of(pair_layout(), [int(), long()]).unwrap();
    let handle = linker
        .downcall_handle(make_pair as *const (), &desc, &[])
        .unwrap();
    assert!(handle.artifact().requires_allocator());

    let args = [Value::Int(3), Value::Long(39)];
    assert_eq!(
        unsafe { handle.invoke(&args) },
        Err(InvokeError::MissingAllocator)
    );

    let arena = Arena::confined();
    let ctx = CallContext::new().with_allocator(&arena);
    let result = unsafe { handle.invoke_with(&ctx, &args) }.unwrap();
    let pair = result.as_segment().unwrap();
    assert_eq!(pair.byte_size(), 16);
    assert_eq!(pair.get::<i32>(0), Ok(3));
    assert_eq!(pair.get::<i64>(8), Ok(39));
}

#[test]
fn test_upcall_passed_to_downcall() {
    let linker = Linker::new(PlatformLinker::current());
    let callback = FunctionDescriptor::of(int(), [int()]).unwrap();
    let double_it = UpcallTarget::new(MethodType::new(vec![Carrier::Int], Some(Carrier::Int)), |args| {
        Value::Int(args[0].as_int().unwrap_or(0) * 2)
    });

    let arena = Arena::new();
    let stub = linker.upcall_stub(double_it, &callback, &arena, &[]).unwrap();

    let desc = FunctionDescriptor::of(int(), [address(), int()]).unwrap();
    let handle = linker.downcall_handle(apply as *const (), &desc, &[]).unwrap();
    let result = unsafe { handle.invoke(&[Value::Segment(stub.clone()), Value::Int(20)]) };
    assert_eq!(result, Ok(Value::Int(41)));

    arena.close().unwrap();
    assert!(!stub.is_alive());
    // A closed stub cannot even be passed along
    assert!(unsafe { handle.invoke(&[Value::Segment(stub), Value::Int(1)]) }.is_err());
}

#[cfg(unix)]
#[test]
fn test_qsort_with_upcall_comparator() {
    let linker = native_linker();
    let comparator = FunctionDescriptor::of(
        int(),
        [
            MemoryLayout::from(ValueLayout::ADDRESS.with_target_layout(int()).unwrap()),
            MemoryLayout::from(ValueLayout::ADDRESS.with_target_layout(int()).unwrap()),
        ],
    )
    .unwrap();
    let compare = UpcallTarget::new(comparator.to_method_type(), |args| {
        let read = |v: &Value| {
            let segment = MemorySegment::of_address(v.as_address().unwrap_or(0));
            unsafe { segment.reinterpret(4) }.get::<i32>(0).unwrap_or(0)
        };
        Value::Int(read(&args[0]).cmp(&read(&args[1])) as i32)
    });

    let arena = Arena::new();
    let stub = linker.upcall_stub(compare, &comparator, &arena, &[]).unwrap();

    let numbers = [5i32, -2, 9, 0, 3];
    let array = arena.allocate(4 * numbers.len() as u64, 4).unwrap();
    for (i, n) in numbers.iter().enumerate() {
        array.set::<i32>(4 * i as u64, *n).unwrap();
    }

    let qsort_desc = FunctionDescriptor::of_void([address(), long(), long(), address()]).unwrap();
    let qsort = linker
        .downcall_handle(libc::qsort as *const (), &qsort_desc, &[])
        .unwrap();
    let result = unsafe {
        qsort.invoke(&[
            Value::Segment(array.clone()),
            Value::Long(numbers.len() as i64),
            Value::Long(4),
            Value::Segment(stub),
        ])
    };
    assert_eq!(result, Ok(Value::Void));

    let sorted: Vec<i32> = (0..numbers.len())
        .map(|i| array.get::<i32>(4 * i as u64).unwrap())
        .collect();
    assert_eq!(sorted, vec![-2, 0, 3, 5, 9]);
}

#[cfg(target_os = "linux")]
#[test]
fn test_errno_capture_through_handle() {
    let linker = Linker::new(PlatformLinker::current());
    let desc = FunctionDescriptor::of(int(), [int()]).unwrap();
    let capture = LinkOption::capture_call_state(["errno"]).unwrap();
    let handle = linker
        .downcall_handle(fail_with as *const (), &desc, &[capture])
        .unwrap();

    assert_eq!(
        unsafe { handle.invoke(&[Value::Int(libc::ENOENT)]) },
        Err(InvokeError::MissingCaptureState)
    );

    let layout = handle.artifact().capture_layout().cloned().unwrap();
    let arena = Arena::confined();
    let state = arena.allocate_layout(&layout).unwrap();
    let ctx = CallContext::new().with_capture_state(&state);
    let result = unsafe { handle.invoke_with(&ctx, &[Value::Int(libc::ENOENT)]) };
    assert_eq!(result, Ok(Value::Int(-1)));
    assert_eq!(state.get::<i32>(0), Ok(libc::ENOENT));
}

#[test]
fn test_rejections_through_public_api() {
    let linker = Linker::new(PlatformLinker::current());

    let unpadded = MemoryLayout::struct_layout([int(), long()]).unwrap();
    let desc = FunctionDescriptor::of_void([unpadded]).unwrap();
    assert!(matches!(
        linker.downcall_handle_unbound(&desc, &[]),
        Err(LinkError::InvalidLayout(_))
    ));

    let printf = FunctionDescriptor::of(int(), [address(), ValueLayout::FLOAT.into()]).unwrap();
    assert_eq!(
        linker
            .downcall_handle_unbound(&printf, &[LinkOption::first_variadic_arg(1)])
            .unwrap_err(),
        LinkError::UnsupportedVariadicArgument {
            index: 1,
            layout: ValueLayout::FLOAT.to_string()
        }
    );

    assert!(matches!(
        LinkOption::capture_call_state(["errno", "not_a_state"]),
        Err(LinkError::InvalidOption { .. })
    ));
    assert!(matches!(
        linker.upcall_stub_factory(&printf, &[LinkOption::first_variadic_arg(1)]),
        Err(LinkError::InvalidOption { .. })
    ));
    assert_eq!(linker.downcall_cache_stats().entries, 0);
}

#[test]
fn test_concurrent_linking_shares_artifacts() {
    let linker = Arc::new(Linker::new(PlatformLinker::current()));
    let desc = FunctionDescriptor::of(pair_layout(), [int(), long()]).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let linker = linker.clone();
            let desc = desc.clone();
            thread::spawn(move || linker.downcall_handle_unbound(&desc, &[]).unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|t| t.join().unwrap())
        .collect();

    assert!(handles.windows(2).all(|w| w[0].shares_artifact(&w[1])));
    let stats = linker.downcall_cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 7);
}

#[test]
fn test_soft_limit_bounds_cache() {
    let config = LinkerConfig {
        cache: CacheConfig {
            soft_limit: 4,
            log_reclaims: false,
        },
        ..LinkerConfig::default()
    };
    let linker = Linker::with_config(PlatformLinker::current(), &config);

    for n in 0..16 {
        let desc = FunctionDescriptor::of_void(vec![int(); n]).unwrap();
        linker.downcall_handle_unbound(&desc, &[]).unwrap();
    }
    assert!(linker.downcall_cache_stats().strong <= 5);
    assert!(linker.downcall_cache_stats().reclaimed > 0);
}
