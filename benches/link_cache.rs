//! Linkage benchmarks
//!
//! Measures cached vs. fresh linkage, layout validation and call overhead.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use typthon_link::{FunctionDescriptor, Linker, MemoryLayout, PlatformLinker, Value, ValueLayout};

extern "C" fn add_i64(a: i64, b: i64) -> i64 {
    a.wrapping_add(b)
}

/// Naturally aligned struct of `n` alternating int/long members
fn c_struct(n: usize) -> MemoryLayout {
    let mut members = Vec::new();
    let mut offset = 0u64;
    for i in 0..n {
        let member: MemoryLayout = if i % 2 == 0 {
            ValueLayout::INT.with_name(format!("f{}", i)).into()
        } else {
            ValueLayout::LONG.with_name(format!("f{}", i)).into()
        };
        let aligned = (offset + member.byte_alignment() - 1) / member.byte_alignment() * member.byte_alignment();
        if aligned > offset {
            members.push(MemoryLayout::padding(aligned - offset).unwrap());
        }
        offset = aligned + member.byte_size();
        members.push(member);
    }
    let end = (offset + 7) / 8 * 8;
    if end > offset {
        members.push(MemoryLayout::padding(end - offset).unwrap());
    }
    MemoryLayout::struct_layout(members).unwrap()
}

fn bench_cached_linkage(c: &mut Criterion) {
    let mut group = c.benchmark_group("linkage");
    let linker = Linker::new(PlatformLinker::current());
    let desc = FunctionDescriptor::of(ValueLayout::LONG.into(), [c_struct(6), ValueLayout::LONG.into()]).unwrap();

    // Warm the cache
    let _held = linker.downcall_handle_unbound(&desc, &[]).unwrap();

    group.bench_function("cache_hit", |b| {
        b.iter(|| black_box(linker.downcall_handle_unbound(black_box(&desc), &[]).unwrap()));
    });

    group.bench_function("cache_miss", |b| {
        b.iter(|| {
            let fresh = Linker::new(PlatformLinker::current());
            black_box(fresh.downcall_handle_unbound(black_box(&desc), &[]).unwrap())
        });
    });

    group.finish();
}

fn bench_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("validation");
    let linker = Linker::new(PlatformLinker::current());

    for members in [2, 8, 32].iter() {
        let layout = c_struct(*members);
        group.bench_with_input(BenchmarkId::new("struct", members), &layout, |b, layout| {
            b.iter(|| black_box(linker.validator().check_layout(black_box(layout))));
        });
    }

    group.finish();
}

fn bench_invoke(c: &mut Criterion) {
    let linker = Linker::new(PlatformLinker::current());
    let desc = FunctionDescriptor::of(
        ValueLayout::LONG.into(),
        [ValueLayout::LONG.into(), ValueLayout::LONG.into()],
    )
    .unwrap();
    let handle = linker
        .downcall_handle(add_i64 as *const (), &desc, &[])
        .unwrap();
    let args = [Value::Long(40), Value::Long(2)];

    c.bench_function("invoke_add_i64", |b| {
        b.iter(|| black_box(unsafe { handle.invoke(black_box(&args)) }));
    });
}

criterion_group!(benches, bench_cached_linkage, bench_validation, bench_invoke);
criterion_main!(benches);
