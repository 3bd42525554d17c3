//! Arena and segment tests

use super::*;
use crate::layout::ValueLayout;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::sync::Arc;

#[test]
fn test_allocation_is_zeroed_and_aligned() {
    let arena = Arena::new();
    let seg = arena.allocate(24, 16).unwrap();
    assert_eq!(seg.byte_size(), 24);
    assert_eq!(seg.address() % 16, 0);
    assert_eq!(seg.to_vec().unwrap(), vec![0u8; 24]);
}

#[test]
fn test_typed_access() {
    let arena = Arena::new();
    let seg = arena.allocate_layout(&ValueLayout::LONG.into()).unwrap();
    seg.set::<i64>(0, -7).unwrap();
    assert_eq!(seg.get::<i64>(0).unwrap(), -7);

    // Unaligned access is allowed
    seg.set::<i32>(1, 0x0102_0304).unwrap();
    assert_eq!(seg.get::<i32>(1).unwrap(), 0x0102_0304);
}

#[test]
fn test_out_of_bounds() {
    let arena = Arena::new();
    let seg = arena.allocate(4, 4).unwrap();
    assert_eq!(
        seg.get::<i64>(0),
        Err(MemoryError::OutOfBounds {
            offset: 0,
            length: 8,
            size: 4
        })
    );
    assert!(seg.get::<u8>(4).is_err());
    assert!(seg.get::<u8>(u64::MAX).is_err());
}

#[test]
fn test_closed_arena_rejects_access() {
    let arena = Arena::new();
    let seg = arena.allocate(8, 8).unwrap();
    assert!(seg.is_alive());

    arena.close().unwrap();
    assert!(!seg.is_alive());
    assert_eq!(seg.get::<u8>(0), Err(MemoryError::ScopeClosed));
    assert_eq!(arena.allocate(8, 8), Err(MemoryError::ScopeClosed));
}

#[test]
fn test_double_close() {
    let arena = Arena::new();
    arena.close().unwrap();
    assert_eq!(arena.close(), Err(MemoryError::AlreadyClosed));
}

#[test]
fn test_global_arena_not_closeable() {
    assert_eq!(Arena::global().close(), Err(MemoryError::NotCloseable));
    assert!(Arena::global().is_alive());
}

#[test]
fn test_confined_arena_thread_check() {
    let arena = Arena::confined();
    let seg = arena.allocate(4, 4).unwrap();
    seg.set::<i32>(0, 1).unwrap();

    let seg2 = seg.clone();
    let result = std::thread::spawn(move || seg2.get::<i32>(0)).join().unwrap();
    assert_eq!(result, Err(MemoryError::WrongThread));
}

#[test]
fn test_cleanups_run_on_close() {
    let counter = Arc::new(AtomicUsize::new(0));
    let arena = Arena::new();
    for _ in 0..3 {
        let counter = counter.clone();
        arena.register_cleanup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    drop(arena);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn test_copy_between_segments() {
    let arena = Arena::new();
    let a = arena.allocate(8, 8).unwrap();
    let b = arena.allocate(8, 8).unwrap();
    a.write_bytes(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    b.copy_from(&a).unwrap();
    assert_eq!(b.to_vec().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);

    let small = arena.allocate(4, 4).unwrap();
    assert!(small.copy_from(&a).is_err());
}

#[test]
fn test_of_address_is_unscoped() {
    let seg = MemorySegment::of_address(0x1000);
    assert_eq!(seg.byte_size(), 0);
    assert!(seg.is_alive());
    assert_eq!(seg.scope_id(), None);
    assert!(MemorySegment::NULL.is_null());
    assert_eq!(seg, MemorySegment::of_address(0x1000));
}

#[test]
fn test_zero_sized_allocation() {
    let arena = Arena::new();
    let seg = arena.allocate(0, 8).unwrap();
    assert_eq!(seg.byte_size(), 0);
    assert_eq!(seg.address() % 8, 0);
    assert!(seg.to_vec().unwrap().is_empty());
}

#[test]
fn test_close_waits_for_reader_on_other_thread() {
    let arena = Arena::new();
    let seg = arena.allocate(64 << 20, 8).unwrap();
    let reading = Arc::new(AtomicBool::new(false));

    let reader = {
        let seg = seg.clone();
        let reading = reading.clone();
        thread::spawn(move || {
            let mut reads = 0u64;
            loop {
                for offset in (0..seg.byte_size()).step_by(4096) {
                    match seg.get::<u64>(offset) {
                        Ok(value) => {
                            assert_eq!(value, 0);
                            reads += 1;
                            reading.store(true, Ordering::Release);
                        }
                        Err(err) => return (reads, err),
                    }
                }
            }
        })
    };

    while !reading.load(Ordering::Acquire) {
        thread::yield_now();
    }
    arena.close().unwrap();

    let (reads, err) = reader.join().unwrap();
    assert!(reads > 0);
    assert_eq!(err, MemoryError::ScopeClosed);
}

#[test]
fn test_close_from_other_thread_during_writes() {
    let arena = Arc::new(Arena::new());
    let seg = arena.allocate(1 << 16, 8).unwrap();

    let closer = {
        let arena = arena.clone();
        thread::spawn(move || arena.close())
    };

    // Every write either lands in live memory or sees the closed scope
    let mut offset = 0;
    loop {
        match seg.set::<u64>(offset % seg.byte_size(), offset) {
            Ok(()) => offset += 8,
            Err(err) => {
                assert_eq!(err, MemoryError::ScopeClosed);
                break;
            }
        }
    }
    assert_eq!(closer.join().unwrap(), Ok(()));
    assert!(seg.fill(1).is_err());
}
