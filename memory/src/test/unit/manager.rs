use std::sync::Arc;
use std::thread;
use std::time::Duration;

use test_case::test_case;

use crate::allocator::DeviceAllocator;
use crate::backend::Backend;
use crate::config::MemoryConfig;
use crate::error::Error;
use crate::manager::{BufferInfo, MemoryManager, bytes_to_string};
use crate::test::helpers::*;

fn config() -> MemoryConfig {
    MemoryConfig::builder().step_size(1024).build()
}

#[test_case(1, 1024; "one_byte")]
#[test_case(100, 1024; "small")]
#[test_case(1024, 1024; "exact_step")]
#[test_case(1025, 2048; "just_over_step")]
#[test_case(5000, 5120; "several_steps")]
fn test_requests_round_up_to_step(bytes: usize, bucket: usize) {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    manager.allocate(bytes, false).unwrap();
    assert_eq!(manager.buffer_info().unwrap().alloc_bytes, bucket);
    assert_eq!(backend.used_bytes(0), bucket);
}

#[test]
fn test_released_buffer_is_reused() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let first = manager.allocate(100, false).unwrap();
    assert!(first.event.is_none(), "fresh native allocation has nothing to wait for");
    manager.release(first.ptr, event(&backend), false).unwrap();

    let second = manager.allocate(100, false).unwrap();
    assert_eq!(second.ptr, first.ptr);
    assert_eq!(backend.buffers_created(), 1);
    assert_consistent(&manager, &backend, 0);
}

#[test]
fn test_outstanding_buffers_are_distinct() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let a = manager.allocate(100, false).unwrap();
    let b = manager.allocate(200, false).unwrap();
    assert_ne!(a.ptr, b.ptr);
    manager.release(a.ptr, event(&backend), false).unwrap();

    let c = manager.allocate(300, false).unwrap();
    assert_eq!(c.ptr, a.ptr, "all three requests share the 1024 byte bucket");
    assert_eq!(backend.buffers_created(), 2);
    assert_eq!(
        manager.buffer_info().unwrap(),
        BufferInfo { alloc_bytes: 2048, alloc_buffers: 2, lock_bytes: 2048, lock_buffers: 2 }
    );
}

#[test]
fn test_most_recently_freed_is_reused_first() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let a = manager.allocate(512, false).unwrap().ptr;
    let b = manager.allocate(512, false).unwrap().ptr;
    manager.release(a, event(&backend), false).unwrap();
    manager.release(b, event(&backend), false).unwrap();

    assert_eq!(manager.allocate(512, false).unwrap().ptr, b);
    assert_eq!(manager.allocate(512, false).unwrap().ptr, a);
}

#[test]
fn test_release_event_travels_with_buffer() {
    let backend = host(1);
    let queue = queue(&backend, 0);
    let manager = device_manager(&backend, config());

    let ptr = manager.allocate(4096, false).unwrap().ptr;
    let ticket = queue.issue();
    let released = event(&backend);
    assert_eq!(released.value(), ticket);
    manager.release(ptr, event(&backend), false).unwrap();

    let reused = manager.allocate(4096, false).unwrap();
    assert_eq!(reused.ptr, ptr);
    let wait = reused.event.expect("cached buffer carries its release event");
    assert!(wait.same_point(&released));
    assert!(!wait.is_complete());

    queue.retire(ticket).unwrap();
    assert!(wait.is_complete());
}

#[test]
fn test_garbage_collect_frees_only_cached_buffers() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let ptrs: Vec<_> = (1..=3).map(|n| manager.allocate(n * 1024, false).unwrap().ptr).collect();
    manager.release(ptrs[0], event(&backend), false).unwrap();
    manager.release(ptrs[2], event(&backend), false).unwrap();

    manager.garbage_collect().unwrap();

    let info = manager.buffer_info().unwrap();
    assert_eq!(info.alloc_bytes, info.lock_bytes);
    assert_eq!(info, BufferInfo { alloc_bytes: 2048, alloc_buffers: 1, lock_bytes: 2048, lock_buffers: 1 });
    assert_eq!(manager.cached_buffers(0), 0);
    assert_consistent(&manager, &backend, 0);
}

#[test]
fn test_garbage_collect_waits_for_outstanding_work() {
    let backend = host(1);
    let queue = queue(&backend, 0);
    let manager = device_manager(&backend, config());

    let ptr = manager.allocate(1024, false).unwrap().ptr;
    let ticket = queue.issue();
    manager.release(ptr, event(&backend), false).unwrap();

    let retirer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            queue.retire(ticket).unwrap();
        })
    };

    manager.garbage_collect().unwrap();
    assert_eq!(queue.retired(), ticket, "native free happened only after the work retired");
    assert_eq!(backend.live_buffers(0), 0);
    retirer.join().unwrap();
}

#[test]
fn test_user_lock_survives_release() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let ptr = manager.allocate(100, false).unwrap().ptr;
    manager.user_lock(ptr).unwrap();
    manager.user_lock(ptr).unwrap();
    manager.release(ptr, event(&backend), false).unwrap();

    assert!(manager.is_user_locked(ptr));
    assert_eq!(manager.cached_buffers(0), 0);
    manager.garbage_collect().unwrap();
    assert_eq!(backend.live_buffers(0), 1, "user-locked buffer must not be collected");

    manager.user_unlock(ptr).unwrap();
    assert!(!manager.is_user_locked(ptr));
    assert_eq!(manager.cached_buffers(0), 1);
    assert_eq!(manager.buffer_info().unwrap().lock_buffers, 0);
}

#[test]
fn test_release_while_user_locked_keeps_event() {
    let backend = host(1);
    let queue = queue(&backend, 0);
    let manager = device_manager(&backend, config());

    let ptr = manager.allocate(100, false).unwrap().ptr;
    manager.user_lock(ptr).unwrap();
    queue.issue();
    let released = event(&backend);
    manager.release(ptr, event(&backend), false).unwrap();
    manager.user_unlock(ptr).unwrap();

    let reused = manager.allocate(100, false).unwrap();
    assert_eq!(reused.ptr, ptr);
    assert!(reused.event.expect("pending release event").same_point(&released));
}

#[test]
fn test_user_allocation_freed_by_user_release() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let ptr = manager.allocate(100, true).unwrap().ptr;
    assert!(manager.is_user_locked(ptr));

    manager.release(ptr, event(&backend), true).unwrap();
    assert!(!manager.is_user_locked(ptr));
    assert_eq!(manager.cached_buffers(0), 1);
}

#[test]
fn test_user_unlock_of_unlocked_buffer_is_noop() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let ptr = manager.allocate(100, false).unwrap().ptr;
    manager.user_unlock(ptr).unwrap();
    assert_eq!(manager.buffer_info().unwrap().lock_buffers, 1);
    assert_eq!(manager.cached_buffers(0), 0);
}

#[test]
fn test_user_lock_reclaims_cached_buffer() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let ptr = manager.allocate(100, false).unwrap().ptr;
    manager.release(ptr, event(&backend), false).unwrap();
    manager.user_lock(ptr).unwrap();

    assert!(manager.is_user_locked(ptr));
    assert_eq!(manager.cached_buffers(0), 0);
    assert_ne!(manager.allocate(100, false).unwrap().ptr, ptr);
}

#[test]
fn test_user_lock_of_foreign_pointer_fails() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let foreign = crate::BufferPtr::new(0xdead0).unwrap();
    assert!(matches!(manager.user_lock(foreign), Err(Error::UnknownBuffer { .. })));
    assert!(!manager.is_user_locked(foreign));
}

#[test]
fn test_double_release_is_rejected() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let ptr = manager.allocate(100, false).unwrap().ptr;
    manager.release(ptr, event(&backend), false).unwrap();
    let before = manager.buffer_info().unwrap();

    assert!(matches!(manager.release(ptr, event(&backend), false), Err(Error::UnknownBuffer { .. })));
    assert_eq!(manager.buffer_info().unwrap(), before);
    assert_eq!(manager.cached_buffers(0), 1);
}

#[test]
fn test_double_release_while_user_locked_is_rejected() {
    let backend = host(1);
    let queue = queue(&backend, 0);
    let manager = device_manager(&backend, config());

    let ptr = manager.allocate(100, false).unwrap().ptr;
    manager.user_lock(ptr).unwrap();
    queue.issue();
    let released = event(&backend);
    manager.release(ptr, event(&backend), false).unwrap();

    queue.issue();
    assert!(matches!(manager.release(ptr, event(&backend), false), Err(Error::UnknownBuffer { .. })));
    assert!(manager.is_user_locked(ptr));

    // The first release event is still the one attached on unlock.
    manager.user_unlock(ptr).unwrap();
    let reused = manager.allocate(100, false).unwrap();
    assert!(reused.event.expect("pending release event").same_point(&released));
}

#[test]
fn test_release_after_shutdown_frees_natively() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let locked = manager.allocate(100, false).unwrap().ptr;
    let user = manager.allocate(100, true).unwrap().ptr;
    manager.shutdown();
    assert_eq!(backend.live_buffers(0), 2);

    manager.release(locked, event(&backend), false).unwrap();
    manager.release(user, event(&backend), true).unwrap();

    assert_eq!(manager.cached_buffers(0), 0);
    assert_eq!(manager.buffer_info().unwrap(), BufferInfo::default());
    assert_eq!(backend.live_buffers(0), 0);
}

#[test]
fn test_zero_bytes_is_invalid() {
    let backend = host(1);
    let manager = device_manager(&backend, config());
    assert!(matches!(manager.allocate(0, false), Err(Error::InvalidSize { bytes: 0 })));
}

#[test]
fn test_request_over_budget_is_out_of_memory() {
    let backend = host(1);
    let manager = device_manager(&backend, config());
    let max_bytes = manager.max_bytes();
    assert_eq!(max_bytes, DEVICE_MEMORY / 4 * 3);

    let err = manager.allocate(max_bytes + 1, false).unwrap_err();
    assert!(err.is_out_of_memory(), "unexpected error: {err}");

    assert_eq!(manager.buffer_info().unwrap(), BufferInfo::default());
    manager.allocate(1024, false).unwrap();
    assert_consistent(&manager, &backend, 0);
}

#[test]
fn test_budget_pressure_collects_free_buffers() {
    let backend = host(1);
    let manager = device_manager(&backend, MemoryConfig::builder().step_size(1024).max_bytes(4096).build());

    let small = manager.allocate(2048, false).unwrap().ptr;
    manager.release(small, event(&backend), false).unwrap();

    manager.allocate(4096, false).unwrap();
    assert_eq!(manager.cached_buffers(0), 0);
    assert_eq!(backend.live_buffers(0), 1);
    assert!(manager.check_memory_limit());
}

#[test]
fn test_budget_exhausted_by_locked_buffers() {
    let backend = host(1);
    let manager = device_manager(&backend, MemoryConfig::builder().step_size(1024).max_bytes(4096).build());

    manager.allocate(3072, false).unwrap();
    let err = manager.allocate(2048, false).unwrap_err();
    assert!(matches!(err, Error::OutOfMemory { device: 0, bytes: 2048, max_bytes: 4096 }));
    manager.allocate(1024, false).unwrap();
}

#[test]
fn test_native_failure_retries_after_collection() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let cached = manager.allocate(2048, false).unwrap().ptr;
    manager.release(cached, event(&backend), false).unwrap();

    backend.fail_next_allocations(0, 1);
    manager.allocate(1024, false).unwrap();
    assert_eq!(manager.cached_buffers(0), 0, "failure triggered a collection");
    assert_consistent(&manager, &backend, 0);
}

#[test]
fn test_native_failure_after_collection_is_out_of_memory() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    backend.fail_next_allocations(0, 2);
    assert!(manager.allocate(1024, false).unwrap_err().is_out_of_memory());
    assert_eq!(manager.buffer_info().unwrap(), BufferInfo::default());
    manager.allocate(1024, false).unwrap();
}

#[test]
fn test_step_size_change_keeps_existing_buckets() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let ptr = manager.allocate(100, false).unwrap().ptr;
    manager.release(ptr, event(&backend), false).unwrap();

    manager.set_step_size(512);
    assert_eq!(manager.step_size(), 512);
    let other = manager.allocate(100, false).unwrap().ptr;

    assert_ne!(other, ptr);
    assert_eq!(manager.cached_buffers(0), 1);
    assert_eq!(manager.buffer_info().unwrap().alloc_bytes, 1024 + 512);
}

#[test]
fn test_buffer_limit_forces_collection() {
    let backend = host(1);
    let manager = device_manager(&backend, MemoryConfig::builder().step_size(1024).max_buffers(2).build());

    let a = manager.allocate(1024, false).unwrap().ptr;
    let b = manager.allocate(2048, false).unwrap().ptr;
    assert!(manager.check_memory_limit());
    manager.release(a, event(&backend), false).unwrap();
    manager.release(b, event(&backend), false).unwrap();

    manager.allocate(3072, false).unwrap();
    assert_eq!(manager.cached_buffers(0), 0);
    assert_eq!(manager.buffer_info().unwrap().alloc_buffers, 1);
}

#[test]
fn test_partitions_are_per_device() {
    let backend = host(2);
    let manager = device_manager(&backend, config());

    let on_zero = manager.allocate(1024, false).unwrap().ptr;
    backend.set_active_device(1).unwrap();
    let on_one = manager.allocate(2048, false).unwrap().ptr;

    assert_eq!(manager.buffer_info_for(0).unwrap().alloc_bytes, 1024);
    assert_eq!(manager.buffer_info_for(1).unwrap().alloc_bytes, 2048);
    assert_eq!(manager.buffer_info().unwrap().alloc_bytes, 2048);

    // Release is routed to the owning partition regardless of the active device.
    manager.release(on_zero, event(&backend), false).unwrap();
    manager.release(on_one, event(&backend), false).unwrap();
    assert_eq!(manager.cached_buffers(0), 1);
    assert_eq!(manager.cached_buffers(1), 1);

    manager.garbage_collect().unwrap();
    assert_eq!(backend.active_device_id(), 1, "active device is restored");
    assert_consistent(&manager, &backend, 0);
    assert_consistent(&manager, &backend, 1);
    assert_eq!(backend.live_buffers(0) + backend.live_buffers(1), 0);
}

#[test]
fn test_garbage_collect_single_device() {
    let backend = host(2);
    let manager = device_manager(&backend, config());

    let a = manager.allocate(1024, false).unwrap().ptr;
    backend.set_active_device(1).unwrap();
    let b = manager.allocate(1024, false).unwrap().ptr;
    manager.release(a, event(&backend), false).unwrap();
    manager.release(b, event(&backend), false).unwrap();

    manager.garbage_collect_device(0).unwrap();
    assert_eq!(manager.cached_buffers(0), 0);
    assert_eq!(manager.cached_buffers(1), 1);
    assert!(matches!(manager.garbage_collect_device(7), Err(Error::InvalidDevice { device: 7, count: 2 })));
}

#[test]
fn test_debug_mode_frees_on_release() {
    let backend = host(1);
    let manager = device_manager(&backend, MemoryConfig::builder().debug(true).build());

    let ptr = manager.allocate(100, false).unwrap().ptr;
    manager.release(ptr, event(&backend), false).unwrap();

    assert_eq!(manager.cached_buffers(0), 0);
    assert_eq!(backend.live_buffers(0), 0);
    assert_eq!(manager.buffer_info().unwrap(), BufferInfo::default());
}

#[test]
fn test_shutdown_suppresses_device_errors() {
    let backend = host(2);
    let native = FlakyAllocator { inner: DeviceAllocator::new(dyn_backend(&backend)), failing_device: 0 };
    let manager = MemoryManager::new(Box::new(native), &config());

    let a = manager.allocate(1024, false).unwrap().ptr;
    backend.set_active_device(1).unwrap();
    let b = manager.allocate(1024, false).unwrap().ptr;
    manager.release(a, event(&backend), false).unwrap();
    manager.release(b, event(&backend), false).unwrap();

    assert!(manager.garbage_collect().is_err());

    let c = manager.allocate(1024, false).unwrap().ptr;
    manager.release(c, event(&backend), false).unwrap();
    manager.shutdown();
    manager.shutdown();

    assert!(manager.is_shut_down());
    assert_eq!(backend.live_buffers(1), 0, "device 1 is cleaned up despite device 0 failing");
    assert_eq!(backend.active_device_id(), 1);
}

#[test]
fn test_memory_report_lists_buffers() {
    let backend = host(1);
    let manager = device_manager(&backend, config());

    let locked = manager.allocate(2048, true).unwrap().ptr;
    let cached = manager.allocate(1024, false).unwrap().ptr;
    manager.release(cached, event(&backend), false).unwrap();

    let report = manager.memory_report("after setup", 0).unwrap();
    assert_eq!(report.buffers.len(), 2);
    let row = report.buffers.iter().find(|r| r.ptr == locked).unwrap();
    assert!(row.user_lock && !row.manager_lock);

    let text = report.to_string();
    assert!(text.starts_with("after setup"));
    assert!(text.contains("3.00 KB in 2 buffers"));
    manager.print_info("after setup", 0).unwrap();
}

#[test_case(0, "0 B"; "zero")]
#[test_case(1000, "1000 B"; "bytes")]
#[test_case(1536, "1.50 KB"; "kilobytes")]
#[test_case(3 << 20, "3.00 MB"; "megabytes")]
fn test_bytes_to_string(bytes: usize, expected: &str) {
    assert_eq!(bytes_to_string(bytes), expected);
}
