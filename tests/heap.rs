use poolheap::{
    CoalescingAllocator, CoalescingHeap, ConfigError, FreeBlock, FreeError, Heap, PoolAllocator,
    PoolHeap, RawAllocator, Scheduler, SizeClasses, DEFAULT_SIZE_CLASSES, MAX_SIZE_CLASSES,
};

use std::alloc::{GlobalAlloc, Layout};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A scheduler recording how the heap uses it.
#[derive(Default)]
struct Recorder {
    suspended: AtomicUsize,
    resumed: AtomicUsize,
    failures: AtomicUsize,
    last_failure: AtomicUsize,
    failed_while_suspended: AtomicBool,
}
impl Recorder {
    fn is_balanced(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) == self.resumed.load(Ordering::SeqCst)
    }
}
impl Scheduler for Recorder {
    fn suspend(&self) {
        self.suspended.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }

    fn allocation_failed(&self, size: usize) {
        if !self.is_balanced() {
            self.failed_while_suspended.store(true, Ordering::SeqCst);
        }
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.last_failure.store(size, Ordering::SeqCst);
    }
}

/// The size of a block with `payload` bytes, header included.
fn block_size_of(payload: usize) -> usize {
    poolheap::raw_allocator::block_size(payload).unwrap()
}

fn free_blocks<A: RawAllocator, S: Scheduler>(heap: &Heap<A, S>) -> Vec<FreeBlock> {
    let mut blocks = Vec::new();
    heap.dump_state(|block| blocks.push(block));
    blocks
}

#[test]
fn default_classes_serve_requests_up_to_the_largest_class() {
    let heap = PoolHeap::<2048>::new();
    assert!(heap.allocate(90).is_some());
    assert!(heap.allocate(1001).is_none());
    assert_eq!(heap.size_classes().as_slice(), &DEFAULT_SIZE_CLASSES);
}

#[test]
fn pointers_are_aligned_and_inside_the_arena() {
    let heap = PoolHeap::<4096>::new();
    let arena = heap.arena();
    for size in [1, 7, 99, 100, 333, 1000] {
        let ptr = heap.allocate(size).unwrap().as_ptr();
        assert_eq!(ptr as usize % poolheap::ALIGNMENT, 0);
        assert!(arena.contains(&ptr.cast_const()));
        assert!(ptr as usize + size <= arena.end as usize);
    }
}

#[test]
fn freed_blocks_are_reused_by_the_same_class() {
    let heap = PoolHeap::<2048>::new();
    let first = heap.allocate(100).unwrap();
    unsafe { heap.free(first.as_ptr()).unwrap() };
    let second = heap.allocate(100).unwrap();
    assert_eq!(first, second);
}

#[test]
fn live_allocations_survive_later_operations() {
    fn check<A: RawAllocator>(heap: &Heap<A>) {
        let live = heap.allocate(100).unwrap().as_ptr();
        unsafe { live.write_bytes(7, 100) };

        let other = heap.allocate(100).unwrap();
        unsafe { heap.free(other.as_ptr()).unwrap() };
        assert!(!free_blocks(heap).is_empty());

        let memory = unsafe { std::slice::from_raw_parts(live, 100) };
        assert!(memory.iter().all(|&byte| byte == 7));
        unsafe { heap.free(live).unwrap() };
    }

    check(&PoolHeap::<2048>::new());
    check(&CoalescingHeap::<2048>::new());
}

#[test]
fn global_alloc_blocks_stay_valid_while_the_heap_is_used() {
    let heap = CoalescingHeap::<4096>::new();
    let layout = Layout::new::<[u64; 4]>();
    let first = unsafe { heap.alloc(layout) }.cast::<[u64; 4]>();
    unsafe { first.write([1, 2, 3, 4]) };

    for _ in 0..8 {
        let other = unsafe { heap.alloc(layout) };
        assert!(!other.is_null());
        unsafe { heap.dealloc(other, layout) };
    }
    assert_eq!(unsafe { first.read() }, [1, 2, 3, 4]);
    unsafe { heap.dealloc(first.cast(), layout) };
}

#[test]
fn memory_is_not_cleared() {
    let heap = PoolHeap::<2048>::new();
    let ptr = heap.allocate(100).unwrap().as_ptr();
    unsafe {
        ptr.write_bytes(0xab, 100);
        heap.free(ptr).unwrap();
    }

    let again = heap.allocate(80).unwrap().as_ptr();
    assert_eq!(again, ptr);
    let contents = unsafe { std::slice::from_raw_parts(again, 100) };
    assert!(contents.iter().all(|&byte| byte == 0xab));
}

#[test]
fn exhaustion_is_reported_without_corruption() {
    let heap = PoolHeap::<1024>::new();
    heap.initialize_pools(&[64]).unwrap();
    let block = block_size_of(64);

    let ptrs = std::iter::from_fn(|| heap.allocate(64)).collect::<Vec<_>>();
    assert_eq!(ptrs.len(), 1024 / block);
    assert!(heap.allocate(1).is_none());

    unsafe { heap.free(ptrs[3].as_ptr()).unwrap() };
    assert_eq!(heap.allocate(1), Some(ptrs[3]));
    assert!(heap.allocate(1).is_none());
}

#[test]
fn free_capacity_accounts_whole_blocks() {
    let heap = PoolHeap::<2048>::new();
    assert_eq!(heap.free_capacity_remaining(), 2048);

    let ptr = heap.allocate(120).unwrap();
    assert_eq!(heap.free_capacity_remaining(), 2048 - block_size_of(150));
    unsafe { heap.free(ptr.as_ptr()).unwrap() };
    assert_eq!(heap.free_capacity_remaining(), 2048);
}

#[test]
fn initializing_the_heap_is_idempotent() {
    let heap = PoolHeap::<2048>::new();
    heap.initialize_heap();
    let ptr = heap.allocate(100).unwrap();
    heap.initialize_heap();
    assert_eq!(heap.free_capacity_remaining(), 2048 - block_size_of(100));
    unsafe { heap.free(ptr.as_ptr()).unwrap() };
}

#[test]
fn size_classes_are_configured_once() {
    let heap = PoolHeap::<2048>::new();
    assert!(heap.size_classes().is_empty());
    let classes = SizeClasses::try_from(&[32, 64, 128][..]).unwrap();
    assert_eq!(heap.initialize_pools(classes.as_slice()), Ok(()));
    assert_eq!(
        heap.initialize_pools(&[256]),
        Err(ConfigError::AlreadyConfigured)
    );
    assert_eq!(heap.size_classes(), classes);

    assert_eq!(heap.allocate(128).map(|_| ()), Some(()));
    assert!(heap.allocate(129).is_none());
}

#[test]
fn invalid_tables_are_rejected_and_leave_the_heap_unconfigured() {
    let heap = PoolHeap::<2048>::new();
    assert_eq!(heap.initialize_pools(&[]), Err(ConfigError::Empty));
    assert_eq!(
        heap.initialize_pools(&[64, 32]),
        Err(ConfigError::NotAscending { index: 1 })
    );
    assert_eq!(
        heap.initialize_pools(&[0, 32]),
        Err(ConfigError::ZeroSized { index: 0 })
    );
    assert_eq!(
        SizeClasses::try_from(&[16; MAX_SIZE_CLASSES + 1][..]),
        Err(ConfigError::TooManyClasses {
            count: MAX_SIZE_CLASSES + 1,
            max: MAX_SIZE_CLASSES
        })
    );
    assert!(heap.size_classes().is_empty());

    assert_eq!(heap.initialize_pools(&[32, 64]), Ok(()));
}

#[test]
fn failures_call_the_hook_after_resuming() {
    let heap = Heap::with_scheduler(PoolAllocator::<2048>::new(), Recorder::default());
    assert!(heap.allocate(5000).is_none());

    let scheduler = heap.scheduler();
    assert_eq!(scheduler.failures.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.last_failure.load(Ordering::SeqCst), 5000);
    assert!(!scheduler.failed_while_suspended.load(Ordering::SeqCst));
    assert!(scheduler.is_balanced());
}

#[test]
fn zero_sized_requests_fail() {
    let heap = Heap::with_scheduler(PoolAllocator::<2048>::new(), Recorder::default());
    assert!(heap.allocate(0).is_none());
    assert_eq!(heap.scheduler().failures.load(Ordering::SeqCst), 1);
    assert_eq!(heap.scheduler().last_failure.load(Ordering::SeqCst), 0);
    assert_eq!(heap.free_capacity_remaining(), 2048);
}

#[test]
fn every_operation_is_a_critical_section() {
    let heap = Heap::with_scheduler(CoalescingAllocator::<2048>::new(), Recorder::default());
    let ptr = heap.allocate(64).unwrap();
    let _ = heap.free_capacity_remaining();
    heap.dump_state(|_| {});
    unsafe { heap.free(ptr.as_ptr()).unwrap() };
    let _ = heap.arena();

    let scheduler = heap.scheduler();
    assert_eq!(scheduler.suspended.load(Ordering::SeqCst), 5);
    assert!(scheduler.is_balanced());
    assert_eq!(scheduler.failures.load(Ordering::SeqCst), 0);
}

#[test]
fn freeing_null_is_a_no_op() {
    let heap = Heap::with_scheduler(PoolAllocator::<2048>::new(), Recorder::default());
    assert_eq!(unsafe { heap.free(std::ptr::null_mut()) }, Ok(()));
    assert_eq!(heap.scheduler().suspended.load(Ordering::SeqCst), 0);
}

#[test]
fn invalid_frees_are_reported() {
    let pool = PoolHeap::<2048>::new();
    let coalescing = CoalescingHeap::<2048>::new();
    let mut foreign = [0_u64; 4];
    let foreign = foreign.as_mut_ptr().cast::<u8>();

    let ptr = pool.allocate(100).unwrap().as_ptr();
    unsafe {
        assert_eq!(pool.free(foreign), Err(FreeError::AllocationNotFound));
        assert_eq!(pool.free(ptr), Ok(()));
        assert_eq!(pool.free(ptr), Err(FreeError::DoubleFreeDetected));
    }

    let ptr = coalescing.allocate(100).unwrap().as_ptr();
    let _guard = coalescing.allocate(100).unwrap();
    unsafe {
        assert_eq!(coalescing.free(foreign), Err(FreeError::AllocationNotFound));
        assert_eq!(coalescing.free(ptr), Ok(()));
        assert_eq!(coalescing.free(ptr), Err(FreeError::DoubleFreeDetected));
    }
}

#[test]
fn pool_state_lists_free_blocks_per_class() {
    let heap = PoolHeap::<2048>::new();
    assert!(free_blocks(&heap).is_empty());

    let small = heap.allocate(50).unwrap();
    let large = heap.allocate(450).unwrap();
    unsafe {
        heap.free(small.as_ptr()).unwrap();
        heap.free(large.as_ptr()).unwrap();
    }

    let blocks = free_blocks(&heap);
    assert_eq!(blocks.len(), 2);
    assert_eq!(
        (blocks[0].class, blocks[0].size),
        (Some(0), block_size_of(100))
    );
    assert_eq!(
        (blocks[1].class, blocks[1].size),
        (Some(7), block_size_of(450))
    );
    assert_eq!(blocks[0].offset, 0);
    assert_eq!(blocks[1].offset, block_size_of(100));
}

#[test]
fn coalescing_restores_a_single_block() {
    let heap = CoalescingHeap::<4096>::new();
    let sizes = [24, 300, 8, 1000, 64, 64];
    let ptrs = sizes.map(|size| heap.allocate(size).unwrap());
    assert!(heap.free_capacity_remaining() < 4096);

    for index in [1, 4, 0, 5, 3, 2] {
        unsafe { heap.free(ptrs[index].as_ptr()).unwrap() };
    }
    assert_eq!(
        free_blocks(&heap),
        [FreeBlock {
            offset: 0,
            size: 4096,
            class: None
        }]
    );
    assert_eq!(heap.free_capacity_remaining(), 4096);
}

#[test]
fn coalescing_state_is_ordered_by_size() {
    let heap = CoalescingHeap::<4096>::new();
    let sizes = [512, 8, 32, 8, 128, 8];
    let ptrs = sizes.map(|size| heap.allocate(size).unwrap());
    for index in [0, 2, 4] {
        unsafe { heap.free(ptrs[index].as_ptr()).unwrap() };
    }

    let sizes = free_blocks(&heap)
        .iter()
        .map(|block| block.size)
        .collect::<Vec<_>>();
    assert_eq!(sizes.len(), 4);
    assert!(sizes.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn over_aligned_layouts_are_supported() {
    let heap = CoalescingHeap::<4096>::new();
    for align in [16, 64, 128, 512] {
        let layout = Layout::from_size_align(100, align).unwrap();
        let ptr = unsafe { heap.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % align, 0);
        unsafe {
            ptr.write_bytes(0x5a, 100);
            heap.dealloc(ptr, layout);
        }
    }
    assert_eq!(heap.free_capacity_remaining(), 4096);
}

#[test]
fn global_alloc_reports_exhaustion_as_null() {
    let heap = PoolHeap::<2048>::new();
    let layout = Layout::from_size_align(2000, 8).unwrap();
    assert!(unsafe { heap.alloc(layout) }.is_null());

    let layout = Layout::from_size_align(900, 256).unwrap();
    assert!(unsafe { heap.alloc(layout) }.is_null());
}
