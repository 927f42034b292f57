mod heap;

pub use heap::{Heap, HeapSettings, HEAP_ALIGN};

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;

    fn test_settings() -> HeapSettings {
        HeapSettings {
            heap_size: 64 * 1024,
        }
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut heap = Heap::new(test_settings());
        let layout = Layout::from_size_align(24, 8).unwrap();
        let a = heap.allocate(layout).as_ptr() as usize;
        let b = heap.allocate(layout).as_ptr() as usize;
        assert_eq!(a % 8, 0);
        assert_eq!(b % 8, 0);
        assert!(b >= a + 24);
    }

    #[test]
    fn bump_pointer_is_monotonic() {
        let mut heap = Heap::new(test_settings());
        let mut last = 0usize;
        for size in [1usize, 7, 16, 64, 8] {
            let layout = Layout::from_size_align(size, 8).unwrap();
            let p = heap.allocate(layout).as_ptr() as usize;
            assert!(p >= last);
            last = p + size;
        }
        assert!(heap.bytes_allocated() >= 1 + 7 + 16 + 64 + 8);
    }

    #[test]
    fn contains_covers_allocations() {
        let mut heap = Heap::new(test_settings());
        let layout = Layout::from_size_align(32, 16).unwrap();
        let p = heap.allocate(layout).as_ptr();
        assert!(heap.contains(p));
        assert!(!heap.contains(core::ptr::null()));
    }

    #[test]
    #[should_panic(expected = "value heap exhausted")]
    fn exhaustion_panics() {
        let mut heap = Heap::new(HeapSettings { heap_size: 1024 });
        let layout = Layout::from_size_align(512, 8).unwrap();
        heap.allocate(layout);
        heap.allocate(layout);
        heap.allocate(layout);
    }
}
