//! Demand paging, eviction, and teardown scenarios.

use keel::{
    addressing::{Va, PAGE_SIZE},
    fs::{Disk, ExtentFile, Hook, MemDisk, Sector},
    mm::pager::{AddressSpace, PageStatus},
    KernelBuilder, KernelError,
};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

// An anonymous page materializes zero-filled on first touch.
#[test]
fn zero_fill_on_first_fault() {
    let kernel = KernelBuilder::new().build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let space = AddressSpace::new(&kernel);
            let va = Va::new(0x0804_0000);
            space.install_anonymous(va);
            assert_eq!(space.page_status(va), Some(PageStatus::Uninitialized));
            let mut byte = [0xffu8];
            space.read_user(va + 17, &mut byte).unwrap();
            assert_eq!(byte[0], 0);
            assert_eq!(space.page_status(va), Some(PageStatus::Loaded));
        }
    });
}

// A segment covering a 5,000-byte file loads its tail page with the
// file prefix and zeroes the remainder.
#[test]
fn segment_tail_is_zero_filled() {
    let kernel = KernelBuilder::new().build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let contents = pattern(3, 5000);
            let file = ExtentFile::create(kernel.cache.clone(), Sector(200), 16);
            assert_eq!(file.write_at(&contents, 0).unwrap(), 5000);

            let space = AddressSpace::new(&kernel);
            let va = Va::new(0x0805_0000);
            space.install_segment(&file, 0, 4096 + 904, 192, true, va);
            assert_eq!(space.installed_pages(), 2);

            let mut view = vec![0u8; 2 * PAGE_SIZE];
            space.read_user(va, &mut view).unwrap();
            assert_eq!(&view[..5000], &contents[..]);
            assert!(view[5000..].iter().all(|&b| b == 0));
        }
    });
}

// With two user frames, three dirty anonymous pages survive the
// eviction churn: swap-in restores exactly what was written.
#[test]
fn eviction_round_trip_through_swap() {
    let kernel = KernelBuilder::new().user_frames(2).build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let space = AddressSpace::new(&kernel);
            let vas = [
                Va::new(0x0804_0000),
                Va::new(0x0804_1000),
                Va::new(0x0804_2000),
            ];
            let patterns = [
                pattern(0xa1, PAGE_SIZE),
                pattern(0xb2, PAGE_SIZE),
                pattern(0xc3, PAGE_SIZE),
            ];
            for (va, data) in vas.iter().zip(patterns.iter()) {
                space.install_anonymous(*va);
                space.write_user(*va, data).unwrap();
            }
            // Two frames, three pages: at least one page is out on swap.
            let evicted: Vec<_> = vas
                .iter()
                .filter(|va| space.page_status(**va) == Some(PageStatus::Evicted))
                .collect();
            assert_eq!(evicted.len(), 1);
            // The evicted page owns a busy swap slot.
            let slot = space.swap_slot_of(*evicted[0]).unwrap();
            assert!(kernel.swap.slot_in_use(slot));

            for (va, data) in vas.iter().zip(patterns.iter()) {
                let mut back = vec![0u8; PAGE_SIZE];
                space.read_user(*va, &mut back).unwrap();
                assert_eq!(&back, data);
            }
        }
    });
}

// A read-only file mapping is discarded on eviction; the file device
// never sees a write, and reloads read the original data.
#[test]
fn read_only_mapping_is_never_written_back() {
    let fs_dev = MemDisk::new(2048);
    let writes = Arc::new(AtomicUsize::new(0));
    let armed = Arc::new(AtomicBool::new(false));
    let hook: Hook = {
        let writes = writes.clone();
        let armed = armed.clone();
        Arc::new(move |sector: Sector, _buf: &[u8; 512], is_write: bool| {
            if is_write && armed.load(Ordering::SeqCst) && (100..108).contains(&sector.into_usize())
            {
                writes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    };
    let kernel = KernelBuilder::new()
        .user_frames(1)
        .fs_disk(Disk::new(fs_dev).hook(hook))
        .build();
    kernel.launch({
        let kernel = kernel.clone();
        let armed = armed.clone();
        let writes = writes.clone();
        move || {
            let contents = pattern(9, PAGE_SIZE);
            let file = ExtentFile::create(kernel.cache.clone(), Sector(100), 8);
            file.write_at(&contents, 0).unwrap();
            kernel.cache.flush().unwrap();
            armed.store(true, Ordering::SeqCst);

            let space = AddressSpace::new(&kernel);
            let (map_va, anon_va) = (Va::new(0x0806_0000), Va::new(0x0807_0000));
            space.install_file_mapping(&file, false, map_va);
            space.install_anonymous(anon_va);

            let mut view = vec![0u8; PAGE_SIZE];
            space.read_user(map_va, &mut view).unwrap();
            assert_eq!(view, contents);
            // One frame: touching the anonymous page throws the mapping
            // out; reading the mapping back throws the anonymous page out.
            space.write_user(anon_va, &[1]).unwrap();
            assert_eq!(space.page_status(map_va), Some(PageStatus::Evicted));
            space.read_user(map_va, &mut view).unwrap();
            assert_eq!(view, contents);

            assert_eq!(writes.load(Ordering::SeqCst), 0);
            armed.store(false, Ordering::SeqCst);
        }
    });
}

// A dirty writable mapping is written back on eviction, and
// the page restores to exactly what was written.
#[test]
fn writable_mapping_writes_back_on_eviction() {
    let kernel = KernelBuilder::new().user_frames(1).build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let original = pattern(0x11, PAGE_SIZE);
            let file = ExtentFile::create(kernel.cache.clone(), Sector(300), 8);
            file.write_at(&original, 0).unwrap();

            let space = AddressSpace::new(&kernel);
            let (map_va, anon_va) = (Va::new(0x0806_0000), Va::new(0x0807_0000));
            space.install_file_mapping(&file, true, map_va);
            space.install_anonymous(anon_va);

            let update = pattern(0x77, PAGE_SIZE);
            space.write_user(map_va, &update).unwrap();
            space.write_user(anon_va, &[1]).unwrap(); // force eviction
            assert_eq!(space.page_status(map_va), Some(PageStatus::Evicted));

            let mut on_file = vec![0u8; PAGE_SIZE];
            assert_eq!(file.read_at(&mut on_file, 0).unwrap(), PAGE_SIZE);
            assert_eq!(on_file, update);

            let mut back = vec![0u8; PAGE_SIZE];
            space.read_user(map_va, &mut back).unwrap();
            assert_eq!(back, update);
        }
    });
}

// A read-only mapping stays bit-identical across load/evict
// cycles, and refuses user writes.
#[test]
fn read_only_mapping_is_stable_across_cycles() {
    let kernel = KernelBuilder::new().user_frames(1).build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let contents = pattern(0x2f, PAGE_SIZE);
            let file = ExtentFile::create(kernel.cache.clone(), Sector(400), 8);
            file.write_at(&contents, 0).unwrap();

            let space = AddressSpace::new(&kernel);
            let (map_va, anon_va) = (Va::new(0x0806_0000), Va::new(0x0807_0000));
            space.install_file_mapping(&file, false, map_va);
            space.install_anonymous(anon_va);

            assert_eq!(
                space.write_user(map_va, &[0]),
                Err(KernelError::InvalidAccess)
            );
            for _ in 0..3 {
                let mut view = vec![0u8; PAGE_SIZE];
                space.read_user(map_va, &mut view).unwrap();
                assert_eq!(view, contents);
                space.write_user(anon_va, &[1]).unwrap(); // evict the mapping
            }
        }
    });
}

// Unmapping a file and mapping it again at the same address
// reproduces the same view, including earlier writes.
#[test]
fn remap_after_uninstall_reproduces_the_view() {
    let kernel = KernelBuilder::new().build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let contents = pattern(0x41, 5000);
            let file = ExtentFile::create(kernel.cache.clone(), Sector(500), 16);
            file.write_at(&contents, 0).unwrap();

            let space = AddressSpace::new(&kernel);
            let va = Va::new(0x0808_0000);
            space.install_file_mapping(&file, true, va);
            assert_eq!(space.installed_pages(), 2);
            space.write_user(va, b"edited").unwrap();
            space.uninstall_file(va);
            assert_eq!(space.installed_pages(), 0);
            assert_eq!(space.page_table.mapped_pages(), 0);

            space.install_file_mapping(&file, true, va);
            let mut view = vec![0u8; 5000];
            space.read_user(va, &mut view).unwrap();
            assert_eq!(&view[..6], b"edited");
            assert_eq!(&view[6..], &contents[6..]);
        }
    });
}

// Swap exhaustion dies inside the reservation, not later.
#[test]
#[should_panic(expected = "out of swap")]
fn swap_exhaustion_panics_at_reservation() {
    let kernel = KernelBuilder::new()
        .user_frames(1)
        .swap_disk(Disk::new(MemDisk::new(8))) // exactly one slot
        .build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let space = AddressSpace::new(&kernel);
            let (a, b) = (Va::new(0x0804_0000), Va::new(0x0804_1000));
            space.install_anonymous(a);
            space.install_anonymous(b);
            space.write_user(a, &[1]).unwrap();
            space.write_user(b, &[2]).unwrap(); // evicts a into the only slot
            space.read_user(a, &mut [0]).unwrap(); // evicting b has no slot left
        }
    });
}

// A pinned frame is never chosen for eviction.
#[test]
fn eviction_skips_pinned_frames() {
    let kernel = KernelBuilder::new().user_frames(2).build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let space = AddressSpace::new(&kernel);
            let (a, b, c) = (
                Va::new(0x0804_0000),
                Va::new(0x0804_1000),
                Va::new(0x0804_2000),
            );
            for va in [a, b, c] {
                space.install_anonymous(va);
            }
            space.write_user(a, &[0xaa]).unwrap();
            space.write_user(b, &[0xbb]).unwrap();
            let pa_a = space.page_table.translate(a).unwrap().pa;
            kernel.frames.pin(pa_a);
            space.write_user(c, &[0xcc]).unwrap();
            assert_eq!(space.page_status(a), Some(PageStatus::Loaded));
            assert_eq!(space.page_status(b), Some(PageStatus::Evicted));
            kernel.frames.unpin(pa_a);
        }
    });
}

// A recently accessed frame gets its second chance; the stale one goes.
#[test]
fn second_chance_reprieves_accessed_frames() {
    let kernel = KernelBuilder::new().user_frames(2).build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let space = AddressSpace::new(&kernel);
            let (a, b, c) = (
                Va::new(0x0804_0000),
                Va::new(0x0804_1000),
                Va::new(0x0804_2000),
            );
            for va in [a, b, c] {
                space.install_anonymous(va);
            }
            space.write_user(a, &[0xaa]).unwrap();
            space.write_user(b, &[0xbb]).unwrap();
            // Drop b's accessed bit; a keeps its reference.
            space.page_table.set_accessed(b, false);
            space.write_user(c, &[0xcc]).unwrap();
            assert_eq!(space.page_status(a), Some(PageStatus::Loaded));
            assert_eq!(space.page_status(b), Some(PageStatus::Evicted));
        }
    });
}

// Every loaded entry is backed by exactly the frame that
// names it back.
#[test]
fn loaded_entries_and_frames_are_a_bijection() {
    let kernel = KernelBuilder::new().user_frames(4).build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let space = AddressSpace::new(&kernel);
            let vas: Vec<Va> = (0..3).map(|i| Va::new(0x0804_0000 + i * PAGE_SIZE)).collect();
            for va in &vas {
                space.install_anonymous(*va);
                space.write_user(*va, &[1]).unwrap();
            }
            for va in &vas {
                let pte = space.page_table.translate(*va).unwrap();
                assert_eq!(kernel.frames.mapping_of(pte.pa), Some(*va));
            }
            assert_eq!(kernel.frames.free_frames(), 1);
        }
    });
}

// Teardown releases every frame and swap slot and persists dirty
// writable file pages.
#[test]
fn teardown_releases_all_resources() {
    let kernel = KernelBuilder::new().user_frames(2).build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let total_frames = kernel.frames.user_frames();
            let total_slots = kernel.swap.free_slots();
            let file = ExtentFile::create(kernel.cache.clone(), Sector(600), 8);
            file.write_at(&pattern(0x5a, PAGE_SIZE), 0).unwrap();

            {
                let space = AddressSpace::new(&kernel);
                let (a, b, m) = (
                    Va::new(0x0804_0000),
                    Va::new(0x0804_1000),
                    Va::new(0x0809_0000),
                );
                space.install_anonymous(a);
                space.install_anonymous(b);
                space.install_file_mapping(&file, true, m);
                space.write_user(a, &[1]).unwrap();
                space.write_user(b, &[2]).unwrap();
                space.write_user(m, b"persisted").unwrap(); // evicts one anon page
                drop(space);
            }
            assert_eq!(kernel.frames.free_frames(), total_frames);
            assert_eq!(kernel.swap.free_slots(), total_slots);
            let mut head = [0u8; 9];
            file.read_at(&mut head, 0).unwrap();
            assert_eq!(&head, b"persisted");
        }
    });
}

// Anonymous teardown frees swap residency without writing anything new.
#[test]
fn uninstall_anonymous_discards_residency() {
    let kernel = KernelBuilder::new().user_frames(1).build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let total_slots = kernel.swap.free_slots();
            let space = AddressSpace::new(&kernel);
            let (a, b) = (Va::new(0x0804_0000), Va::new(0x0804_1000));
            space.install_anonymous(a);
            space.install_anonymous(b);
            space.write_user(a, &[1]).unwrap();
            space.write_user(b, &[2]).unwrap(); // a goes to swap
            assert_eq!(kernel.swap.free_slots(), total_slots - 1);

            space.uninstall_anonymous(a); // discards the slot unread
            assert_eq!(kernel.swap.free_slots(), total_slots);
            space.uninstall_anonymous(b); // frees the frame, no swap write
            assert_eq!(kernel.swap.free_slots(), total_slots);
            assert_eq!(kernel.frames.free_frames(), 1);
            assert_eq!(space.installed_pages(), 0);
        }
    });
}

// A fault on an address with no supplemental entry is the caller's
// problem, reported not panicked.
#[test]
fn fault_on_unmapped_address_reports_bad_address() {
    let kernel = KernelBuilder::new().build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let space = AddressSpace::new(&kernel);
            assert_eq!(
                space.handle_fault(Va::new(0x0804_0123)),
                Err(KernelError::BadAddress)
            );
            assert_eq!(
                space.read_user(Va::new(0x0804_0000), &mut [0]),
                Err(KernelError::BadAddress)
            );
        }
    });
}

// The initial-stack path makes the page resident before any fault.
#[test]
fn install_and_load_is_eagerly_resident() {
    let kernel = KernelBuilder::new().build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let space = AddressSpace::new(&kernel);
            let va = Va::new(0x0810_0000);
            space.install_and_load_anonymous(va);
            assert_eq!(space.page_status(va), Some(PageStatus::Loaded));
            assert!(space.page_table.translate(va).is_some());
            let mut byte = [0xffu8];
            space.read_user(va, &mut byte).unwrap();
            assert_eq!(byte[0], 0);
        }
    });
}

// A fault on a page the MMU already maps cannot happen; dispatching one
// is an invariant violation.
#[test]
#[should_panic(expected = "fault on loaded page")]
fn fault_on_loaded_page_panics() {
    let kernel = KernelBuilder::new().build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let space = AddressSpace::new(&kernel);
            let va = Va::new(0x0804_0000);
            space.install_anonymous(va);
            space.handle_fault(va).unwrap();
            space.handle_fault(va).unwrap();
        }
    });
}

// `handle_fault` rounds the faulting address down to its page.
#[test]
fn handle_fault_rounds_to_page() {
    let kernel = KernelBuilder::new().build();
    kernel.launch({
        let kernel = kernel.clone();
        move || {
            let space = AddressSpace::new(&kernel);
            let va = Va::new(0x0804_0000);
            space.install_anonymous(va);
            space.handle_fault(va + 0x123).unwrap();
            assert_eq!(space.page_status(va), Some(PageStatus::Loaded));
        }
    });
}
