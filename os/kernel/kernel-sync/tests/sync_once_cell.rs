use kernel_sync::SyncOnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn empty_until_set() {
    let cell = SyncOnceCell::<u32>::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.set(7), Ok(&7));
    assert_eq!(cell.get(), Some(&7));
}

#[test]
fn set_only_succeeds_once() {
    let cell = SyncOnceCell::new();
    let first = cell.set(String::from("first"));
    assert_eq!(first.map(String::as_str), Ok("first"));
    let second = cell.set(String::from("second"));
    assert_eq!(second, Err(String::from("second")));
    assert_eq!(cell.get().map(String::as_str), Some("first"));
}

#[test]
fn concurrent_set_has_one_winner() {
    let threads = 8;
    let cell = Arc::new(SyncOnceCell::new());
    let wins = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let cell = Arc::clone(&cell);
            let wins = Arc::clone(&wins);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                if cell.set(i).is_ok() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert!(cell.get().is_some_and(|&v| v < threads));
}

#[test]
fn value_is_dropped_with_the_cell() {
    let marker = Arc::new(());
    {
        let cell = SyncOnceCell::new();
        assert!(cell.set(Arc::clone(&marker)).is_ok());
        assert_eq!(Arc::strong_count(&marker), 2);
    }
    assert_eq!(Arc::strong_count(&marker), 1);
}

#[test]
fn rejected_value_is_handed_back() {
    let marker = Arc::new(());
    let cell = SyncOnceCell::new();
    assert!(cell.set(Arc::clone(&marker)).is_ok());

    let back = cell.set(Arc::clone(&marker)).unwrap_err();
    assert_eq!(Arc::strong_count(&marker), 3);
    drop(back);
    assert_eq!(Arc::strong_count(&marker), 2);
}
