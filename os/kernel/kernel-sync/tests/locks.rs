use kernel_sync::{SpinMutex, SyncOnceCell, TicketMutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn spin_mutex_reports_name_and_state() {
    let m = SpinMutex::named("vm reserv", 7_u32);
    assert_eq!(m.name(), "vm reserv");
    assert!(!m.is_locked());

    let g = m.lock();
    assert!(m.is_locked());
    assert!(m.try_lock().is_none());
    assert_eq!(*g, 7);
    drop(g);

    assert!(!m.is_locked());
    let dbg = format!("{m:?}");
    assert!(dbg.contains("vm reserv"), "{dbg}");
}

#[test]
fn ticket_mutex_try_lock_fails_while_held() {
    let m = TicketMutex::named("vm phys free", Vec::<u64>::new());
    {
        let mut g = m.lock();
        g.push(1);
        assert!(m.is_locked());
        assert!(m.try_lock().is_none());
    }
    let g = m.try_lock().expect("released lock must be available");
    assert_eq!(g.as_slice(), &[1]);
}

#[test]
fn try_lock_skips_busy_entries() {
    // a reclaimer walks a list of locks and takes the first free one
    let locks: Vec<SpinMutex<usize>> = (0..4).map(SpinMutex::new).collect();
    let held0 = locks[0].lock();
    let held1 = locks[1].lock();

    let taken = locks.iter().find_map(SpinMutex::try_lock).map(|g| *g);
    assert_eq!(taken, Some(2));

    drop(held1);
    drop(held0);
}

#[test]
fn mutex_get_mut_and_into_inner() {
    let mut m = TicketMutex::named("vm object memq", vec![1_u64, 2]);
    m.get_mut().push(3);
    let len = m.with_lock(|v| {
        v.push(4);
        v.len()
    });
    assert_eq!(len, 4);
    assert!(!m.is_locked());
    assert_eq!(m.into_inner(), vec![1, 2, 3, 4]);
}

#[test]
fn spin_mutex_is_released_on_panic() {
    let m = SpinMutex::new(0_u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let mut g = m.lock();
        *g = 123;
        panic!("boom");
    }));
    assert!(res.is_err(), "expected panic");
    assert!(!m.is_locked());
    assert_eq!(*m.lock(), 123);
}

fn hammer<M: Send + Sync + 'static>(lock: Arc<M>, bump: fn(&M, &AtomicUsize)) -> usize {
    let threads = 8;
    let iters = 2_000;

    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    bump(&lock, &in_cs);
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
    threads * iters
}

fn exclusive_bump(v: &mut usize, in_cs: &AtomicUsize) {
    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
    assert_eq!(prev, 0, "mutual exclusion violated");
    *v += 1;
    in_cs.fetch_sub(1, Ordering::SeqCst);
}

#[test]
fn contended_spin_mutex_is_exclusive() {
    let lock = Arc::new(SpinMutex::new(0_usize));
    let expected = hammer(Arc::clone(&lock), |m, c| exclusive_bump(&mut m.lock(), c));
    assert_eq!(*lock.lock(), expected);
}

#[test]
fn contended_ticket_mutex_is_exclusive() {
    let lock = Arc::new(TicketMutex::new(0_usize));
    let expected = hammer(Arc::clone(&lock), |m, c| exclusive_bump(&mut m.lock(), c));
    assert_eq!(*lock.lock(), expected);
}

#[test]
fn once_cell_set_only_once() {
    let cell = SyncOnceCell::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.set(String::from("first")), Ok(()));
    assert_eq!(cell.set(String::from("second")), Err(String::from("second")));
    assert_eq!(cell.get().map(String::as_str), Some("first"));
}

#[test]
fn once_cell_racing_writers_agree() {
    let cell = Arc::new(SyncOnceCell::new());
    let start = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4_usize)
        .map(|i| {
            let cell = Arc::clone(&cell);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                cell.set(i).is_ok()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&won| won)
        .count();
    assert_eq!(winners, 1);
    assert!(cell.get().is_some_and(|&v| v < 4));
}
