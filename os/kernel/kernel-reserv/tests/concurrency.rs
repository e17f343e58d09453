mod common;

use common::{D0, Fixture};
use kernel_phys::AllocRequest;
use kernel_reserv::{ContigRequest, ObjectKind, VmObject};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

const THREADS: u64 = 4;
const ITERATIONS: usize = 4000;
const OBJECT_PAGES: u64 = 2048;

#[test]
fn allocators_and_reclaimers_agree() {
    let f = Fixture::default_mb(32);
    let total = f.phys.free_frames(D0);
    let budget = f.phys.budget(D0);
    let live = Mutex::new(HashSet::new());
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            let contig = ContigRequest::new(32).with_alignment(128 * 1024);
            while !done.load(Ordering::Relaxed) {
                f.m.tick();
                if !f.m.reclaim_contig(D0, &contig) {
                    f.m.reclaim_inactive(D0);
                }
                std::thread::yield_now();
            }
        });

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let (f, live) = (&f, &live);
                s.spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(t);
                    let object = VmObject::new(ObjectKind::Anonymous, OBJECT_PAGES);
                    for _ in 0..ITERATIONS {
                        let pindex = rng.gen_range(0..OBJECT_PAGES);
                        if object.lookup(pindex).is_some() {
                            let frame = object.remove_page(pindex).unwrap();
                            assert!(live.lock().unwrap().remove(&frame));
                            common::free_frame(&f.m, f.phys.as_ref(), frame);
                            continue;
                        }
                        let mpred = object.predecessor(pindex);
                        if let Ok(frame) =
                            f.m.alloc_page(&object, pindex, D0, AllocRequest::normal(), mpred)
                        {
                            assert!(live.lock().unwrap().insert(frame), "{frame} in use");
                            assert!(object.insert_page(pindex, frame));
                        }
                    }
                    object
                })
            })
            .collect();

        let objects: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        done.store(true, Ordering::Relaxed);
        for object in &objects {
            for page in object.pages() {
                assert!(live.lock().unwrap().remove(&page.frame));
            }
            f.free_object(object);
        }
    });

    assert!(live.lock().unwrap().is_empty());

    let report = f.m.audit();
    assert_eq!(report.active, 0);
    assert_eq!(f.phys.free_frames(D0), total);
    assert_eq!(f.phys.budget(D0), budget);
}
