//! Drives a reservation manager from several threads and prints its
//! counters and queues.
//!
//! Usage: `reserv-sim [threads] [iterations] [domains]`. The log level is
//! read from `RESERV_SIM_LOG` (default `info`).

mod logger;

use kernel_memory_addresses::PageFrame;
use kernel_phys::{AllocRequest, BitmapPhysAlloc, DomainId, PhysAllocator, PhysSegment};
use kernel_reserv::{
    AnonymousGrows, ArrayMode, ContigRequest, ObjectKind, ReservConfig, ReservError,
    ReservManager, VmObject,
};
use log::{LevelFilter, info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use logger::StderrLogger;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{env, io, thread};

const DOMAIN_BYTES: u64 = 32 << 20;
const OBJECT_PAGES: u64 = 4096;

struct Args {
    threads: u64,
    iterations: usize,
    domains: u8,
}

impl Args {
    fn parse() -> io::Result<Self> {
        // args: [threads] [iterations] [domains]
        let mut args = env::args().skip(1);
        let mut next = |default: u64| -> io::Result<u64> {
            args.next().map_or(Ok(default), |s| {
                s.parse()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{s}: {e}")))
            })
        };
        let threads = next(4)?.max(1);
        let iterations = usize::try_from(next(20_000)?).unwrap_or(usize::MAX);
        let domains = u8::try_from(next(1)?.clamp(1, 8)).unwrap_or(1);
        Ok(Self {
            threads,
            iterations,
            domains,
        })
    }
}

struct Sim {
    m: ReservManager,
    phys: Arc<BitmapPhysAlloc>,
}

impl Sim {
    fn new(domains: u8) -> io::Result<Self> {
        // leave the first 2 MiB unmanaged, like low memory on a PC
        let segments: Vec<_> = (0..domains)
            .map(|d| {
                let start = (2 << 20) + u64::from(d) * DOMAIN_BYTES;
                PhysSegment::new(start, start + DOMAIN_BYTES, DomainId::new(d))
            })
            .collect();
        let phys = Arc::new(BitmapPhysAlloc::new(&segments).map_err(io::Error::other)?);
        let m = ReservManager::new(
            ReservConfig::default(),
            &segments,
            ArrayMode::Dense,
            phys.clone(),
            Box::new(AnonymousGrows),
        )
        .map_err(io::Error::other)?;
        Ok(Self { m, phys })
    }

    fn free(&self, domain: DomainId, frame: PageFrame) {
        if !self.m.free_page(frame) {
            self.phys.free_contig(frame, 1);
            self.phys.release_budget(domain, 1);
        }
    }

    fn worker(&self, seed: u64, domain: DomainId, iterations: usize) -> Arc<VmObject> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let object = VmObject::new(ObjectKind::Anonymous, OBJECT_PAGES);
        for _ in 0..iterations {
            let pindex = rng.gen_range(0..OBJECT_PAGES);
            if let Some(frame) = object.remove_page(pindex) {
                self.free(domain, frame);
                continue;
            }

            let mpred = object.predecessor(pindex);
            if rng.gen_ratio(1, 64) {
                let contig = ContigRequest::new(rng.gen_range(1..=16));
                let succ = object.successor(mpred.map(|p| p.pindex));
                if succ.is_some_and(|s| s.pindex < pindex + contig.npages) {
                    continue;
                }
                let request = AllocRequest::normal();
                match self
                    .m
                    .alloc_contig(&object, pindex, domain, request, mpred, &contig)
                {
                    Ok(frame) => {
                        for i in 0..contig.npages {
                            object.insert_page(pindex + i, frame.nth(i));
                        }
                    }
                    Err(ReservError::Exhausted) => {
                        self.m.reclaim_contig(domain, &contig);
                    }
                    Err(_) => {}
                }
                continue;
            }

            match self
                .m
                .alloc_page(&object, pindex, domain, AllocRequest::normal(), mpred)
            {
                Ok(frame) => {
                    object.insert_page(pindex, frame);
                }
                Err(ReservError::Exhausted) => {
                    self.m.reclaim_inactive(domain);
                }
                Err(_) => {}
            }
        }
        object
    }
}

/// Threads are spread round-robin over the domains.
fn domain_of(thread: u64, domains: u8) -> DomainId {
    DomainId::new(u8::try_from(thread % u64::from(domains)).unwrap_or(0))
}

fn main() -> io::Result<()> {
    let level = env::var("RESERV_SIM_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LevelFilter::Info);
    StderrLogger::init(level).map_err(|e| io::Error::other(e.to_string()))?;

    let args = Args::parse()?;
    let sim = Sim::new(args.domains)?;
    let done = AtomicBool::new(false);

    info!(
        "{} threads x {} iterations over {} domains",
        args.threads, args.iterations, args.domains
    );

    let objects = thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::Relaxed) {
                sim.m.tick();
                thread::yield_now();
            }
        });

        let workers: Vec<_> = (0..args.threads)
            .map(|t| {
                let sim = &sim;
                let domain = domain_of(t, args.domains);
                let iterations = args.iterations;
                s.spawn(move || sim.worker(0x9E37_79B9_7F4A_7C15 ^ (t + 1), domain, iterations))
            })
            .collect();
        let objects: Vec<_> = workers
            .into_iter()
            .map(|w| w.join().map_err(|_| io::Error::other("worker panicked")))
            .collect();
        done.store(true, Ordering::Relaxed);
        objects.into_iter().collect::<io::Result<Vec<_>>>()
    })?;

    let audit = sim.m.audit();
    let counters = sim.m.stats();
    println!(
        "active {}, queued {}, full {} (fullpop {})",
        audit.active,
        audit.queued,
        audit.full,
        sim.m.fullpop()
    );
    println!(
        "broken {}, freed {}, reclaimed {}",
        counters.broken, counters.freed, counters.reclaimed
    );
    print!("{}", sim.m.partpopq());

    for (t, object) in (0_u64..).zip(&objects) {
        let domain = domain_of(t, args.domains);
        for page in object.pages() {
            object.remove_page(page.pindex);
            sim.free(domain, page.frame);
        }
    }

    let leaked = sim.m.audit().active;
    if leaked != 0 {
        warn!("{leaked} reservations still active after teardown");
    }
    for d in 0..args.domains {
        let domain = DomainId::new(d);
        info!(
            "domain {domain}: {} free frames, budget {}",
            sim.phys.free_frames(domain),
            sim.phys.budget(domain)
        );
    }
    Ok(())
}
