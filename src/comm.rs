//! In-process collective substrate — the rank team.
//!
//! The archiver is written in SPMD style: the same per-rank function runs
//! on every member of a fixed team of N peers, ranks 0..N-1, synchronized
//! only through the collective calls below (barrier, broadcast, exclusive
//! prefix scan, all-reduce, all-true) plus the chunk queue built on top in
//! `scheduler`.  Rank 0 is distinguished only for single-writer duties:
//! truncating the archive, creating the sidecar, the final zero trailer,
//! and progress printing.
//!
//! Ranks here are peer threads within one process.  The calling contract
//! is the classic SPMD one: every rank must issue the same collective
//! calls in the same order.  A rank that errors out of
//! a phase must still reach that phase's closing collective — the drivers
//! in `archive` fold local errors into an all-true checkpoint instead of
//! returning early.
//!
//! Mutex poisoning is treated as a peer-rank panic, which tears down the
//! run; `.unwrap()` on lock results is the substrate's abort path.

use std::any::Any;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

// ── Team handle ──────────────────────────────────────────────────────────────

/// One rank's handle onto the team.  Clones share the same team state.
#[derive(Clone)]
pub struct Comm {
    rank:   usize,
    shared: Arc<Shared>,
}

struct Shared {
    ranks:   usize,
    barrier: Barrier,
    /// One u64 slot per rank for the numeric collectives.
    slots:   Mutex<Vec<u64>>,
    /// Single publication slot for broadcast / shared-object construction.
    blob:    Mutex<Option<Box<dyn Any + Send>>>,
}

impl Comm {
    /// Run `f` on a team of `ranks` peers and return the per-rank results
    /// in rank order.  With `ranks == 1` the function runs on the calling
    /// thread.
    pub fn launch<T, F>(ranks: usize, f: F) -> Vec<T>
    where
        F: Fn(Comm) -> T + Sync,
        T: Send,
    {
        assert!(ranks >= 1, "a team needs at least one rank");

        let shared = Arc::new(Shared {
            ranks,
            barrier: Barrier::new(ranks),
            slots:   Mutex::new(vec![0; ranks]),
            blob:    Mutex::new(None),
        });

        if ranks == 1 {
            return vec![f(Comm { rank: 0, shared })];
        }

        thread::scope(|scope| {
            let handles: Vec<_> = (0..ranks)
                .map(|rank| {
                    let comm = Comm { rank, shared: Arc::clone(&shared) };
                    let f = &f;
                    scope.spawn(move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("rank thread panicked"))
                .collect()
        })
    }

    #[inline] pub fn rank(&self)  -> usize { self.rank }
    #[inline] pub fn ranks(&self) -> usize { self.shared.ranks }
    #[inline] pub fn is_root(&self) -> bool { self.rank == 0 }

    /// Block until every rank has arrived.
    pub fn barrier(&self) {
        self.shared.barrier.wait();
    }

    // ── Numeric collectives ──────────────────────────────────────────────────
    //
    // Pattern shared by all of them: publish into the per-rank slot, wait
    // for everyone, compute from all slots, wait again so nobody's next
    // collective overwrites a slot that is still being read.

    fn collect<R>(&self, value: u64, compute: impl Fn(&[u64], usize) -> R) -> R {
        {
            let mut slots = self.shared.slots.lock().unwrap();
            slots[self.rank] = value;
        }
        self.barrier();
        let result = {
            let slots = self.shared.slots.lock().unwrap();
            compute(&slots, self.rank)
        };
        self.barrier();
        result
    }

    /// Exclusive prefix sum: the sum of `value` over all ranks below this
    /// one.  Rank 0 receives 0.
    pub fn exscan_sum(&self, value: u64) -> u64 {
        self.collect(value, |slots, rank| slots[..rank].iter().sum())
    }

    /// Sum of `value` over all ranks; every rank receives the total.
    pub fn allreduce_sum(&self, value: u64) -> u64 {
        self.collect(value, |slots, _| slots.iter().sum())
    }

    /// True only if every rank contributed true.
    pub fn alltrue(&self, ok: bool) -> bool {
        self.collect(ok as u64, |slots, _| slots.iter().all(|&v| v != 0))
    }

    /// Every rank receives `root`'s value.
    pub fn broadcast_u64(&self, root: usize, value: u64) -> u64 {
        self.collect(value, |slots, _| slots[root])
    }

    // ── Object collectives ───────────────────────────────────────────────────

    /// Broadcast a clonable value from `root`.  Non-root ranks pass `None`.
    pub fn broadcast<T: Clone + Send + 'static>(&self, root: usize, value: Option<T>) -> T {
        if self.rank == root {
            let v = value.expect("broadcast root must supply a value");
            {
                let mut blob = self.shared.blob.lock().unwrap();
                *blob = Some(Box::new(v.clone()));
            }
            self.barrier();
            self.barrier();
            v
        } else {
            self.barrier();
            let v = {
                let blob = self.shared.blob.lock().unwrap();
                blob.as_ref()
                    .and_then(|b| b.downcast_ref::<T>())
                    .expect("broadcast type mismatch between ranks")
                    .clone()
            };
            self.barrier();
            v
        }
    }

    /// Construct one shared object on rank 0 and hand every rank an `Arc`
    /// to it.  This is how phase-scoped shared state (the chunk queue, the
    /// progress counters) reaches the team without process-wide statics.
    pub fn shared<T, F>(&self, build: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if self.rank == 0 {
            let v = Arc::new(build());
            {
                let mut blob = self.shared.blob.lock().unwrap();
                *blob = Some(Box::new(Arc::clone(&v)));
            }
            self.barrier();
            self.barrier();
            v
        } else {
            self.barrier();
            let v = {
                let blob = self.shared.blob.lock().unwrap();
                blob.as_ref()
                    .and_then(|b| b.downcast_ref::<Arc<T>>())
                    .expect("shared-object type mismatch between ranks")
                    .clone()
            };
            self.barrier();
            v
        }
    }
}
