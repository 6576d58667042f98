use kvlock::mdl::{MdlDuration, MdlRequest, MdlType, SessionOwner};
use kvlock::options::{LockManagerOptions, MdlOptions};
use kvlock::transactions::lock::key_range::KeyRange;
use kvlock::transactions::lock::RowLockType;
use kvlock::{MdlService, RangeLockManager};
use procfs::CpuInfo;
use rand::distributions::Uniform;
use rand::Rng;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const NUM_TXNS: u64 = 200000;
const KEYS_PER_TXN: usize = 4;
const KEY_SPACE: u64 = 100000;
const NUM_THREADS: usize = 8;
const LOCK_TIMEOUT: Duration = Duration::from_millis(100);

fn print_environment() {
    println!("kvlock: version {}", env!("CARGO_PKG_VERSION"));

    let datetime = chrono::Utc::now();
    println!("Date: {:?}", datetime.naive_utc());

    let cpu_info = CpuInfo::new().unwrap();
    println!(
        "CPU: {} * {}",
        cpu_info.cpus.len(),
        cpu_info.fields.get("model name").unwrap()
    );
    println!("CPU Cache: {}", cpu_info.fields.get("cache size").unwrap());
}

fn print_arguments() {
    println!("Threads: {}", NUM_THREADS);
    println!("Transactions: {}", NUM_TXNS);
    println!("Keys: {} per transaction out of {}", KEYS_PER_TXN, KEY_SPACE);
}

fn key(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

struct BenchMark {
    pool: rayon::ThreadPool,
}

impl BenchMark {
    fn new() -> kvlock::Result<BenchMark> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(NUM_THREADS)
            .build()?;
        Ok(BenchMark { pool })
    }

    fn report(name: &str, ops: u64, start: Instant, aborted: u64) {
        let elapsed = start.elapsed().as_secs_f64();
        println!(
            "{}: {:.0} txns per second ({} aborted)",
            name,
            ops as f64 / elapsed,
            aborted
        );
    }

    fn point_locks(&self, ty: RowLockType) -> kvlock::Result<()> {
        let lm = RangeLockManager::new(LockManagerOptions {
            lock_timeout: LOCK_TIMEOUT,
            ..LockManagerOptions::default()
        })?;
        let aborted = AtomicU64::new(0);
        let start = Instant::now();
        self.pool.install(|| {
            (1..=NUM_TXNS).into_par_iter().for_each(|txn| {
                let mut keys: Vec<u64> = rand::thread_rng()
                    .sample_iter(Uniform::new(0, KEY_SPACE))
                    .take(KEYS_PER_TXN)
                    .collect();
                keys.sort_unstable();
                for k in keys {
                    let range = KeyRange::point(key(k));
                    if lm.acquire(txn, 1, &range, ty, LOCK_TIMEOUT).is_err() {
                        aborted.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
                lm.release_all(txn);
            })
        });
        Self::report(
            &format!("point_locks({:?})", ty),
            NUM_TXNS,
            start,
            aborted.load(Ordering::Relaxed),
        );
        Ok(())
    }

    fn range_locks(&self) -> kvlock::Result<()> {
        let lm = RangeLockManager::new(LockManagerOptions {
            lock_timeout: LOCK_TIMEOUT,
            ..LockManagerOptions::default()
        })?;
        let aborted = AtomicU64::new(0);
        let start = Instant::now();
        self.pool.install(|| {
            (1..=NUM_TXNS).into_par_iter().for_each(|txn| {
                let mut rng = rand::thread_rng();
                let low = rng.gen_range(0..KEY_SPACE);
                let high = low + rng.gen_range(0..64);
                let ty = if rng.gen_bool(0.8) {
                    RowLockType::Read
                } else {
                    RowLockType::Write
                };
                let range = KeyRange::new(key(low), key(high)).unwrap();
                if lm.acquire(txn, 1, &range, ty, LOCK_TIMEOUT).is_err() {
                    aborted.fetch_add(1, Ordering::Relaxed);
                }
                lm.release_all(txn);
            })
        });
        Self::report("range_locks", NUM_TXNS, start, aborted.load(Ordering::Relaxed));
        Ok(())
    }

    fn metadata_locks(&self) {
        let service = MdlService::new(MdlOptions::default());
        let next_session = AtomicU64::new(1);
        let start = Instant::now();
        self.pool.install(|| {
            (0..NUM_TXNS).into_par_iter().for_each(|i| {
                let owner = Arc::new(SessionOwner::new(next_session.fetch_add(1, Ordering::Relaxed)));
                let mut ctx = service.create_context(owner);
                let table = format!("t{}", i % 16);
                let mut request =
                    MdlRequest::table("bench", &table, MdlType::SharedWrite, MdlDuration::Transaction);
                ctx.acquire_lock(&mut request, LOCK_TIMEOUT).unwrap();
                ctx.release_transactional_locks();
            })
        });
        Self::report("metadata_locks", NUM_TXNS, start, 0);
    }
}

fn main() -> kvlock::Result<()> {
    print_environment();
    print_arguments();
    println!("-------------------------------------------------");
    let benchmark = BenchMark::new()?;
    benchmark.point_locks(RowLockType::Read)?;
    benchmark.point_locks(RowLockType::Write)?;
    benchmark.range_locks()?;
    benchmark.metadata_locks();
    Ok(())
}
