use crate::db;
use crate::notify::{self, Audience, OutboxNotifier};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Started,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct SingleFlight {
    state: Arc<Mutex<SyncState>>,
}

/// Flips the state back to `Idle` when the job ends, even by panic.
struct RunningGuard(Arc<Mutex<SyncState>>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        *lock_state(&self.0) = SyncState::Idle;
    }
}

fn lock_state(state: &Mutex<SyncState>) -> MutexGuard<'_, SyncState> {
    match state.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SyncState::Idle)),
        }
    }

    pub fn state(&self) -> SyncState {
        *lock_state(&self.state)
    }

    fn claim(&self) -> Option<RunningGuard> {
        let mut st = lock_state(&self.state);
        if *st == SyncState::Running {
            return None;
        }
        *st = SyncState::Running;
        Some(RunningGuard(self.state.clone()))
    }

    pub fn try_start<F>(&self, name: &str, job: F) -> TickOutcome
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(guard) = self.claim() else {
            return TickOutcome::Skipped;
        };
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                job();
            });
        match spawned {
            Ok(_) => TickOutcome::Started,
            Err(e) => {
                // The closure (and with it the guard) was dropped, so the
                // state is already back to Idle.
                log::warn!("could not start {}: {}", name, e);
                TickOutcome::Skipped
            }
        }
    }

    pub fn run_inline<T>(&self, job: impl FnOnce() -> T) -> Option<T> {
        let _guard = self.claim()?;
        Some(job())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub allocations: usize,
    pub changed: usize,
    pub memberships: usize,
}

struct AllocationRow {
    id: String,
    kind: String,
    division: String,
    batch: Option<String>,
}

fn expected_members(conn: &Connection, a: &AllocationRow) -> rusqlite::Result<BTreeSet<String>> {
    if a.kind == "practical" {
        let Some(batch) = a.batch.as_deref().filter(|b| !b.trim().is_empty()) else {
            return Ok(BTreeSet::new());
        };
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM students WHERE division = ? AND UPPER(batch) = UPPER(?)",
        )?;
        let ids = stmt
            .query_map((&a.division, batch), |r| r.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        return Ok(ids);
    }
    let mut stmt = conn.prepare_cached("SELECT id FROM students WHERE division = ?")?;
    let ids = stmt
        .query_map([&a.division], |r| r.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

fn current_members(conn: &Connection, allocation_id: &str) -> rusqlite::Result<BTreeSet<String>> {
    let mut stmt =
        conn.prepare_cached("SELECT student_id FROM allocation_students WHERE allocation_id = ?")?;
    let ids = stmt
        .query_map([allocation_id], |r| r.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

pub fn sync_allocations(conn: &Connection) -> rusqlite::Result<SyncSummary> {
    let tx = conn.unchecked_transaction()?;
    let allocations = {
        let mut stmt = tx.prepare("SELECT id, kind, division, batch FROM allocations ORDER BY id")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(AllocationRow {
                    id: r.get(0)?,
                    kind: r.get(1)?,
                    division: r.get(2)?,
                    batch: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut summary = SyncSummary {
        allocations: allocations.len(),
        ..SyncSummary::default()
    };
    for a in &allocations {
        let expected = expected_members(&tx, a)?;
        summary.memberships += expected.len();
        if current_members(&tx, &a.id)? == expected {
            continue;
        }
        tx.execute("DELETE FROM allocation_students WHERE allocation_id = ?", [&a.id])?;
        let mut ins = tx.prepare_cached(
            "INSERT INTO allocation_students(allocation_id, student_id) VALUES(?, ?)",
        )?;
        for sid in &expected {
            ins.execute((&a.id, sid))?;
        }
        summary.changed += 1;
    }
    tx.commit()?;
    Ok(summary)
}

pub fn sync_and_notify(conn: &Connection) -> anyhow::Result<SyncSummary> {
    let started = Instant::now();
    let summary = sync_allocations(conn)?;
    log::info!(
        "allocation sync: {} allocations, {} changed, {} memberships in {:?}",
        summary.allocations,
        summary.changed,
        summary.memberships,
        started.elapsed()
    );
    if summary.changed > 0 {
        notify::publish_all(
            &OutboxNotifier::new(conn),
            &[Audience::Role("admin".to_string())],
            notify::EVENT_SYNCED,
            &json!(summary),
        );
    }
    Ok(summary)
}

pub fn run_sync(workspace: &Path) -> anyhow::Result<SyncSummary> {
    let conn = db::open_db(workspace)?;
    sync_and_notify(&conn)
}

pub struct AllocationSyncScheduler {
    flight: SingleFlight,
    stop: Arc<AtomicBool>,
    ticker: Option<JoinHandle<()>>,
}

const STOP_POLL: Duration = Duration::from_millis(200);

impl AllocationSyncScheduler {
    pub fn start(workspace: PathBuf, interval: Duration) -> anyhow::Result<Self> {
        let flight = SingleFlight::new();
        let stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let flight = flight.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("allocation-sync-ticker".to_string())
                .spawn(move || {
                    let mut next = Instant::now() + interval;
                    while !stop.load(Ordering::Relaxed) {
                        if Instant::now() < next {
                            std::thread::sleep(STOP_POLL.min(next - Instant::now()));
                            continue;
                        }
                        next = Instant::now() + interval;
                        let ws = workspace.clone();
                        let outcome = flight.try_start("allocation-sync", move || {
                            if let Err(e) = run_sync(&ws) {
                                log::warn!("allocation sync failed: {:#}", e);
                            }
                        });
                        if outcome == TickOutcome::Skipped {
                            log::info!("allocation sync still running; tick skipped");
                        }
                    }
                })?
        };
        log::info!("allocation sync scheduled every {:?}", interval);
        Ok(Self {
            flight,
            stop,
            ticker: Some(ticker),
        })
    }

    pub fn flight(&self) -> &SingleFlight {
        &self.flight
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.ticker.take() {
            let _ = h.join();
        }
    }
}

impl Drop for AllocationSyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
