use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use ulid::Ulid;

use roombook::audit::MemoryAuditLog;
use roombook::catalog::StaticCatalog;
use roombook::clock::ManualClock;
use roombook::config::BookingRules;
use roombook::engine::{Engine, Services};
use roombook::horizon::HorizonSupervisor;
use roombook::model::*;
use roombook::recurrence::Recurrence;

const ROOMS: i64 = 50;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid date")
}

fn slot(day: i64, hour: i64, minutes: i64) -> TimeRange {
    let start = epoch() + TimeDelta::days(day) + TimeDelta::hours(hour);
    TimeRange::new(start, start + TimeDelta::minutes(minutes))
}

fn draft(room_id: RoomId, range: TimeRange, recurrence: Recurrence) -> BookingDraft {
    BookingDraft {
        room_id,
        range,
        recurrence,
        status: BookingStatus::Approved,
        needed_resources: BTreeSet::new(),
        moderator_note: String::new(),
        kind: BookingKind::Coworking,
    }
}

fn engine(clock: Arc<ManualClock>) -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("roombook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let services = Services {
        clock,
        catalog: Arc::new(StaticCatalog::with_rooms(0..ROOMS)),
        audit: Arc::new(MemoryAuditLog::new()),
        rules: BookingRules {
            min_lead_days: 0,
            max_lead_days: 365,
            horizon_days: 90,
        },
    };
    Arc::new(Engine::new(dir.join("bench.wal"), services).expect("open engine"))
}

async fn phase1_sequential(engine: &Engine, admin: &Actor) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n as i64 {
        // 8 one-hour slots a day, 08:00-16:00.
        let range = slot(1 + i / 8, 8 + i % 8, 60);
        let t = Instant::now();
        engine
            .create_booking(admin, draft(0, range, Recurrence::None))
            .await
            .expect("sequential create");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_contended(engine: Arc<Engine>, admin: &Actor) {
    let n_tasks = 16;
    let n_per_task = 200;
    let start = Instant::now();

    // Every task hammers the same two rooms with staggered, overlapping slots.
    let handles: Vec<_> = (0..n_tasks)
        .map(|task| {
            let engine = engine.clone();
            let admin = admin.clone();
            tokio::spawn(async move {
                let mut accepted = 0usize;
                let mut conflicts = 0usize;
                for j in 0..n_per_task as i64 {
                    let room = 1 + (j % 2);
                    let range = slot(1 + j / 16, 8, 60).shifted(
                        TimeDelta::minutes(15 * (task as i64 % 4)),
                        TimeDelta::minutes(15 * (task as i64 % 4)),
                    )
                    .expect("slot in calendar");
                    match engine.create_booking(&admin, draft(room, range, Recurrence::None)).await {
                        Ok(_) => accepted += 1,
                        Err(e) if e.is_conflict() => conflicts += 1,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                (accepted, conflicts)
            })
        })
        .collect();

    let mut accepted = 0;
    let mut conflicts = 0;
    for result in futures::future::join_all(handles).await {
        let (a, c) = result.expect("task panicked");
        accepted += a;
        conflicts += c;
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_tasks} tasks x {n_per_task} creates: {accepted} accepted, {conflicts} conflicts in {:.2}s",
        elapsed.as_secs_f64()
    );

    let all = TimeRange::new(epoch(), epoch() + TimeDelta::days(365));
    for room in [1, 2] {
        let rows = engine.room_agenda(room, &all).await;
        for pair in rows.windows(2) {
            assert!(
                !pair[0].range.overlaps(&pair[1].range),
                "room {room}: {:?} overlaps {:?}",
                pair[0].range,
                pair[1].range
            );
        }
    }
    println!("  no overlapping approved bookings");
}

async fn phase3_read_under_load(engine: Arc<Engine>, admin: &Actor) {
    for i in 0..200i64 {
        engine
            .create_booking(admin, draft(3, slot(1 + i / 8, 8 + i % 8, 30), Recurrence::None))
            .await
            .expect("prefill");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let writers: Vec<_> = (0..5i64)
        .map(|w| {
            let engine = engine.clone();
            let admin = admin.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut i = 0i64;
                while !stop.load(Ordering::Relaxed) {
                    let range = slot(1 + i / 8, 8 + i % 8, 60);
                    let _ = engine
                        .create_booking(&admin, draft(10 + w, range, Recurrence::None))
                        .await;
                    i += 1;
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..10i64)
        .map(|r| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut latencies = Vec::with_capacity(500);
                for k in 0..500i64 {
                    let opening = slot(1 + (r + k) % 25, 8, 10 * 60);
                    let t = Instant::now();
                    let _ = engine.free_windows(3, &opening).await;
                    latencies.push(t.elapsed());
                }
                latencies
            })
        })
        .collect();

    let mut all_latencies = Vec::new();
    for h in futures::future::join_all(readers).await {
        all_latencies.extend(h.expect("reader panicked"));
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }

    print_latency("free_windows query", &mut all_latencies);
}

async fn phase4_sweep(engine: Arc<Engine>, clock: Arc<ManualClock>, admin: &Actor) {
    let series = 200i64;
    for s in 0..series {
        let room = 20 + s % 30;
        let range = slot(s % 7, 6 + (s / 30) % 12, 45);
        engine
            .create_booking(admin, draft(room, range, Recurrence::Weekly))
            .await
            .expect("series create");
    }

    clock.advance(TimeDelta::days(60));
    let supervisor = HorizonSupervisor::new(engine, clock, Duration::from_secs(3600));
    let start = Instant::now();
    let report = supervisor.run_once().await;
    println!(
        "  swept {} series, {} occurrences created, {} conflicts in {:.2}s",
        report.series_scanned,
        report.occurrences_created,
        report.conflicts,
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    println!("=== roombook stress benchmark ===\n");

    let clock = Arc::new(ManualClock::new(epoch()));
    let engine = engine(clock.clone());
    let admin = Actor::superuser(Ulid::new());

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&engine, &admin).await;

    println!("\n[phase 2] contended writes");
    phase2_contended(engine.clone(), &admin).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(engine.clone(), &admin).await;

    println!("\n[phase 4] horizon sweep");
    phase4_sweep(engine.clone(), clock, &admin).await;

    println!("\n=== done ===");
}
