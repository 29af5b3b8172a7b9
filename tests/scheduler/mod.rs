//! Scheduler behavior under edits, reads and removal

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use semfora_scheduler::{
    Deadline, Invalidation, PreambleFreshness, TaskError, TaskHandle, WantDiagnostics,
};

use crate::common::{scheduler_options, SchedulerFixture, SlowFrontend, IDLE_TIMEOUT};

const MAIN: &str = "/p/main.c";

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Source whose preamble region differs per revision
fn revision(i: usize) -> String {
    format!("#define REVISION_{}\nfn body() {{}}\n", i)
}

fn read_version(
    fixture: &SchedulerFixture,
    invalidation: Invalidation,
) -> TaskHandle<Result<String, TaskError>> {
    fixture
        .scheduler
        .run_with_ast("read", Path::new(MAIN), invalidation, |result| {
            result.map(|snapshot| snapshot.ast.version.clone())
        })
}

fn wait_read(handle: TaskHandle<Result<String, TaskError>>) -> Result<String, TaskError> {
    handle.wait_timeout(IDLE_TIMEOUT).unwrap()
}

fn assert_increasing(versions: &[String]) {
    let numbers: Vec<u32> = versions.iter().map(|v| v.parse().unwrap()).collect();
    assert!(
        numbers.windows(2).all(|w| w[0] < w[1]),
        "published out of order: {:?}",
        versions
    );
}

fn tracked(preamble_delay: Duration, debounce_ms: u64) -> SchedulerFixture {
    let fixture = SchedulerFixture::new(
        scheduler_options(4, debounce_ms),
        SlowFrontend::new(preamble_delay, Duration::ZERO),
    );
    fixture.set_command(Path::new(MAIN));
    fixture
}

fn update(fixture: &SchedulerFixture, contents: &str, version: &str, want: WantDiagnostics) {
    fixture
        .scheduler
        .update(Path::new(MAIN), fixture.inputs(contents, version), want);
}

// ============================================================================
// Preamble builds
// ============================================================================

#[test]
fn test_at_most_one_preamble_build_per_file() {
    let fixture = tracked(ms(100), 0);
    for i in 1..=5 {
        update(&fixture, &revision(i), &i.to_string(), WantDiagnostics::Auto);
        thread::sleep(ms(30));
    }
    fixture.wait_idle();

    assert_eq!(fixture.frontend.max_active_preambles(), 1);
    assert_eq!(wait_read(read_version(&fixture, Invalidation::NoInvalidation)).unwrap(), "5");

    let published = fixture.callbacks.published_versions();
    assert_eq!(published.last().map(String::as_str), Some("5"));
    assert_increasing(&published);
}

#[test]
fn test_burst_of_updates_rebuilds_once() {
    let fixture = tracked(Duration::ZERO, 200);
    for i in 1..=5 {
        update(&fixture, &revision(i), &i.to_string(), WantDiagnostics::Auto);
    }
    fixture.wait_idle();

    assert_eq!(fixture.frontend.preamble_builds(), 1);
    assert_eq!(fixture.frontend.ast_builds(), 1);
    assert_eq!(fixture.callbacks.published_versions(), vec!["5".to_string()]);
    assert_eq!(fixture.callbacks.preamble_versions(), vec!["5".to_string()]);

    let stats = fixture.scheduler.file_stats();
    let stats = stats.get(Path::new(MAIN)).unwrap();
    assert_eq!(stats.preamble_builds, 1);
    assert_eq!(stats.ast_builds, 1);
}

#[test]
fn test_body_edit_reuses_preamble() {
    let fixture = tracked(Duration::ZERO, 0);
    update(&fixture, "#define A\nfn first() {}\n", "1", WantDiagnostics::Yes);
    fixture.wait_idle();
    update(&fixture, "#define A\nfn second() {}\n", "2", WantDiagnostics::Yes);
    fixture.wait_idle();

    assert_eq!(fixture.frontend.preamble_builds(), 1);
    assert_eq!(fixture.callbacks.preamble_versions(), vec!["1".to_string()]);
    assert_eq!(
        fixture.callbacks.published_versions(),
        vec!["1".to_string(), "2".to_string()]
    );
}

#[test]
fn test_must_publish_versions_are_not_dropped() {
    let fixture = tracked(ms(100), 0);
    update(&fixture, &revision(1), "1", WantDiagnostics::Yes);
    update(&fixture, &revision(2), "2", WantDiagnostics::Auto);
    update(&fixture, &revision(3), "3", WantDiagnostics::Yes);
    fixture.wait_idle();

    let published = fixture.callbacks.published_versions();
    assert!(published.contains(&"1".to_string()), "{:?}", published);
    assert_eq!(published.last().map(String::as_str), Some("3"));
    assert_increasing(&published);
}

#[test]
fn test_preamble_failure_is_published_and_fails_reads() {
    let fixture = tracked(Duration::ZERO, 0);
    update(&fixture, "#error broken setup\nfn body() {}\n", "1", WantDiagnostics::Yes);
    fixture.wait_idle();

    let published = fixture.callbacks.published();
    assert_eq!(published.len(), 1);
    assert!(published[0].failed);
    assert!(published[0].diagnostics.iter().any(|d| d.code == "pp_hash_error"));

    match wait_read(read_version(&fixture, Invalidation::NoInvalidation)) {
        Err(TaskError::BuildFailure { diagnostics, .. }) => {
            assert!(diagnostics.iter().any(|d| d.code == "pp_hash_error"))
        }
        other => panic!("expected a build failure, got {:?}", other),
    }
}

#[test]
fn test_failed_rebuild_keeps_last_good_preamble() {
    let fixture = tracked(Duration::ZERO, 0);
    update(&fixture, "#define GOOD\nfn body() {}\n", "1", WantDiagnostics::Yes);
    fixture.wait_idle();
    update(&fixture, "#error broken setup\nfn body() {}\n", "2", WantDiagnostics::Yes);
    fixture.wait_idle();

    let published = fixture.callbacks.published();
    assert_eq!(fixture.callbacks.published_versions(), vec!["1", "2"]);
    assert!(!published[0].failed);
    assert!(published[1].failed);
    assert!(published[1].diagnostics.iter().any(|d| d.code == "pp_hash_error"));

    let (version, preamble) = fixture
        .scheduler
        .run_with_preamble("complete", Path::new(MAIN), PreambleFreshness::Stale, |result| {
            result.map(|s| (s.version.clone(), s.preamble.map(|p| p.version.clone())))
        })
        .wait_timeout(IDLE_TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(version, "2");
    assert_eq!(preamble.as_deref(), Some("1"));
    assert_eq!(wait_read(read_version(&fixture, Invalidation::NoInvalidation)).unwrap(), "2");
}

#[test]
fn test_stale_read_fails_when_first_preamble_failed() {
    let fixture = tracked(Duration::ZERO, 0);
    update(&fixture, "#error broken setup\nfn body() {}\n", "1", WantDiagnostics::Yes);
    fixture.wait_idle();

    let stale = fixture
        .scheduler
        .run_with_preamble("complete", Path::new(MAIN), PreambleFreshness::Stale, |result| {
            result.map(|s| s.preamble.is_some())
        })
        .wait_timeout(IDLE_TIMEOUT)
        .unwrap();
    match stale {
        Err(TaskError::BuildFailure { path, diagnostics }) => {
            assert_eq!(path, Path::new(MAIN));
            assert!(diagnostics.iter().any(|d| d.code == "pp_hash_error"));
        }
        other => panic!("expected a build failure, got {:?}", other),
    }

    // Fallback mode still serves the contents without a preamble
    let absent = fixture
        .scheduler
        .run_with_preamble(
            "complete",
            Path::new(MAIN),
            PreambleFreshness::StaleOrAbsent,
            |result| result.map(|s| s.preamble.is_some()),
        )
        .wait_timeout(IDLE_TIMEOUT)
        .unwrap();
    assert_eq!(absent, Ok(false));
}

// ============================================================================
// Reads
// ============================================================================

#[test]
fn test_reads_see_the_version_admitted_before_them() {
    let fixture = tracked(Duration::ZERO, 0);
    update(&fixture, &revision(1), "1", WantDiagnostics::Auto);
    let first = read_version(&fixture, Invalidation::NoInvalidation);
    update(&fixture, &revision(2), "2", WantDiagnostics::Auto);
    let second = read_version(&fixture, Invalidation::NoInvalidation);

    assert_eq!(wait_read(first).unwrap(), "1");
    assert_eq!(wait_read(second).unwrap(), "2");
}

#[test]
fn test_exclusive_read_runs_on_latest_ast() {
    let fixture = tracked(Duration::ZERO, 0);
    update(&fixture, "fn only() {}\n", "7", WantDiagnostics::No);
    let handle = fixture.scheduler.run_with_ast_exclusive(
        "rename",
        Path::new(MAIN),
        Invalidation::NoInvalidation,
        |result| result.map(|s| (s.inputs.version.clone(), s.ast.symbols.len())),
    );
    let (version, symbols) = handle.wait_timeout(IDLE_TIMEOUT).unwrap().unwrap();
    assert_eq!(version, "7");
    assert_eq!(symbols, 1);
    assert!(fixture.callbacks.published().is_empty());
}

#[test]
fn test_stale_preamble_read_does_not_wait_for_rebuild() {
    let fixture = tracked(Duration::ZERO, 0);
    update(&fixture, &revision(1), "1", WantDiagnostics::Yes);
    fixture.wait_idle();

    fixture.frontend.set_preamble_delay(ms(3000));
    update(&fixture, &revision(2), "2", WantDiagnostics::Auto);

    let start = Instant::now();
    let (version, preamble) = fixture
        .scheduler
        .run_with_preamble("complete", Path::new(MAIN), PreambleFreshness::Stale, |result| {
            result.map(|s| (s.version.clone(), s.preamble.map(|p| p.version.clone())))
        })
        .wait_timeout(IDLE_TIMEOUT)
        .unwrap()
        .unwrap();
    assert!(start.elapsed() < ms(1500), "waited {:?}", start.elapsed());
    assert_eq!(version, "2");
    assert_eq!(preamble.as_deref(), Some("1"));
}

#[test]
fn test_stale_or_absent_never_waits() {
    let fixture = tracked(ms(3000), 0);
    let source = revision(1);
    update(&fixture, &source, "1", WantDiagnostics::Yes);

    let start = Instant::now();
    let (contents, preamble) = fixture
        .scheduler
        .run_with_preamble(
            "complete",
            Path::new(MAIN),
            PreambleFreshness::StaleOrAbsent,
            |result| result.map(|s| (s.contents.to_string(), s.preamble.is_some())),
        )
        .wait_timeout(IDLE_TIMEOUT)
        .unwrap()
        .unwrap();
    assert!(start.elapsed() < ms(1500), "waited {:?}", start.elapsed());
    assert_eq!(contents, source);
    assert!(!preamble);
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_remove_cancels_pending_reads() {
    let fixture = tracked(ms(3000), 0);
    update(&fixture, &revision(1), "1", WantDiagnostics::Yes);
    let pending = read_version(&fixture, Invalidation::NoInvalidation);
    thread::sleep(ms(50));

    assert!(fixture.scheduler.remove(Path::new(MAIN)));
    assert!(wait_read(pending).unwrap_err().is_cancelled());

    let after = wait_read(read_version(&fixture, Invalidation::NoInvalidation));
    assert!(matches!(after, Err(TaskError::InvalidRequest { .. })));
    assert!(fixture.scheduler.run_quick("quick", Path::new(MAIN), || 1).wait().is_err());
    assert!(!fixture.scheduler.remove(Path::new(MAIN)));
    assert!(fixture.callbacks.published().is_empty());
    assert!(fixture.scheduler.tracked_files().is_empty());
}

#[test]
fn test_edit_cancels_invalidatable_reads_only() {
    let fixture = tracked(ms(300), 0);
    update(&fixture, &revision(1), "1", WantDiagnostics::Auto);
    let invalidated = read_version(&fixture, Invalidation::InvalidateOnUpdate);
    let kept = read_version(&fixture, Invalidation::NoInvalidation);
    thread::sleep(ms(50));
    update(&fixture, &revision(2), "2", WantDiagnostics::Auto);

    assert!(wait_read(invalidated).unwrap_err().is_cancelled());
    assert_eq!(wait_read(kept).unwrap(), "1");
    fixture.wait_idle();
}

#[test]
fn test_edit_cancels_running_ast_build() {
    let fixture = SchedulerFixture::new(
        scheduler_options(4, 0),
        SlowFrontend::new(Duration::ZERO, ms(800)),
    );
    fixture.set_command(Path::new(MAIN));
    update(&fixture, &revision(1), "1", WantDiagnostics::No);
    let running = read_version(&fixture, Invalidation::InvalidateOnUpdate);
    thread::sleep(ms(100));
    assert_eq!(fixture.frontend.ast_builds(), 0);

    let start = Instant::now();
    update(&fixture, &revision(2), "2", WantDiagnostics::Auto);
    assert!(wait_read(running).unwrap_err().is_cancelled());
    assert!(start.elapsed() < ms(600), "cancel took {:?}", start.elapsed());

    fixture.wait_idle();
    assert_eq!(fixture.callbacks.published_versions(), vec!["2"]);
}

#[test]
fn test_cancelled_handle_resolves() {
    let fixture = tracked(ms(3000), 0);
    update(&fixture, &revision(1), "1", WantDiagnostics::No);
    let handle = read_version(&fixture, Invalidation::NoInvalidation);
    handle.cancel("user gave up");
    assert!(wait_read(handle).unwrap_err().is_cancelled());
}

// ============================================================================
// Pool and idle
// ============================================================================

#[test]
fn test_block_until_idle_covers_diagnostics() {
    let fixture = SchedulerFixture::new(
        scheduler_options(4, 0),
        SlowFrontend::new(ms(200), ms(100)),
    );
    fixture.set_command(Path::new(MAIN));
    update(&fixture, &revision(1), "1", WantDiagnostics::Yes);

    assert!(!fixture.scheduler.block_until_idle(Deadline::after(ms(10))));
    fixture.wait_idle();
    assert_eq!(fixture.callbacks.published_versions(), vec!["1".to_string()]);
}

#[test]
fn test_actions_bounded_by_async_threads() {
    let fixture = SchedulerFixture::new(scheduler_options(2, 0), SlowFrontend::fast());
    assert_eq!(fixture.scheduler.async_threads(), 2);

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            fixture.scheduler.run(&format!("job-{}", i), None, move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(ms(50));
                active.fetch_sub(1, Ordering::SeqCst);
                i
            })
        })
        .collect();

    let results: Vec<usize> = handles
        .into_iter()
        .map(|h| h.wait_timeout(IDLE_TIMEOUT).unwrap())
        .collect();
    assert_eq!(results, (0..6).collect::<Vec<_>>());
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[test]
fn test_quick_actions_and_introspection() {
    let fixture = tracked(Duration::ZERO, 0);
    let source = revision(1);
    update(&fixture, &source, "1", WantDiagnostics::Yes);

    let answer = fixture
        .scheduler
        .run_quick("quick", Path::new(MAIN), || 42)
        .wait_timeout(IDLE_TIMEOUT)
        .unwrap();
    assert_eq!(answer, 42);

    fixture.wait_idle();
    assert_eq!(fixture.scheduler.tracked_files(), vec![Path::new(MAIN).to_path_buf()]);
    assert_eq!(fixture.scheduler.contents(Path::new(MAIN)).as_deref(), Some(source.as_str()));
    assert!(fixture.scheduler.file_stats()[Path::new(MAIN)].used_memory > 0);
}
