//! Tests for the scheduler
//!
//! All timing tests run on tokio's paused clock, so firings land exactly
//! on their computed instants and the assertions are deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::{sleep, Duration, Instant};

use crate::scheduler::Scheduler;

fn recorder() -> Arc<Mutex<Vec<Instant>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test(start_paused = true)]
async fn fixed_rate_fires_on_the_grid() {
    let firings = recorder();
    let start = Instant::now();
    let log = firings.clone();
    let _timer = Scheduler::schedule_at_fixed_rate(
        Duration::from_millis(100),
        Duration::from_millis(100),
        move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(Instant::now());
                Ok(())
            }
        },
    );

    sleep(Duration::from_millis(550)).await;

    let times = firings.lock().unwrap().clone();
    assert!(times.len() >= 4, "expected several firings, got {}", times.len());
    for (index, time) in times.iter().enumerate() {
        let ideal = start + Duration::from_millis(100) * (index as u32 + 1);
        let diff = if *time > ideal { *time - ideal } else { ideal - *time };
        assert!(
            diff <= Duration::from_millis(5),
            "firing {} drifted by {:?}",
            index,
            diff
        );
    }
}

#[tokio::test(start_paused = true)]
async fn fixed_rate_absorbs_overruns_into_the_grid() {
    let firings = recorder();
    let start = Instant::now();
    let log = firings.clone();
    let _timer = Scheduler::schedule_at_fixed_rate(
        Duration::from_millis(100),
        Duration::from_millis(100),
        move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(Instant::now());
                // Overrun the period: the next firing lands on a later
                // grid point, missed ones are not replayed.
                sleep(Duration::from_millis(150)).await;
                Ok(())
            }
        },
    );

    sleep(Duration::from_millis(900)).await;

    let times = firings.lock().unwrap().clone();
    assert!(times.len() >= 3);
    for time in &times {
        let offset_ms = (*time - start).as_secs_f64() * 1000.0;
        let remainder = offset_ms % 100.0;
        assert!(
            remainder < 5.0 || remainder > 95.0,
            "firing off the grid at {:.3}ms",
            offset_ms
        );
    }
}

#[tokio::test(start_paused = true)]
async fn fixed_delay_waits_a_full_delay_between_firings() {
    let firings = recorder();
    let log = firings.clone();
    let _timer = Scheduler::schedule_with_fixed_delay(
        Duration::from_millis(100),
        Duration::from_millis(100),
        move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(Instant::now());
                sleep(Duration::from_millis(50)).await;
                Ok(())
            }
        },
    );

    sleep(Duration::from_millis(800)).await;

    let times = firings.lock().unwrap().clone();
    assert!(times.len() >= 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(100));
    }
}

#[tokio::test(start_paused = true)]
async fn schedule_once_fires_exactly_once() {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let _timer = Scheduler::schedule_once(Duration::from_millis(50), move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    sleep(Duration::from_millis(300)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_prevents_the_next_firing() {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let timer = Scheduler::schedule_at_fixed_rate(
        Duration::from_millis(100),
        Duration::from_millis(100),
        move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    );

    sleep(Duration::from_millis(150)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(timer.cancel());

    sleep(Duration::from_millis(500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_returns_true_exactly_once() {
    let timer = Scheduler::schedule_once(Duration::from_secs(60), || async { Ok(()) });
    assert!(!timer.is_cancelled());
    assert!(timer.cancel());
    assert!(timer.is_cancelled());
    assert!(!timer.cancel());
    assert!(!timer.cancel());
}

#[tokio::test(start_paused = true)]
async fn failing_task_terminates_the_periodic_chain() {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let _timer = Scheduler::schedule_at_fixed_rate(
        Duration::from_millis(100),
        Duration::from_millis(100),
        move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("producer bug"))
            }
        },
    );

    sleep(Duration::from_millis(600)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
