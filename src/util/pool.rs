//! Bounded worker pool over a shared item list. Workers pull the next index
//! from a shared counter and write results back by original index, so output
//! order always matches input order regardless of completion order.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Run `f(0..len)` with at most `concurrency` in-flight futures. The closure
/// indexes into whatever shared slice the caller captured; results come back
/// in input order.
pub async fn bounded_map<R, F, Fut>(len: usize, concurrency: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize) -> Fut + Sync,
    Fut: Future<Output = R>,
{
    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<Option<R>>> = Mutex::new((0..len).map(|_| None).collect());
    let width = concurrency.clamp(1, len.max(1));

    let workers = (0..width).map(|_| async {
        loop {
            let i = next.fetch_add(1, Ordering::SeqCst);
            if i >= len {
                break;
            }
            let out = f(i).await;
            results.lock().await[i] = Some(out);
        }
    });
    futures::future::join_all(workers).await;

    results
        .into_inner()
        .into_iter()
        .map(|slot| slot.expect("pool worker filled every slot"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn preserves_input_order_despite_completion_order() {
        let delays: Vec<u64> = vec![30, 5, 20, 1, 10];
        let out = bounded_map(delays.len(), 3, |i| {
            let ms = delays[i];
            async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                i * 100
            }
        })
        .await;
        assert_eq!(out, vec![0, 100, 200, 300, 400]);
    }

    #[tokio::test]
    async fn respects_concurrency_ceiling() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        bounded_map(20, 3, |_| async {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        })
        .await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn empty_input_yields_empty_output() {
        let out: Vec<u32> = bounded_map(0, 4, |i| async move { i as u32 }).await;
        assert!(out.is_empty());
    }
}
