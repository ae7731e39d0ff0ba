//! Expansion fan-out: one feeder (the driver) pushes packed records into
//! a bounded ring, N-1 workers drain it through the phase's handler. The
//! feeder blocks when the ring is full, throttling disk reads; workers
//! exit when the feeder hangs up. Phases are strictly serial: a phase's
//! workers are all joined before the next phase starts.

use std::sync::Mutex;

use crossbeam_channel::bounded;

use crate::error::SiftError;
use crate::problem::PackedState;

/// Run one expansion phase. `feed` receives a push function and drives
/// records into the pool; `handler` is invoked once per record on some
/// worker. With fewer than two threads the handler runs inline in the
/// feeder and no ring exists.
///
/// A handler error poisons the phase: workers stop, the feeder's next
/// push fails, and the first error is returned.
pub fn run_phase<P, H, F>(threads: usize, capacity: usize, handler: H, feed: F) -> Result<(), SiftError>
where
    P: PackedState,
    H: Fn(P) -> Result<(), SiftError> + Sync,
    F: FnOnce(&mut dyn FnMut(P) -> Result<(), SiftError>) -> Result<(), SiftError>,
{
    if threads < 2 {
        return feed(&mut |node| handler(node));
    }

    let (tx, rx) = bounded::<P>(capacity);
    let failure: Mutex<Option<SiftError>> = Mutex::new(None);

    let result = std::thread::scope(|scope| {
        for _ in 0..threads - 1 {
            let rx = rx.clone();
            let handler = &handler;
            let failure = &failure;
            scope.spawn(move || {
                while let Ok(node) = rx.recv() {
                    if let Err(e) = handler(node) {
                        let mut slot = failure.lock().expect("failure lock poisoned");
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        return;
                    }
                }
            });
        }
        drop(rx);

        let feed_result = feed(&mut |node| {
            tx.send(node).map_err(|_| {
                SiftError::Search("expansion pool shut down while feeding".to_string())
            })
        });
        drop(tx);
        feed_result
    });

    if let Some(e) = failure.lock().expect("failure lock poisoned").take() {
        return Err(e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maze::MazePacked;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn packed(x: u16) -> MazePacked {
        MazePacked { x, y: 0 }
    }

    #[test]
    fn inline_mode_handles_everything() {
        let count = AtomicUsize::new(0);
        run_phase::<MazePacked, _, _>(
            1,
            16,
            |_n| {
                count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            |push| {
                for i in 0..100 {
                    push(packed(i))?;
                }
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn workers_drain_the_ring() {
        let sum = AtomicUsize::new(0);
        run_phase::<MazePacked, _, _>(
            4,
            8,
            |n| {
                sum.fetch_add(n.x as usize, Ordering::Relaxed);
                Ok(())
            },
            |push| {
                for i in 1..=1000u16 {
                    push(packed(i))?;
                }
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(sum.load(Ordering::Relaxed), 500_500);
    }

    #[test]
    fn handler_error_surfaces_to_caller() {
        let result = run_phase::<MazePacked, _, _>(
            3,
            4,
            |n| {
                if n.x == 42 {
                    Err(SiftError::Search("boom".to_string()))
                } else {
                    Ok(())
                }
            },
            |push| {
                for i in 0..10_000u16 {
                    // Feeding may fail once workers shut down; that is the
                    // expected path for this test.
                    if push(packed(i)).is_err() {
                        break;
                    }
                }
                Ok(())
            },
        );
        assert!(matches!(result, Err(SiftError::Search(_))));
    }
}
