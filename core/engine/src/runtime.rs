//! Periodic scheduling around the controller.
//!
//! Three mutation sources touch session state: the 1 Hz tick, the offline
//! drain tick, and the room-change callback. All three go through one mutex,
//! so mutations are serialized regardless of which thread they arrive on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::controller::SessionController;
use crate::room::RoomStore;

pub struct SessionRuntime {
    controller: Arc<Mutex<SessionController>>,
    stop: Arc<AtomicBool>,
}

impl SessionRuntime {
    /// Takes ownership of the controller and spawns the tick and drain
    /// threads. The threads are detached; they observe the stop flag within
    /// one period of `shutdown`.
    pub fn start(controller: SessionController, config: &EngineConfig) -> Self {
        let controller = Arc::new(Mutex::new(controller));
        let stop = Arc::new(AtomicBool::new(false));

        spawn_tick_loop(
            Arc::clone(&controller),
            Arc::clone(&stop),
            Duration::from_millis(config.tick_interval_ms),
        );
        spawn_drain_loop(
            Arc::clone(&controller),
            Arc::clone(&stop),
            Duration::from_secs(config.drain_interval_secs),
        );

        SessionRuntime { controller, stop }
    }

    pub fn controller(&self) -> Arc<Mutex<SessionController>> {
        Arc::clone(&self.controller)
    }

    /// Registers the room-change subscription. The callback locks the same
    /// mutex as the periodic work, serializing reconciliation with ticks and
    /// drains.
    pub fn bind_room_subscription(&self, room: &dyn RoomStore, share_code: &str) {
        let controller = Arc::clone(&self.controller);
        room.subscribe(
            share_code,
            Box::new(move |snapshot| {
                let mut guard = match controller.lock() {
                    Ok(guard) => guard,
                    Err(err) => {
                        warn!(error = %err, "Controller lock poisoned; dropping room change");
                        return;
                    }
                };
                if let Err(err) = guard.handle_room_change(&snapshot) {
                    warn!(error = %err, "Failed to handle room change");
                }
            }),
        );
    }

    /// Stops the periodic threads. In-flight drains finish their cycle; a
    /// drain begun before session end still delivers against the closed
    /// session's id.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        debug!("Session runtime shutdown requested");
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn spawn_tick_loop(
    controller: Arc<Mutex<SessionController>>,
    stop: Arc<AtomicBool>,
    interval: Duration,
) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if let Ok(mut guard) = controller.lock() {
            guard.tick();
        }
    });
}

fn spawn_drain_loop(
    controller: Arc<Mutex<SessionController>>,
    stop: Arc<AtomicBool>,
    interval: Duration,
) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if let Ok(mut guard) = controller.lock() {
            if guard.is_online() {
                let outcome = guard.drain_queue();
                if outcome.delivered > 0 || outcome.dropped > 0 || outcome.retained > 0 {
                    debug!(
                        delivered = outcome.delivered,
                        dropped = outcome.dropped,
                        retained = outcome.retained,
                        "Offline queue drain cycle"
                    );
                }
            }
        }
    });
}
