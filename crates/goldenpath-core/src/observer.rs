use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::registry::SharedState;
use crate::session::Session;

/// Start the background poller that mirrors shared state into an observer
/// session. The poller is the only writer of UI-visible fields on observer
/// sessions; it exits as soon as the session becomes the executor.
pub fn spawn_observer_poller(sess: Arc<Session>, shared: Arc<SharedState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        {
            let mut inner = sess.state.lock().await;
            if inner.observer_polling {
                return; // already polling
            }
            inner.observer_polling = true;
        }

        let mut idle_count: u32 = 0;
        loop {
            // Adaptive backoff: 1s when active, ramp to 3s when idle, plus
            // jitter to avoid thundering herd across sessions.
            let base = (1.0 + f64::from(idle_count) * 0.5).min(3.0);
            let jitter: f64 = rand::thread_rng().gen_range(0.0..0.3);
            tokio::time::sleep(Duration::from_secs_f64(base + jitter)).await;

            {
                let mut inner = sess.state.lock().await;
                if inner.is_executor {
                    inner.observer_polling = false;
                    debug!("session {}: poller stopped, now executor", sess.id);
                    return;
                }
            }

            let (snapshot, version) = shared.read();
            if version == 0 {
                idle_count += 1;
                continue;
            }

            let mut inner = sess.state.lock().await;
            if version == inner.last_shared_ver {
                idle_count += 1;
                continue;
            }
            idle_count = 0;
            inner.last_shared_ver = version;
            inner.snap = snapshot;
        }
    })
}
