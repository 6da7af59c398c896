use std::time::Duration;

use tracing::{debug, warn};

use crate::os::Os;
use crate::session::Session;

/// Destroy the session, then release the identity lock.
///
/// Hooks can't be removed while the process forbids dynamic code, and
/// unloading with hooks in place crashes the process. In that case the
/// engine stays resident and re-checks with exponential backoff for as long
/// as it takes.
pub(crate) fn teardown<O: Os>(mut session: Box<Session<O>>) {
    let os = std::sync::Arc::clone(session.os());
    let (initial, max) = session.options().unload_backoff();

    let mut delay = initial;
    while os.dynamic_code_forbidden() {
        warn!(retry_in = ?delay, "process prohibits dynamic code, cannot unload safely");
        os.sleep(delay);
        delay = next_delay(delay, max);
    }

    // The lock must outlive both the session and its slot entry.
    let identity = session.take_identity();
    let slot = session.slot().clone();
    drop(session);
    slot.clear();
    drop(identity);

    debug!("customization session destroyed");
}

fn next_delay(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}
