//! Suspension lifecycle
//!
//! A suspension detaches the local player from group synchronization: the
//! coordinator keeps merging remote events but emits no local actions until
//! the suspension ends. Suspensions may overlap; the group reattaches when
//! the last outstanding handle ends, with a single reconciliation action.

use std::sync::Arc;

use tracing::debug;

use playsync_common::Result;

use crate::session::SessionInner;

/// Handle returned by `begin_suspension`. Ending it (or dropping it)
/// releases one suspension level.
pub struct Suspension {
    inner: Arc<SessionInner>,
    ended: bool,
}

impl Suspension {
    pub(crate) fn new(inner: Arc<SessionInner>) -> Self {
        Self {
            inner,
            ended: false,
        }
    }

    /// End the suspension.
    ///
    /// When this was the last outstanding suspension the coordinator
    /// re-applies the authoritative group state to the player in one
    /// action, and then, if `resume_position` is given, seeks the group
    /// there. The seek is deferred while the group is holding at a wait
    /// point and runs once the wait releases.
    pub async fn end(mut self, resume_position: Option<f64>) -> Result<()> {
        self.ended = true;
        let now = self.inner.clock.now_ms();
        let finished = self.inner.state.lock().unwrap().end_suspension(now);
        if !finished {
            debug!("outer suspension still active");
            return Ok(());
        }

        if let Some(position) = resume_position {
            let waiting = self.inner.state.lock().unwrap().is_waiting();
            if waiting {
                debug!(position, "resume seek deferred until the wait releases");
                self.inner.state.lock().unwrap().defer_resume_seek(position);
            } else {
                self.inner.seek_group(position).await?;
            }
        }
        Ok(())
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        if !self.ended {
            let now = self.inner.clock.now_ms();
            self.inner.state.lock().unwrap().end_suspension(now);
        }
    }
}
