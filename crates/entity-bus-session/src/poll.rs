//! Long-poll bookkeeping for sessions that deliver requests by poll.

use std::collections::VecDeque;

use entity_bus_core::{
    ConnectionId, MessagePtr, properties::DEFAULT_POLL_MAX_REQUESTS,
};

use crate::timer::PollingTimer;

/// State of the one poll slot a session may hold.
///
/// At most one poll is waiting at a time. A new poll request releases the
/// waiting one before it takes the slot.
#[derive(Debug)]
pub(crate) struct PollState {
    /// Requests waiting for the client to poll.
    pub messages: VecDeque<MessagePtr>,
    /// A poll reply whose send failed, retried on the next poll.
    pub reply: Option<MessagePtr>,
    pub waiting: bool,
    pub connection_id: ConnectionId,
    pub timer: PollingTimer,
    /// Replies allowed per poll. Negative means unlimited.
    pub count_max: i64,
    pub counter: i64,
    /// Queued messages tolerated before the session disconnects. Negative means unlimited.
    pub max_requests: i64,
}

impl Default for PollState {
    fn default() -> Self {
        Self {
            messages: VecDeque::new(),
            reply: None,
            waiting: false,
            connection_id: 0,
            timer: PollingTimer::new(),
            count_max: -1,
            counter: 0,
            max_requests: DEFAULT_POLL_MAX_REQUESTS,
        }
    }
}

impl PollState {
    /// Clear the waiting slot without sending anything.
    pub fn clear_slot(&mut self) {
        self.waiting = false;
        self.connection_id = 0;
        self.timer.stop();
    }

    pub const fn count_reached(&self) -> bool {
        self.count_max >= 0 && self.counter >= self.count_max
    }

    pub fn over_limit(&self) -> bool {
        usize::try_from(self.max_requests).is_ok_and(|max| self.messages.len() >= max)
    }
}
