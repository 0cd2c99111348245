use crate::error::{BpError, BpResult};
use crate::storage::StorageService;
use crate::time::{Clock, SystemClock};
use std::sync::{Arc, Mutex};
use tracing::info;

use super::config::ChannelConfig;
use super::engine::Channel;

/// Dense handle addressing one open channel in an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(usize);

/// The process-wide channel table. Open and close serialize on one lock;
/// everything else goes through the `Arc<Channel>` a handle resolves to.
pub struct Agent {
    clock: Arc<dyn Clock>,
    channels: Mutex<Vec<Option<Arc<Channel>>>>,
}

impl Agent {
    pub fn new(max_channels: usize) -> Agent {
        Agent::with_clock(max_channels, Arc::new(SystemClock))
    }

    pub fn with_clock(max_channels: usize, clock: Arc<dyn Clock>) -> Agent {
        Agent {
            clock,
            channels: Mutex::new(vec![None; max_channels.max(1)]),
        }
    }

    /// Open a channel: create its three storage queues and initialize the
    /// outbound template from `config`.
    pub fn open(
        &self,
        storage: &dyn StorageService,
        config: ChannelConfig,
    ) -> BpResult<ChannelHandle> {
        let channel = Channel::open(storage, config, self.clock.clone())?;

        let mut channels = self.channels.lock().expect("channel table poisoned");
        let slot = channels
            .iter()
            .position(Option::is_none)
            .ok_or(BpError::ChannelsFull)?;
        channels[slot] = Some(Arc::new(channel));
        info!(handle = slot, "opened channel");
        Ok(ChannelHandle(slot))
    }

    /// Close a channel. Its storage queues are released with the last
    /// reference to the channel.
    pub fn close(&self, handle: ChannelHandle) -> BpResult<()> {
        let mut channels = self.channels.lock().expect("channel table poisoned");
        match channels.get_mut(handle.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                info!(handle = handle.0, "closed channel");
                Ok(())
            }
            _ => Err(BpError::InvalidHandle),
        }
    }

    /// Resolve a handle, validating it.
    pub fn channel(&self, handle: ChannelHandle) -> BpResult<Arc<Channel>> {
        self.channels
            .lock()
            .expect("channel table poisoned")
            .get(handle.0)
            .and_then(Clone::clone)
            .ok_or(BpError::InvalidHandle)
    }
}
