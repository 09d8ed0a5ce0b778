//! RAII claim on the connection.

use std::fmt;

use log::warn;

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::port::Transport;
use crate::radio::{Radio, RadioFamily};

/// Exclusive use of the connection, released on drop.
pub struct ClaimGuard {
    manager: ConnectionManager,
    owner: String,
}

impl ClaimGuard {
    pub(super) fn new(manager: ConnectionManager, owner: String) -> Self {
        Self { manager, owner }
    }

    /// Name the claim was taken under.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The claimed transport.
    pub fn transport(&self) -> Result<Transport> {
        self.manager.require_transport()
    }

    /// A [`Radio`] on the claimed transport.
    ///
    /// A failure that means the link is gone disconnects the manager.
    pub fn radio(&self, family: RadioFamily) -> Result<Radio> {
        let transport = self.transport()?;
        let manager = self.manager.clone();
        Ok(Radio::new(transport, family).with_failure_hook(move |e| {
            warn!("Disconnecting after transport failure: {e}");
            manager.disconnect();
        }))
    }

    /// Release now instead of at end of scope.
    pub fn release(self) {}
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.manager.release(&self.owner);
    }
}

impl fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
