/* Defines the builder functionality for the sender and receiver daemons. */

use std::marker::PhantomData;

use crate::config::{Pacing, PortProfile, ReceiverLayout, SenderLayout, Timeouts, DEFAULT_BAUD};
use crate::daemon::{ReceiverDaemon, SenderDaemon};
use crate::fsops::CreateHook;
use crate::Result;

// Type-state builder states for the DaemonBuilder
pub struct Init;
pub struct Sending;
pub struct Receiving;

/// Type-state builder for the two daemon roles. The port must be chosen
/// first, then one of [`sending`](DaemonBuilder::sending) or
/// [`receiving`](DaemonBuilder::receiving) fixes the role.
pub struct DaemonBuilder<T = Init> {
    port: Option<String>,
    baud: u32,
    timeouts: Timeouts,
    pacing: Pacing,
    sender_layout: Option<SenderLayout>,
    receiver_layout: Option<ReceiverLayout>,
    post_create: Option<CreateHook>,
    _marker: PhantomData<T>,
}

impl DaemonBuilder<Init> {
    /// Starts the type-state builder pattern
    pub fn new() -> DaemonBuilder<Init> {
        DaemonBuilder {
            port: None,
            baud: DEFAULT_BAUD,
            timeouts: Timeouts::default(),
            pacing: Pacing::default(),
            sender_layout: None,
            receiver_layout: None,
            post_create: None,
            _marker: PhantomData,
        }
    }

    pub fn with_port(mut self, port: &str) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Continues in the path to build the sending daemon.
    pub fn sending(self, layout: SenderLayout) -> DaemonBuilder<Sending> {
        DaemonBuilder {
            port: self.port,
            baud: self.baud,
            timeouts: self.timeouts,
            pacing: self.pacing,
            sender_layout: Some(layout),
            receiver_layout: None,
            post_create: None,
            _marker: PhantomData,
        }
    }

    /// Continues in the path to build the receiving daemon.
    pub fn receiving(self, layout: ReceiverLayout) -> DaemonBuilder<Receiving> {
        DaemonBuilder {
            port: self.port,
            baud: self.baud,
            timeouts: self.timeouts,
            pacing: self.pacing,
            sender_layout: None,
            receiver_layout: Some(layout),
            post_create: None,
            _marker: PhantomData,
        }
    }
}

impl Default for DaemonBuilder<Init> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DaemonBuilder<T> {
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }
}

impl DaemonBuilder<Sending> {
    /// Builds the sending daemon. The port is opened lazily by
    /// [`SenderDaemon::run`], which owns the reopen-on-failure policy.
    pub fn build(self) -> Result<SenderDaemon> {
        let profile = PortProfile::new(
            self.port
                .expect("port required to get to the sending build method"),
            self.baud,
        )?;
        Ok(SenderDaemon {
            profile,
            layout: self
                .sender_layout
                .expect("layout required to get to the sending build method"),
            timeouts: self.timeouts,
            pacing: self.pacing,
        })
    }
}

impl DaemonBuilder<Receiving> {
    /// Installs the hook invoked on every file and directory the
    /// receiver creates, e.g. for ownership fix-ups.
    pub fn on_create(mut self, hook: CreateHook) -> Self {
        self.post_create = Some(hook);
        self
    }

    /// Builds the receiving daemon; the port is opened lazily by
    /// [`ReceiverDaemon::run`].
    pub fn build(self) -> Result<ReceiverDaemon> {
        let profile = PortProfile::new(
            self.port
                .expect("port required to get to the receiving build method"),
            self.baud,
        )?;
        Ok(ReceiverDaemon {
            profile,
            layout: self
                .receiver_layout
                .expect("layout required to get to the receiving build method"),
            timeouts: self.timeouts,
            pacing: self.pacing,
            post_create: self.post_create,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_both_roles() {
        let sender = DaemonBuilder::new()
            .with_port("/dev/ttyUSB0")
            .baud(115_200)
            .sending(SenderLayout::under("/srv/diode", "/var/cache/diode"))
            .build();
        assert!(sender.is_ok());

        let receiver = DaemonBuilder::new()
            .with_port("/dev/ttyUSB0")
            .receiving(ReceiverLayout::new("/var/tmp/diode", "/srv/outgoing"))
            .build();
        assert!(receiver.is_ok());
    }

    #[test]
    fn rejects_out_of_range_baud() {
        let err = DaemonBuilder::new()
            .with_port("/dev/ttyUSB0")
            .baud(50)
            .sending(SenderLayout::under("/srv/diode", "/var/cache/diode"))
            .build();
        assert!(err.is_err());
    }
}
