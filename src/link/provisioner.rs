use log::{debug, info, warn};
use std::sync::Arc;

use super::tunnel::establish_tunnel;
use super::{interfaces, pair, CarrierLocks, Link, LinkEndpoint, LinkKind, LinkRealization, TunnelSettings};
use crate::error::Result;
use crate::remote::{Cleanup, CommandRunner};

/// Builds and tears down links between placed nodes.
pub struct LinkProvisioner {
    runner: Arc<dyn CommandRunner>,
    locks: CarrierLocks,
    settings: TunnelSettings,
}

impl LinkProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: TunnelSettings) -> Self {
        Self {
            runner,
            locks: CarrierLocks::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    pub fn establish(&self, a: LinkEndpoint, b: LinkEndpoint) -> Result<Link> {
        let runner = self.runner.as_ref();
        let kind = LinkKind::decide(&a.server, &b.server);
        debug!("{} <-> {}: {}", a, b, kind);

        let realization = match kind {
            LinkKind::LocalPair => {
                pair::create_pair(runner, &a.server, &a, &b, &self.settings.migration)?;
                LinkRealization::LocalPair
            }
            LinkKind::RemotePair => {
                pair::create_pair(runner, &a.server, &a, &b, &self.settings.migration)?;
                LinkRealization::RemotePair(a.server.clone())
            }
            LinkKind::Tunnel => {
                let tunnel = establish_tunnel(runner, &self.locks, &self.settings, &a, &b)?;
                info!("Tunnel {} <-> {} is up (pid {})", a, b, tunnel.pid());
                LinkRealization::Tunnel(tunnel)
            }
        };
        Ok(Link::new(a, b, realization))
    }

    /// Removes a link. Calling it again on the same link does nothing.
    /// Teardown commands still run after the runner has been cancelled.
    pub fn teardown(&self, link: &Link) -> Result<()> {
        if !link.begin_teardown() {
            return Ok(());
        }
        let cleanup = Cleanup::new(self.runner.as_ref());
        let runner: &dyn CommandRunner = &cleanup;
        match &link.realization {
            LinkRealization::LocalPair | LinkRealization::RemotePair(_) => {
                let end = &link.endpoint1;
                pair::delete_pair(runner, &end.server, end)?;
            }
            LinkRealization::Tunnel(tunnel) => {
                tunnel.terminate()?;
                for end in [&link.endpoint1, &link.endpoint2] {
                    if !interfaces::delete_stale(runner, &end.server, end.namespace, &end.interface)? {
                        warn!("{} was already gone", end);
                    }
                }
            }
        }
        debug!("Removed {}", link);
        Ok(())
    }
}
