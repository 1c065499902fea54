//! Nodes bound to the server they run on.

use std::fmt;
use std::sync::Arc;

use crate::engine::NodeHandle;
use crate::error::Result;
use crate::remote::{ChildProcess, CommandRunner, ExecutionResult, RunOptions};
use crate::server::Server;
use crate::topology::{NodeRole, VirtualNode};

/// Something that runs commands on a cluster server.
pub trait RemoteExecutable {
    fn server(&self) -> &Server;

    fn runner(&self) -> &dyn CommandRunner;

    fn handle(&self) -> NodeHandle;

    /// Runs `command` as root in the server's root namespace.
    fn rcmd(&self, command: &str) -> Result<ExecutionResult> {
        self.runner().run(self.server(), command, RunOptions::root())
    }

    /// Runs `command` as root inside the node's own namespace.
    fn cmd(&self, command: &str) -> Result<ExecutionResult> {
        self.runner()
            .run(self.server(), &self.handle().wrap(command), RunOptions::root())
    }

    /// Starts a long-lived command on the node's server.
    fn popen(&self, command: &str, opts: RunOptions) -> Result<Box<dyn ChildProcess>> {
        self.runner().spawn(self.server(), command, opts)
    }
}

/// A materialised node together with its server and the engine's handle.
#[derive(Clone)]
pub struct RemoteNode {
    node: VirtualNode,
    server: Server,
    handle: NodeHandle,
    runner: Arc<dyn CommandRunner>,
}

impl RemoteNode {
    pub fn new(
        node: VirtualNode,
        server: Server,
        handle: NodeHandle,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            node,
            server,
            handle,
            runner,
        }
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn role(&self) -> NodeRole {
        self.node.role()
    }

    pub fn node(&self) -> &VirtualNode {
        &self.node
    }
}

impl RemoteExecutable for RemoteNode {
    fn server(&self) -> &Server {
        &self.server
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    fn handle(&self) -> NodeHandle {
        self.handle
    }
}

impl fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteNode")
            .field("node", &self.node)
            .field("server", &self.server.name())
            .field("handle", &self.handle)
            .finish()
    }
}
