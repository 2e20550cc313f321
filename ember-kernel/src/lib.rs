//! Ember Kernel - protocol core for a notebook-style kernel runtime.
//!
//! Mediates between interactive front-ends speaking the multi-socket
//! messaging protocol and a pluggable interpreter backend that executes
//! user code.
//!
//! # Responsibilities
//!
//! - **Authenticate**: keyed MAC over every signed wire section
//! - **Route**: handler table over the twelve routable message types on the
//!   shell and control channels
//! - **Bracket**: exactly one busy/idle status pair per dispatched request
//! - **Correlate**: replies carry the request's identities and header
//! - **Multiplex**: comm sessions between front-ends and the interpreter
//!
//! # Boundaries
//!
//! Socket bring-up, polling, and queueing belong to the [`Transport`]
//! collaborator; executing user code belongs to the [`Interpreter`]
//! collaborator. The heartbeat channel is a pure echo loop and never
//! reaches this crate.

pub mod comm;
pub mod config;
pub mod dispatch;
pub mod interpreter;
pub mod logging;
pub mod protocol;
pub mod transport;

use std::sync::Arc;

use uuid::Uuid;

pub use config::{ControlChannel, KernelConfig};
pub use dispatch::{Channel, KernelCore, KernelIdentity};
pub use interpreter::{Interpreter, KernelHandle};
pub use protocol::{Authenticator, SignatureScheme, PROTOCOL_VERSION};
pub use transport::Transport;

/// An assembled kernel: the protocol core wired to its collaborators.
///
/// Construction registers the transport listeners and hands the interpreter
/// its upcall capability; afterwards the transport drives everything.
/// Diagnostics are the caller's concern ([`logging::init_diagnostics`]).
pub struct Kernel {
    core: Arc<KernelCore>,
}

impl Kernel {
    pub fn new(
        config: KernelConfig,
        transport: Arc<dyn Transport>,
        interpreter: Box<dyn Interpreter>,
    ) -> Self {
        let identity = KernelIdentity {
            kernel_id: config.kernel_id,
            user_name: config.user_name,
            // Fresh per process launch; nothing else survives a restart.
            session_id: Uuid::new_v4().to_string(),
        };
        let auth = Authenticator::new(config.session_key, config.signature_scheme);
        let core = KernelCore::new(identity, auth, config.control_channel, transport, interpreter);
        core.start();
        Self { core }
    }

    pub fn core(&self) -> &Arc<KernelCore> {
        &self.core
    }
}
