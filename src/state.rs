use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::TokenValidator;
use crate::config::Config;
use crate::durable::DurableProducer;
use crate::pipeline::MessagePipeline;
use crate::presence::PresenceEmitter;
use crate::pubsub::PubSubHub;
use crate::registry::ConnectionRegistry;

/// Shared application state passed to the upgrade handler and HTTP routes.
///
/// Built in two stages to break the circular dependency between the
/// registry and the pipeline: the registry and the auth/durable/pubsub
/// clients come up first, then the pipeline is constructed with an `Arc` to
/// the already-live registry, and finally this struct bundles everything
/// the orchestrator needs.
///
/// `shutdown` is the orchestrator's cancellation token; every connection
/// derives a child token from it so a single `cancel()` call propagates to
/// every read/write/heartbeat pump. `connection_tasks` lets
/// the orchestrator wait for those pumps to actually finish, bounded by
/// `config.connection_close_budget`, instead of just hoping they exit
/// promptly.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub auth: Arc<dyn TokenValidator>,
    pub registry: Arc<ConnectionRegistry>,
    pub pipeline: Arc<MessagePipeline>,
    pub presence: Arc<PresenceEmitter>,
    pub durable: Arc<dyn DurableProducer>,
    pub pubsub: Arc<dyn PubSubHub>,
    pub shutdown: CancellationToken,
    pub connection_tasks: TaskTracker,
}
