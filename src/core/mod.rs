pub mod channel;
pub mod dispatcher;
pub mod framing;
pub mod gateway;
pub mod matcher;
pub mod mediator;
pub mod path_transform;
pub mod request;
pub mod transaction;

pub use channel::{CallerIdentity, Channel, ChannelRegistry, Route};
pub use dispatcher::{DispatchError, DispatchResult, MulticastDispatcher, SecondaryTasks};
pub use gateway::{GatewayError, GatewayService};
pub use matcher::{ChannelMatcher, IngressProtocol, MatchError};
pub use mediator::{MediatorResponse, UpstreamBody};
pub use path_transform::transform_path;
pub use request::{InboundRequest, RoutedResponse};
pub use transaction::{RouteOutcome, TransactionOutcome, TransactionStatus};
