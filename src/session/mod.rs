pub mod handler;
pub mod messages;
pub mod role;
pub mod transport;

pub use handler::{ClientSession, ReplySender, SessionContext, RESTART_SIMULATION};
pub use messages::{
    CalibrationView, CloseReason, ConnectionView, ErrorKind, Inbound, InboundError, Outbound,
    SampleView, StatusView,
};
pub use role::{Role, RoleLookup, UserDirectory, UserProvisioner};
pub use transport::{run_session, ChannelPeer, ChannelTransport, ClientTransport, PeerEvent};
