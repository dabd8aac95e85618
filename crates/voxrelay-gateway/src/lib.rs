//! voxrelay gateway: WebSocket server, transport channels, and per-session
//! voice pipelines.
//!
//! Each connection gets a [`TransportChannel`] feeding one session task.
//! The session drives transcription, reply generation, and streaming
//! synthesis, and the [`SessionRegistry`] tracks live sessions.

pub mod channel;
pub mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;

pub use channel::{ChannelEvent, FrameDecoder, OutboundSender, TransportChannel};
pub use pipeline::SessionServices;
pub use registry::{SessionHandle, SessionRegistry};
pub use server::{router, serve, start_gateway};
pub use state::GatewayState;
