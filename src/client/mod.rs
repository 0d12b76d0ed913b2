//! Asynchronous secure conversation client
//!
//! - [`config`]: [`UascClientConfig`] and its builder
//! - [`handshake`]: Hello / Acknowledge and OpenSecureChannel state machine
//! - [`dispatcher`]: request id allocation and response correlation
//! - [`connection`]: [`UascClient`] handle and the task owning the socket
//! - [`codec`]: [`MessageCodec`] boundary to the service data model
//!
//! # Example
//!
//! ```no_run
//! use opcua_uasc::client::{RawMessage, UascClient, UascClientConfig};
//! use opcua_uasc::encoding::NodeId;
//!
//! # async fn run() -> opcua_uasc::Result<()> {
//! let config = UascClientConfig::builder("opc.tcp://localhost:4840").build()?;
//! let client = UascClient::new(config);
//! client.connect().await?;
//!
//! let response = client
//!     .send(&RawMessage::new(NodeId::ns0(428), vec![0u8; 16]))
//!     .await?;
//! println!("response type {:?}", response.type_id);
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod handshake;

pub use codec::{MessageCodec, RawCodec, RawMessage};
pub use config::{ChannelInactiveListener, UascClientConfig, UascClientConfigBuilder};
pub use connection::{endpoint_address, ChannelStream, UascClient};
pub use dispatcher::{Dispatcher, RequestIdSequence, ResponseHandler};
pub use handshake::{ChannelState, HandshakeController, PendingOpen};
