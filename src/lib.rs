//! A symmetric, bidirectional pub/sub RPC library over a duplex byte
//! stream.
//!
//! Either side of a connected socket can publish, subscribe, register a
//! method, or call one — there is no client/server distinction baked into
//! the types. Build an [`RpcEndpoint`] from any owned, connected
//! `AsyncRead + AsyncWrite` socket (a `TcpStream`, a `UnixStream`, a
//! `tokio::io::DuplexStream` in tests, ...), register methods with
//! [`RpcEndpoint::add_method`], drive the connection with
//! [`RpcEndpoint::run`], and call the other side with
//! [`RpcEndpoint::call`].
//!
//! ```no_run
//! use wirecall_rpc::RpcEndpoint;
//!
//! # async fn doc(socket: tokio::net::TcpStream) -> Result<(), wirecall_rpc::Error> {
//! let endpoint: RpcEndpoint<String, _> = RpcEndpoint::new(socket).await;
//! endpoint
//!     .add_method::<(i64, i64), i64, _, _>("sum".to_string(), |(a, b)| async move { Ok(a + b) })
//!     .await;
//!
//! let running = endpoint.clone();
//! tokio::spawn(async move { running.run().await });
//!
//! let total: i64 = endpoint.call("sum".to_string(), (1, 2)).await?;
//! assert_eq!(total, 3);
//! # Ok(())
//! # }
//! ```

mod async_mutex;
mod codec;
mod connection;
mod error;
mod key;
mod pubsub;
mod rpc;
mod transport;

pub use connection::Connection;
pub use error::{Error, HostError};
pub use key::{Key, NamedKey};
pub use pubsub::{PubSubEndpoint, Topic};
pub use rpc::{HandlerError, IgnoreResult, RpcEndpoint};
