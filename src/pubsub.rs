//! C5: a generic pub/sub endpoint over a [`Connection`].
//!
//! Subscriptions are stored as type-erased handlers keyed by `KK`; each
//! `subscribe::<P, _, _>` call captures how to decode a specific payload
//! type `P` once, at registration time, so the dispatch loop itself only
//! ever deals in raw bytes. This is the same mechanism the RPC layer (C6)
//! builds its method table on top of, with `P = (Option<Key<...>>, Vec<u8>)`
//! — mirrors the original implementation, where `add_method`'s handler is
//! just a subscription whose argument pack happens to be
//! `(optional<key_type>, string)`.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec;
use crate::connection::Connection;
use crate::error::Error;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Handler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;
type DefaultHandler<KK> = Arc<dyn Fn(KK, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// The bound a pub/sub topic key must satisfy.
pub trait Topic: Clone + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + 'static {}
impl<T> Topic for T where T: Clone + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + 'static
{}

struct Table<KK> {
    handlers: HashMap<KK, Handler>,
    default: Option<DefaultHandler<KK>>,
}

struct PubSubInner<KK, S> {
    connection: Connection<S>,
    table: crate::async_mutex::AsyncMutex<Table<KK>>,
}

/// A cheaply-cloneable handle to a pub/sub endpoint. Cloning shares the same
/// underlying connection and subscription table; every clone sees every
/// other clone's `subscribe`/`publish` calls.
pub struct PubSubEndpoint<KK, S> {
    inner: Arc<PubSubInner<KK, S>>,
}

impl<KK, S> Clone for PubSubEndpoint<KK, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<KK, S> PubSubEndpoint<KK, S>
where
    KK: Topic,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(socket: S) -> Self {
        let connection = Connection::new(socket);
        let table = crate::async_mutex::AsyncMutex::new(Table {
            handlers: HashMap::new(),
            default: None,
        });
        Self {
            inner: Arc::new(PubSubInner { connection, table }),
        }
    }

    /// Register (or replace) the handler for `key`. The payload is decoded
    /// as `P` once per received envelope, only for this key.
    pub async fn subscribe<P, F, Fut>(&self, key: KK, f: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(move |payload: Vec<u8>| -> BoxFuture<'static, ()> {
            match codec::deserialize::<P>(&payload) {
                Ok(args) => Box::pin(f(args)),
                Err(err) => {
                    tracing::warn!(%err, "failed to deserialize subscription payload, dropping envelope");
                    Box::pin(async {})
                }
            }
        });
        let mut table = self.inner.table.lock().await;
        table.handlers.insert(key, wrapped);
    }

    pub async fn unsubscribe(&self, key: &KK) {
        let mut table = self.inner.table.lock().await;
        table.handlers.remove(key);
    }

    /// Register the handler invoked for any key with no specific
    /// subscription. Replaces any previously-registered default handler.
    pub async fn subscribe_default<P, F, Fut>(&self, f: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(KK, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: DefaultHandler<KK> =
            Arc::new(move |key: KK, payload: Vec<u8>| -> BoxFuture<'static, ()> {
                match codec::deserialize::<P>(&payload) {
                    Ok(args) => Box::pin(f(key, args)),
                    Err(err) => {
                        tracing::warn!(%err, "failed to deserialize default-handler payload, dropping envelope");
                        Box::pin(async {})
                    }
                }
            });
        let mut table = self.inner.table.lock().await;
        table.default = Some(wrapped);
    }

    /// Serialize `args` and publish it as the payload for `key`.
    pub async fn publish<P: Serialize>(&self, key: KK, args: P) -> Result<(), Error> {
        let payload = codec::serialize(&args)?;
        self.inner.connection.send(&(key, payload)).await
    }

    /// Drive the receive loop: read one envelope at a time, and dispatch
    /// each to its handler (or the default handler, or drop it) on its own
    /// spawned task so a slow or panicking handler never blocks the next
    /// receive. Returns once the connection is no longer open.
    pub async fn run(&self) {
        tracing::debug!("pubsub receive loop starting");
        loop {
            if !self.is_open() {
                break;
            }
            match self.inner.connection.receive::<(KK, Vec<u8>)>().await {
                Ok((key, payload)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let handle = tokio::spawn(this.dispatch_one(key, payload));
                        match handle.await {
                            Ok(()) => {}
                            Err(join_err) if join_err.is_panic() => {
                                tracing::warn!("subscription handler panicked");
                            }
                            Err(_) => {}
                        }
                    });
                }
                Err(_) => break,
            }
        }
        self.close();
        tracing::debug!("pubsub receive loop exited");
    }

    async fn dispatch_one(self, key: KK, payload: Vec<u8>) {
        let handler = {
            let table = self.inner.table.lock().await;
            table.handlers.get(&key).cloned()
        };
        if let Some(handler) = handler {
            handler(payload).await;
            return;
        }
        let default = {
            let table = self.inner.table.lock().await;
            table.default.clone()
        };
        match default {
            Some(default) => default(key, payload).await,
            None => tracing::debug!("no handler and no default handler installed, dropping envelope"),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.connection.is_open()
    }

    pub fn close(&self) {
        self.inner.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::duplex;

    #[tokio::test]
    async fn subscriber_receives_published_value() {
        let (a, b) = duplex(256);
        let endpoint_a: PubSubEndpoint<String, _> = PubSubEndpoint::new(a);
        let endpoint_b: PubSubEndpoint<String, _> = PubSubEndpoint::new(b);

        let received = Arc::new(AtomicU32::new(0));
        let received_clone = received.clone();
        endpoint_b
            .subscribe::<u32, _, _>("topic".to_string(), move |value| {
                let received = received_clone.clone();
                async move {
                    received.store(value, Ordering::SeqCst);
                }
            })
            .await;

        let runner = tokio::spawn(async move { endpoint_b.run().await });
        endpoint_a.publish("topic".to_string(), 99u32).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(received.load(Ordering::SeqCst), 99);
        endpoint_a.close();
        let _ = runner.await;
    }

    #[tokio::test]
    async fn unknown_key_falls_through_to_default_handler() {
        let (a, b) = duplex(256);
        let endpoint_a: PubSubEndpoint<String, _> = PubSubEndpoint::new(a);
        let endpoint_b: PubSubEndpoint<String, _> = PubSubEndpoint::new(b);

        let seen_key = Arc::new(tokio::sync::Mutex::new(None));
        let seen_key_clone = seen_key.clone();
        endpoint_b
            .subscribe_default::<u32, _, _>(move |key, _value| {
                let seen_key = seen_key_clone.clone();
                async move {
                    *seen_key.lock().await = Some(key);
                }
            })
            .await;

        let runner = tokio::spawn(async move { endpoint_b.run().await });
        endpoint_a.publish("unregistered".to_string(), 1u32).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen_key.lock().await.as_deref(), Some("unregistered"));
        endpoint_a.close();
        let _ = runner.await;
    }
}
