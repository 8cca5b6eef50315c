//! C6: a symmetric RPC endpoint layered on top of the generic pub/sub
//! endpoint (C5), exactly as the original implementation layers its IPC
//! endpoint on its pub/sub endpoint: a call is a publish to a named key
//! carrying `(Some(reply_key), args)`, and `add_method` is a subscription
//! whose payload type happens to be `(Option<Key<K>>, Vec<u8>)`.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::codec;
use crate::error::{Error, HostError};
use crate::key::{Key, NamedKey};
use crate::pubsub::PubSubEndpoint;

/// The error type a registered method handler returns on failure. Any
/// `std::error::Error` works; its `Display` text becomes the `HostError`
/// message the caller sees.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A marker return type for methods registered purely for their side
/// effects. `call_no_reply` never allocates a reply key or waits for a
/// response, so there is nothing to deserialize into — this type exists
/// only so the call site reads the same as any other `call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IgnoreResult;

/// The anonymous-key pool (§3/§4.6.5): a monotonic counter, plus the set of
/// previously-allocated keys that have since been released, preferring
/// reuse of the smallest released key over growing the counter.
struct KeyPool {
    next: u64,
    free: BTreeSet<u64>,
}

impl KeyPool {
    fn new() -> Self {
        Self {
            next: 0,
            free: BTreeSet::new(),
        }
    }

    fn allocate(&mut self) -> u64 {
        if let Some(key) = self.free.iter().next().copied() {
            self.free.remove(&key);
            key
        } else {
            let key = self.next;
            self.next += 1;
            key
        }
    }

    fn release(&mut self, key: u64) {
        self.free.insert(key);
    }
}

type PendingReply = oneshot::Sender<(bool, Vec<u8>)>;

struct RpcInner<K: NamedKey, S> {
    pubsub: PubSubEndpoint<Key<K>, S>,
    keypool: crate::async_mutex::AsyncMutex<KeyPool>,
    pending: crate::async_mutex::AsyncMutex<HashMap<u64, PendingReply>>,
}

/// A cheaply-cloneable handle to a symmetric RPC endpoint. Both ends of a
/// connection use the same type: there is no separate client/server type,
/// only whichever of `add_method`/`call` a given side happens to use.
pub struct RpcEndpoint<K: NamedKey, S> {
    inner: Arc<RpcInner<K, S>>,
}

impl<K: NamedKey, S> Clone for RpcEndpoint<K, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, S> RpcEndpoint<K, S>
where
    K: NamedKey,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Build an endpoint from an owned, already-connected socket and install
    /// the default "invalid method key" handler (§4.6.2).
    pub async fn new(socket: S) -> Self {
        let pubsub: PubSubEndpoint<Key<K>, S> = PubSubEndpoint::new(socket);
        let default_pubsub = pubsub.clone();
        pubsub
            .subscribe_default::<(Option<Key<K>>, Vec<u8>), _, _>(move |key, (reply_key, _payload)| {
                let pubsub = default_pubsub.clone();
                async move {
                    let Some(reply_key) = reply_key else {
                        return;
                    };
                    // Only a `Key::Named` miss can reach here. A stray envelope
                    // addressed to an already-released `Key::Anonymous` reply
                    // slot is wire-shaped as `(bool, Vec<u8>)` (see `call`
                    // below), not `(Option<Key<K>>, Vec<u8>)`, so it fails to
                    // decode as this handler's payload type and is dropped by
                    // the pub/sub dispatcher before this closure ever runs.
                    let Key::Named(k) = &key else {
                        return;
                    };
                    let message = format!("Invalid method key `{k}`");
                    tracing::warn!(key = %key, "dispatch to unregistered method key");
                    let _ = pubsub.publish(reply_key, (false, message.into_bytes())).await;
                }
            })
            .await;

        Self {
            inner: Arc::new(RpcInner {
                pubsub,
                keypool: crate::async_mutex::AsyncMutex::new(KeyPool::new()),
                pending: crate::async_mutex::AsyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a method. `Args` is the whole argument pack as a single
    /// serializable type (Rust has no variadic generics, so a tuple stands
    /// in for the original's `Args...`). A panic inside `f`'s future is
    /// caught by the supervising dispatch task and logged; it does not
    /// become a `HostError` reply, since the panicking side has no
    /// well-formed result to report.
    pub async fn add_method<Args, R, F, Fut>(&self, key: K, f: F)
    where
        Args: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        tracing::trace!(method = %key, "registering method");
        let pubsub = self.inner.pubsub.clone();
        let handler_pubsub = pubsub.clone();
        pubsub
            .subscribe::<(Option<Key<K>>, Vec<u8>), _, _>(
                Key::Named(key),
                move |(reply_key, payload): (Option<Key<K>>, Vec<u8>)| {
                    let pubsub = handler_pubsub.clone();
                    let call_result = codec::deserialize::<Args>(&payload).map(|args| f(args));
                    async move {
                        let (success, result): (bool, Vec<u8>) = match call_result {
                            Err(err) => (false, err.to_string().into_bytes()),
                            Ok(fut) => match fut.await {
                                Ok(value) => match codec::serialize(&value) {
                                    Ok(bytes) => (true, bytes),
                                    Err(err) => (false, err.to_string().into_bytes()),
                                },
                                Err(err) => (false, err.to_string().into_bytes()),
                            },
                        };
                        if let Some(reply_key) = reply_key {
                            if !success {
                                tracing::trace!("method call completed with a host error");
                            }
                            if let Err(err) = pubsub.publish(reply_key, (success, result)).await {
                                tracing::warn!(%err, "failed to publish method reply");
                            }
                        }
                    }
                },
            )
            .await;
    }

    pub async fn remove_method(&self, key: K) {
        tracing::trace!(method = %key, "removing method");
        self.inner.pubsub.unsubscribe(&Key::Named(key)).await;
    }

    /// Call a remote method and await its reply.
    ///
    /// Allocates an anonymous reply key, subscribes to it *before* the
    /// request is published (so a same-process loopback reply can never
    /// race ahead of the subscription), then publishes the request. If the
    /// connection closes before a reply arrives, the call resolves to
    /// [`Error::ConnectionClosed`] instead of hanging forever.
    pub async fn call<Args, R>(&self, key: K, args: Args) -> Result<R, Error>
    where
        Args: Serialize,
        R: DeserializeOwned,
    {
        let payload = codec::serialize(&args)?;
        let reply_key = self.allocate_anonymous_key().await;
        let Key::Anonymous(reply_id) = reply_key else {
            unreachable!("allocate_anonymous_key always returns Key::Anonymous")
        };

        let (tx, rx) = oneshot::channel::<(bool, Vec<u8>)>();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(reply_id, tx);
        }

        let pubsub = self.inner.pubsub.clone();
        let handler_pubsub = pubsub.clone();
        let handler_rpc = self.clone();
        let handler_reply_key = reply_key.clone();
        pubsub
            .subscribe::<(bool, Vec<u8>), _, _>(reply_key.clone(), move |(success, result)| {
                let pubsub = handler_pubsub.clone();
                let rpc = handler_rpc.clone();
                let reply_key = handler_reply_key.clone();
                async move {
                    pubsub.unsubscribe(&reply_key).await;
                    rpc.release_anonymous_key(reply_id).await;
                    if let Some(tx) = rpc.take_pending(reply_id).await {
                        let _ = tx.send((success, result));
                    }
                }
            })
            .await;

        tracing::trace!(method = %key, reply_key = %reply_key, "calling method");
        self.inner
            .pubsub
            .publish(Key::Named(key), (Some(reply_key), payload))
            .await?;

        let (success, result) = rx.await.map_err(|_| Error::ConnectionClosed)?;
        if !success {
            let message = String::from_utf8_lossy(&result).into_owned();
            tracing::warn!(%message, "call completed with a host error");
            return Err(Error::Host(HostError(message)));
        }
        Ok(codec::deserialize::<R>(&result)?)
    }

    /// Call a remote method without waiting for (or expecting) a reply.
    /// No reply key is allocated and the request carries `None`, which the
    /// remote's dispatcher reads as "don't bother replying".
    pub async fn call_no_reply<Args>(&self, key: K, args: Args) -> Result<IgnoreResult, Error>
    where
        Args: Serialize,
    {
        let payload = codec::serialize(&args)?;
        tracing::trace!(method = %key, "calling method (no reply)");
        self.inner
            .pubsub
            .publish(Key::Named(key), (Option::<Key<K>>::None, payload))
            .await?;
        Ok(IgnoreResult)
    }

    /// Drive the endpoint's receive loop until the connection closes, then
    /// fail every call still waiting on a reply with
    /// [`Error::ConnectionClosed`] (Open Question #1, resolved as the
    /// graceful-shutdown option).
    pub async fn run(&self) {
        self.inner.pubsub.run().await;
        self.fail_pending().await;
    }

    pub fn is_open(&self) -> bool {
        self.inner.pubsub.is_open()
    }

    /// Close the connection and immediately fail every outstanding call.
    pub async fn close(&self) {
        self.inner.pubsub.close();
        self.fail_pending().await;
    }

    async fn allocate_anonymous_key(&self) -> Key<K> {
        let mut pool = self.inner.keypool.lock().await;
        let id = pool.allocate();
        tracing::trace!(reply_key = id, "allocated anonymous key");
        Key::Anonymous(id)
    }

    async fn release_anonymous_key(&self, id: u64) {
        let mut pool = self.inner.keypool.lock().await;
        pool.release(id);
        tracing::trace!(reply_key = id, "released anonymous key");
    }

    async fn take_pending(&self, id: u64) -> Option<PendingReply> {
        self.inner.pending.lock().await.remove(&id)
    }

    async fn fail_pending(&self) {
        let mut pending = self.inner.pending.lock().await;
        if pending.is_empty() {
            return;
        }
        tracing::debug!(count = pending.len(), "failing pending calls on close");
        for (_, tx) in pending.drain() {
            let _ = tx.send((false, b"connection closed".to_vec()));
        }
    }
}
