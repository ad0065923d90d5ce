//! Callback registry: data type -> typed handler.
//!
//! One registration per data type; registering again replaces the previous
//! handler. The map sits behind a lock so registrations made after
//! `connect()` are seen by the receive loop. Handlers are cloned out of the
//! lock before they run.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use od4_protocol::Envelope;
use prost::Message;

use crate::DispatchError;

/// `[sent, received, sampleTimeStamp]` as wall-clock instants.
pub type Timestamps = [DateTime<Utc>; 3];

/// Work item handed to the executor for one dispatch.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Catch-all handler receiving every decoded Envelope.
pub type EnvelopeHandler = dyn Fn(Envelope) + Send + Sync + 'static;

/// A registered handler for one data type.
pub trait Callback: Send + Sync {
    /// Decode the envelope payload and bind it to the handler.
    ///
    /// Decoding happens here so a malformed payload is reported for this
    /// frame without spawning anything.
    fn prepare(&self, envelope: &Envelope, timestamps: Timestamps) -> Result<Job, DispatchError>;
}

struct TypedCallback<T, F, A> {
    handler: Arc<F>,
    extra: A,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F, A> Callback for TypedCallback<T, F, A>
where
    T: Message + Default + Send + 'static,
    F: Fn(T, Timestamps, A) + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    fn prepare(&self, envelope: &Envelope, timestamps: Timestamps) -> Result<Job, DispatchError> {
        let payload: T = envelope
            .payload()
            .map_err(|source| DispatchError::Payload {
                data_type: envelope.data_type,
                source,
            })?;
        let handler = Arc::clone(&self.handler);
        let extra = self.extra.clone();
        Ok(Box::new(move || (*handler)(payload, timestamps, extra)))
    }
}

#[derive(Default)]
struct Entries {
    by_type: HashMap<u32, Arc<dyn Callback>>,
    catch_all: Option<Arc<EnvelopeHandler>>,
}

/// Shared, cloneable handle to the registry.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    inner: Arc<RwLock<Entries>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `data_type`; the payload is decoded as `T`.
    pub fn register<T, F>(&self, data_type: u32, handler: F)
    where
        T: Message + Default + Send + 'static,
        F: Fn(T, Timestamps) + Send + Sync + 'static,
    {
        self.register_with(
            data_type,
            move |payload: T, ts: Timestamps, _: ()| handler(payload, ts),
            (),
        );
    }

    /// Register `handler` for `data_type` with an extra argument passed on
    /// every invocation.
    pub fn register_with<T, F, A>(&self, data_type: u32, handler: F, extra: A)
    where
        T: Message + Default + Send + 'static,
        F: Fn(T, Timestamps, A) + Send + Sync + 'static,
        A: Clone + Send + Sync + 'static,
    {
        let callback = TypedCallback {
            handler: Arc::new(handler),
            extra,
            _payload: PhantomData::<fn() -> T>,
        };
        let replaced = self
            .write()
            .by_type
            .insert(data_type, Arc::new(callback))
            .is_some();
        tracing::debug!(data_type, replaced, "registered message callback");
    }

    /// Remove the handler for `data_type`. Returns whether one existed.
    pub fn unregister(&self, data_type: u32) -> bool {
        self.write().by_type.remove(&data_type).is_some()
    }

    pub fn set_catch_all<F>(&self, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.write().catch_all = Some(Arc::new(handler));
    }

    pub fn clear_catch_all(&self) {
        self.write().catch_all = None;
    }

    pub fn lookup(&self, data_type: u32) -> Option<Arc<dyn Callback>> {
        self.read().by_type.get(&data_type).cloned()
    }

    pub fn catch_all(&self) -> Option<Arc<EnvelopeHandler>> {
        self.read().catch_all.clone()
    }

    pub fn contains(&self, data_type: u32) -> bool {
        self.read().by_type.contains_key(&data_type)
    }

    pub fn len(&self) -> usize {
        self.read().by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Handlers never run under the lock, so a poisoned lock still holds a
    // consistent map.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Entries> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Entries> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
