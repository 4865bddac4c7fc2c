//! The engine contract and scoped takeover of its stream callback slot.

use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use crate::error::ServeError;

use super::request::{Request, RequestStreamOutput};

/// Receives every batch of stream events the engine produces.
///
/// Invoked synchronously from inside [`GenerationEngine::step`], zero or more
/// times per step, never concurrently.
pub type RequestStreamCallback = Rc<dyn Fn(&[RequestStreamOutput])>;

/// A step-driven token generation engine.
///
/// The engine owns scheduling, batching and the KV cache. Its only way of
/// reporting progress is the single installed [`RequestStreamCallback`].
/// Construction takes the place of a separate `init` call.
pub trait GenerationEngine {
    /// Enqueue a request.
    fn add_request(&mut self, request: Request) -> Result<(), ServeError>;

    /// Cancel a request out of band.
    fn abort_request(&mut self, request_id: &str) -> Result<(), ServeError>;

    /// Advance by one unit of work, delivering any resulting events to the
    /// installed callback before returning.
    fn step(&mut self) -> Result<(), ServeError>;

    /// The currently installed callback.
    fn request_stream_callback(&self) -> Option<RequestStreamCallback>;

    /// Replace the installed callback.
    fn set_request_stream_callback(&mut self, callback: Option<RequestStreamCallback>);

    /// Runtime statistics as a JSON object.
    fn stats(&self) -> Result<String, ServeError>;

    /// Drop all request state.
    fn reset(&mut self) -> Result<(), ServeError>;
}

/// Installs a callback for the lifetime of the guard.
///
/// The previously installed callback is captured on [`install`](Self::install)
/// and put back when the guard drops, whether the scope exits normally,
/// through `?`, or by unwinding. The guard dereferences to the engine so the
/// caller keeps driving it while the takeover is active.
pub struct CallbackGuard<'a, E: GenerationEngine + ?Sized> {
    engine: &'a mut E,
    previous: Option<Option<RequestStreamCallback>>,
}

impl<'a, E: GenerationEngine + ?Sized> CallbackGuard<'a, E> {
    pub fn install(engine: &'a mut E, callback: RequestStreamCallback) -> Self {
        let previous = engine.request_stream_callback();
        engine.set_request_stream_callback(Some(callback));
        Self {
            engine,
            previous: Some(previous),
        }
    }
}

impl<E: GenerationEngine + ?Sized> Deref for CallbackGuard<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.engine
    }
}

impl<E: GenerationEngine + ?Sized> DerefMut for CallbackGuard<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        self.engine
    }
}

impl<E: GenerationEngine + ?Sized> Drop for CallbackGuard<'_, E> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.engine.set_request_stream_callback(previous);
        }
    }
}
