//! Request guard for applying the rate limiter in front of a handler.
//!
//! The guard is explicit composition: wrap a [`Handler`] in a
//! [`RateLimitGuard`] together with the collaborators that identify the
//! caller's tier and address.

mod service;

pub use service::{
    handler_fn, AddressExtractor, Handler, HandlerFn, RateLimitGuard, RequestContext,
    TierResolver,
};
