//! Keeps a consumer-side mirror of a streamed scene graph in sync with the producer that owns it.
//!
//! The [`manager::SceneManager`] runs the producer on its own thread: it traverses a
//! [`source::SceneSource`] and hands batches of [`commands::Command`]s to the consumer. The
//! consumer ticks a [`dispatch::Dispatcher`] that turns those into proxies, built through the
//! factories of the [`registry::factory::FactoryRegistry`] and tracked per path in the
//! [`registry::PathIdentityRegistry`].

pub mod builder;
pub mod commands;
pub mod demos;
pub mod dispatch;
pub mod graph;
pub mod manager;
pub mod registry;
pub mod settings;
pub mod source;
pub mod util;
