//! Domain layer for the workflow core.
//!
//! This crate provides the core domain abstractions including:
//! - [`DomainEvent`] and [`Aggregate`] traits for event-sourced entities
//! - [`AggregateRoot`] which records, releases and replays events
//! - [`Repository`] which loads aggregates from the store, appends their new
//!   events with a version check and publishes them on the event bus

pub mod aggregate;
pub mod error;
pub mod repository;

pub use aggregate::{Aggregate, AggregateRoot, DomainEvent};
pub use error::DomainError;
pub use repository::{CommandResult, EventContext, Repository};
