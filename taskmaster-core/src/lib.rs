mod client;
mod entity;

pub use client::{ApiErrorClass, GatewayError, GatewayOp, TaskmasterClient};
pub use entity::{EntityKind, UnknownEntityKind, entity_id};
