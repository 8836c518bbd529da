//! # beacon-core - Shared domain types
//!
//! Types shared between the REST API, the CDC pipeline and the realtime
//! fan-out: the `users` sample resource, its request DTOs, and the closed
//! set of application events pushed to live clients.

mod event;
mod user;

pub use event::{user_room, DomainEvent};
pub use user::{
    CreateUserRequest, UpdateUserRequest, User, UserRole, UserStatus, ValidationError,
};
