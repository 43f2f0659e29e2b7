//! Fixed system owner. The source this system is modeled on scopes every
//! secret lookup to a single hardcoded UUID pending a real identity model;
//! this implementation keeps that behavior rather than inventing tenancy
//! the rest of the system doesn't have.

use uuid::Uuid;

pub const SYSTEM_OWNER: Uuid = Uuid::from_bytes([
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
]);
