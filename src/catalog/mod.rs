// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Authorization core: database objects, the grantee graph, and the
//! catalog lock discipline.

pub use self::grantee::*;
pub use self::locks::*;
pub use self::object::*;

mod grantee;
mod locks;
mod object;

/// The error type of catalog operations.
#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),
    #[error("duplicated {0}: {1}")]
    Duplicated(&'static str, String),
    #[error("granting role {0} to {1} creates a cycle in the grantee graph")]
    CycleDetected(String, String),
    #[error("{0} is a user and cannot be granted as a role")]
    NotARole(String),
    #[error("{0} has no privileges on {1}")]
    PermissionDenied(String, String),
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
