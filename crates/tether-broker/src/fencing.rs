//! Ownership transitions for a single resource.
//!
//! Ownership is a compare-and-swap on `(owner, generation)` under the
//! resource's own lock. Holding `(identity, generation)` proves ownership only
//! while `generation` is current, so a delayed release from an evicted client
//! can never revoke a later owner.

use crate::registry::ResourceRegistry;
use crate::session::SessionId;
use tether::protocol::FencingToken;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcquireError {
    #[error("unknown resource {0}")]
    UnknownResource(String),
    #[error("resource {name} is owned by session {owner}")]
    AlreadyOwned { name: String, owner: SessionId },
    #[error("broker is not granting new ownership")]
    NotAccepting,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("unknown resource {0}")]
    UnknownResource(String),
    #[error("resource {0} is not owned by the requester")]
    NotOwner(String),
    #[error("identity token does not match resource {0}")]
    IdentityMismatch(String),
    #[error("stale generation {presented} for resource {name} (current {current})")]
    StaleGeneration {
        name: String,
        presented: u64,
        current: u64,
    },
}

/// Grant `requester` ownership of an unowned resource.
///
/// The generation is left as is: nothing held the resource, so there is no
/// earlier token to invalidate.
pub fn try_acquire(
    registry: &dyn ResourceRegistry,
    name: &str,
    requester: SessionId,
) -> Result<FencingToken, AcquireError> {
    let resource = registry
        .lookup(name)
        .ok_or_else(|| AcquireError::UnknownResource(name.to_string()))?;
    let mut ownership = resource.lock();
    if let Some(owner) = ownership.owner {
        return Err(AcquireError::AlreadyOwned {
            name: name.to_string(),
            owner,
        });
    }
    ownership.owner = Some(requester);
    Ok(FencingToken {
        identity: resource.identity().clone(),
        generation: ownership.generation,
    })
}

/// Release a resource on behalf of its owner. Returns the new generation.
///
/// Every check happens before any write; a rejected release changes nothing.
pub fn try_release(
    registry: &dyn ResourceRegistry,
    name: &str,
    token: &FencingToken,
    requester: SessionId,
) -> Result<u64, ReleaseError> {
    let resource = registry
        .lookup(name)
        .ok_or_else(|| ReleaseError::UnknownResource(name.to_string()))?;
    let mut ownership = resource.lock();
    if ownership.owner != Some(requester) {
        return Err(ReleaseError::NotOwner(name.to_string()));
    }
    if token.identity != *resource.identity() {
        return Err(ReleaseError::IdentityMismatch(name.to_string()));
    }
    if token.generation != ownership.generation {
        return Err(ReleaseError::StaleGeneration {
            name: name.to_string(),
            presented: token.generation,
            current: ownership.generation,
        });
    }
    ownership.owner = None;
    ownership.generation += 1;
    Ok(ownership.generation)
}

/// Reclaim a resource from a dying session. Returns the new generation, or
/// `None` when `holder` did not own it.
pub fn force_release(registry: &dyn ResourceRegistry, name: &str, holder: SessionId) -> Option<u64> {
    let resource = registry.lookup(name)?;
    let mut ownership = resource.lock();
    if ownership.owner != Some(holder) {
        return None;
    }
    ownership.owner = None;
    ownership.generation += 1;
    Some(ownership.generation)
}
