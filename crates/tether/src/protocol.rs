use std::fmt;
use std::time::Duration;
use tether_proto::v1 as pb;
use tether_proto::{ConnectionMessage, MessageType};
use thiserror::Error;

/// Silence after which the broker presumes a session dead.
pub const LIVENESS_WINDOW: Duration = Duration::from_millis(7_000);

/// Maximum size of a single encoded frame on the broker socket (64 KiB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Error text sent when an ownership request is refused.
pub const RESOURCE_NOT_GIVEN: &str = "Resource could not be given";

/// Error text sent when a terminate request fails the fencing check.
pub const CANNOT_TERMINATE: &str = "Cannot terminate connection from resource";

// ---------------------------------------------------------------------------
// Fencing tokens
// ---------------------------------------------------------------------------

/// Opaque identity of one resource record.
///
/// Assigned when the registry creates the record and constant for its lifetime,
/// so a record recreated under the same name is distinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl From<String> for IdentityToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof of ownership at one point in time.
///
/// Valid only while `generation` still equals the resource's current generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencingToken {
    pub identity: IdentityToken,
    pub generation: u64,
}

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

/// A message sent from a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask whether the broker is handing out ownership.
    Connection,
    /// Ask for exclusive ownership of a resource.
    ResourceOwnership { resource_name: String },
    /// Give a resource back, proving ownership with a fencing token.
    TerminateConnection {
        resource_name: String,
        token: FencingToken,
    },
    /// Keep-alive. Never answered.
    Heartbeat,
}

/// A message sent from the broker to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Connection {
        confirm: bool,
    },
    ResourceOwnership {
        resource_name: String,
        outcome: Result<FencingToken, String>,
    },
    TerminateConnection {
        resource_name: String,
        outcome: Result<(), String>,
    },
}

/// A frame that cannot be mapped onto the message set its receiver expects.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message carries no payload")]
    Empty,
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
}

fn kind_name(kind: &MessageType) -> &'static str {
    match kind {
        MessageType::ConnectionRequest(_) => "connection_request",
        MessageType::ConnectionResponse(_) => "connection_response",
        MessageType::ResourceOwnershipRequest(_) => "resource_ownership_request",
        MessageType::ResourceOwnershipResponse(_) => "resource_ownership_response",
        MessageType::TerminateConnectionRequest(_) => "terminate_connection_request",
        MessageType::TerminateConnectionResponse(_) => "terminate_connection_response",
        MessageType::Heartbeat(_) => "heartbeat",
    }
}

impl TryFrom<ConnectionMessage> for Request {
    type Error = ProtocolError;

    fn try_from(msg: ConnectionMessage) -> Result<Self, Self::Error> {
        match msg.message_type.ok_or(ProtocolError::Empty)? {
            MessageType::ConnectionRequest(_) => Ok(Request::Connection),
            MessageType::ResourceOwnershipRequest(req) => Ok(Request::ResourceOwnership {
                resource_name: req.resource_name,
            }),
            MessageType::TerminateConnectionRequest(req) => Ok(Request::TerminateConnection {
                resource_name: req.resource_name,
                token: FencingToken {
                    identity: req.identity_token.into(),
                    generation: req.generation,
                },
            }),
            MessageType::Heartbeat(_) => Ok(Request::Heartbeat),
            other => Err(ProtocolError::Unexpected(kind_name(&other))),
        }
    }
}

impl From<Request> for ConnectionMessage {
    fn from(req: Request) -> Self {
        let kind = match req {
            Request::Connection => MessageType::ConnectionRequest(pb::ConnectionRequest {}),
            Request::ResourceOwnership { resource_name } => {
                MessageType::ResourceOwnershipRequest(pb::ResourceOwnershipRequest {
                    resource_name,
                })
            }
            Request::TerminateConnection {
                resource_name,
                token,
            } => MessageType::TerminateConnectionRequest(pb::TerminateConnectionRequest {
                resource_name,
                identity_token: token.identity.0,
                generation: token.generation,
            }),
            Request::Heartbeat => MessageType::Heartbeat(pb::Heartbeat {}),
        };
        ConnectionMessage {
            message_type: Some(kind),
        }
    }
}

impl TryFrom<ConnectionMessage> for Response {
    type Error = ProtocolError;

    fn try_from(msg: ConnectionMessage) -> Result<Self, Self::Error> {
        match msg.message_type.ok_or(ProtocolError::Empty)? {
            MessageType::ConnectionResponse(resp) => Ok(Response::Connection {
                confirm: resp.confirm,
            }),
            MessageType::ResourceOwnershipResponse(resp) => {
                let outcome = if resp.confirm {
                    Ok(FencingToken {
                        identity: resp.identity_token.into(),
                        generation: resp.generation,
                    })
                } else {
                    Err(resp.error.unwrap_or_default())
                };
                Ok(Response::ResourceOwnership {
                    resource_name: resp.resource_name,
                    outcome,
                })
            }
            MessageType::TerminateConnectionResponse(resp) => {
                let outcome = if resp.confirm {
                    Ok(())
                } else {
                    Err(resp.error.unwrap_or_default())
                };
                Ok(Response::TerminateConnection {
                    resource_name: resp.resource_name,
                    outcome,
                })
            }
            other => Err(ProtocolError::Unexpected(kind_name(&other))),
        }
    }
}

impl From<Response> for ConnectionMessage {
    fn from(resp: Response) -> Self {
        let kind = match resp {
            Response::Connection { confirm } => {
                MessageType::ConnectionResponse(pb::ConnectionResponse { confirm })
            }
            Response::ResourceOwnership {
                resource_name,
                outcome,
            } => {
                let msg = match outcome {
                    Ok(token) => pb::ResourceOwnershipResponse {
                        resource_name,
                        confirm: true,
                        identity_token: token.identity.0,
                        generation: token.generation,
                        error: None,
                    },
                    Err(error) => pb::ResourceOwnershipResponse {
                        resource_name,
                        confirm: false,
                        identity_token: String::new(),
                        generation: 0,
                        error: Some(error),
                    },
                };
                MessageType::ResourceOwnershipResponse(msg)
            }
            Response::TerminateConnection {
                resource_name,
                outcome,
            } => {
                let (confirm, error) = match outcome {
                    Ok(()) => (true, None),
                    Err(error) => (false, Some(error)),
                };
                MessageType::TerminateConnectionResponse(pb::TerminateConnectionResponse {
                    resource_name,
                    confirm,
                    error,
                })
            }
        };
        ConnectionMessage {
            message_type: Some(kind),
        }
    }
}
