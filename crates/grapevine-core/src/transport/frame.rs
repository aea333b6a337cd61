//! Wire envelope and routes

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Destination of a request on the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Route {
    Gossip,
    SearchResult,
    Invite,
    SendState,
    Create,
    CreateArray,
    CreateMap,
    Set,
    SetMap,
    Append,
    ChangeOwner,
    Join,
    Leave,
}

impl Route {
    /// Canonical path, used in logs
    pub const fn path(&self) -> &'static str {
        match self {
            Route::Gossip => "/gossip",
            Route::SearchResult => "/searchresult",
            Route::Invite => "/shareddata/invite",
            Route::SendState => "/shareddata/sendstate",
            Route::Create => "/shareddata/create",
            Route::CreateArray => "/shareddata/createarray",
            Route::CreateMap => "/shareddata/createmap",
            Route::Set => "/shareddata/set",
            Route::SetMap => "/shareddata/setmap",
            Route::Append => "/shareddata/append",
            Route::ChangeOwner => "/shareddata/changeowner",
            Route::Join => "/shareddata/join",
            Route::Leave => "/shareddata/leave",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Request envelope: the route plus the postcard-encoded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    pub route: Route,
    pub body: Vec<u8>,
}

impl WireRequest {
    /// Encode request to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode request from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }
}

/// Response envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireResponse {
    /// Postcard-encoded response message
    Ok(Vec<u8>),
    /// The handler failed; carries its error message
    Err(String),
}

impl WireResponse {
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }
}

/// Empty acknowledgement returned by routes with nothing to report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack;

pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed(stream: TcpStream, max_frame_bytes: usize) -> FramedStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec();
    Framed::new(stream, codec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_paths() {
        assert_eq!(Route::Gossip.to_string(), "/gossip");
        assert_eq!(Route::SetMap.path(), "/shareddata/setmap");
        assert_eq!(Route::Leave.path(), "/shareddata/leave");
    }

    #[test]
    fn test_request_envelope_roundtrip() {
        let req = WireRequest {
            route: Route::Append,
            body: vec![1, 2, 3],
        };
        let decoded = WireRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_truncated_response_fails() {
        let bytes = WireResponse::Err("boom".into()).encode().unwrap();
        assert!(WireResponse::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
