use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{NodeId, Request, Response};
use crate::{error::SessionError, session::StateSnapshot};

/// Unidad que viaja por una conexión entre nodos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Hello {
        node: NodeId,
    },
    Request {
        id: u64,
        from: NodeId,
        request: Request,
    },
    Response {
        id: u64,
        result: Result<Response, SessionError>,
    },
    Delta {
        from: NodeId,
        snapshot: StateSnapshot,
    },
}

pub fn encode(frame: &Frame) -> serde_json::Result<Bytes> {
    serde_json::to_vec(frame).map(Bytes::from)
}

pub fn decode(payload: &[u8]) -> serde_json::Result<Frame> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Command, ContextId};
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, GuildId};

    #[test]
    fn error_results_keep_their_kind() {
        let context = ContextId::new(GuildId::new(3), ChannelId::new(4));
        let frame = Frame::Response {
            id: 9,
            result: Err(SessionError::NoSession(context)),
        };
        let back = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn commands_travel_inside_requests() {
        let context = ContextId::new(GuildId::new(3), ChannelId::new(4));
        let frame = Frame::Request {
            id: 1,
            from: NodeId::from("node-1"),
            request: Request::Command {
                context,
                command: Command::MoveBy { offset: -2 },
            },
        };
        let bytes = encode(&frame).unwrap();
        assert_eq!(decode(&bytes).unwrap(), frame);
        assert!(decode(b"{no es json").is_err());
    }
}
