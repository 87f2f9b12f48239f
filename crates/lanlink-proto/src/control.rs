//! Control messages carried inside frames
//!
//! Layout of a control payload:
//!
//! ```text
//! +-----------+-----------+-------------+------------------+
//! | zeros (6) | action(5) | operator(2) | body (UTF-8/JSON)|
//! +-----------+-----------+-------------+------------------+
//! ```

use crate::error::ProtocolError;
use crate::frame::Frame;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

pub const CONTROL_PREFIX: [u8; 6] = [0u8; 6];
pub const ACTION_SIZE: usize = 5;
pub const OPERATOR_SIZE: usize = 2;
pub const CONTROL_HEADER_SIZE: usize = CONTROL_PREFIX.len() + ACTION_SIZE + OPERATOR_SIZE;

/// Body of a successful login response
pub const LOGIN_OKAY: &str = "okay";

/// Body of an address response when the pool is exhausted
pub const NO_FREE_ADDRESS: &str = "no free address";

pub fn is_control(payload: &[u8]) -> bool {
    payload.len() >= CONTROL_PREFIX.len() && payload[..CONTROL_PREFIX.len()] == CONTROL_PREFIX
}

/// Control action vocabulary shared by both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Login,
    IpAddr,
    Neighbor,
    Ping,
    Pong,
    SignIn,
    Leave,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Login,
        Action::IpAddr,
        Action::Neighbor,
        Action::Ping,
        Action::Pong,
        Action::SignIn,
        Action::Leave,
    ];

    /// Space-padded wire code
    pub fn code(self) -> &'static [u8; ACTION_SIZE] {
        match self {
            Action::Login => b"login",
            Action::IpAddr => b"ipadr",
            Action::Neighbor => b"neigh",
            Action::Ping => b"ping ",
            Action::Pong => b"pong ",
            Action::SignIn => b"signi",
            Action::Leave => b"left ",
        }
    }

    pub fn from_code(code: &[u8]) -> Result<Self, ProtocolError> {
        Action::ALL
            .into_iter()
            .find(|action| action.code().as_slice() == code)
            .ok_or_else(|| ProtocolError::UnknownAction(String::from_utf8_lossy(code).into_owned()))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Login => "login",
            Action::IpAddr => "ipadr",
            Action::Neighbor => "neigh",
            Action::Ping => "ping",
            Action::Pong => "pong",
            Action::SignIn => "signi",
            Action::Leave => "left",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Request,
    Response,
}

impl Operator {
    pub fn code(self) -> &'static [u8; OPERATOR_SIZE] {
        match self {
            Operator::Request => b"= ",
            Operator::Response => b": ",
        }
    }

    pub fn from_code(code: &[u8]) -> Result<Self, ProtocolError> {
        match code {
            b"= " => Ok(Operator::Request),
            b": " => Ok(Operator::Response),
            other => Err(ProtocolError::BadOperator(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

/// A decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub action: Action,
    pub operator: Operator,
    pub body: Bytes,
}

impl ControlMessage {
    pub fn new(action: Action, operator: Operator, body: impl Into<Bytes>) -> Self {
        Self {
            action,
            operator,
            body: body.into(),
        }
    }

    pub fn request(action: Action, body: impl Into<Bytes>) -> Self {
        Self::new(action, Operator::Request, body)
    }

    pub fn response(action: Action, body: impl Into<Bytes>) -> Self {
        Self::new(action, Operator::Response, body)
    }

    pub fn request_json<T: Serialize>(action: Action, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self::request(action, serde_json::to_vec(body)?))
    }

    pub fn response_json<T: Serialize>(action: Action, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self::response(action, serde_json::to_vec(body)?))
    }

    pub fn is_request(&self) -> bool {
        self.operator == Operator::Request
    }

    pub fn is_response(&self) -> bool {
        self.operator == Operator::Response
    }

    pub fn body_str(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.body).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_HEADER_SIZE + self.body.len());
        buf.put_slice(&CONTROL_PREFIX);
        buf.put_slice(self.action.code());
        buf.put_slice(self.operator.code());
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, ProtocolError> {
        if !is_control(payload) {
            return Err(ProtocolError::Malformed("not a control frame".to_string()));
        }
        if payload.len() < CONTROL_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                expected: CONTROL_HEADER_SIZE,
                actual: payload.len(),
            });
        }

        let action_at = CONTROL_PREFIX.len();
        let operator_at = action_at + ACTION_SIZE;
        Ok(Self {
            action: Action::from_code(&payload[action_at..operator_at])?,
            operator: Operator::from_code(&payload[operator_at..CONTROL_HEADER_SIZE])?,
            body: payload.slice(CONTROL_HEADER_SIZE..),
        })
    }

    pub fn into_frame(self) -> Frame {
        Frame::from(self)
    }
}
