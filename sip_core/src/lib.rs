//! Pure SIP core: raw-message helpers, digest authentication, message
//! builders, and the pending-INVITE / call-session state carried by the
//! user agent. No I/O happens here; the application owns the sockets.

mod auth;
mod build;
mod call;
mod message;

pub use crate::auth::{
    compute_digest_response, parse_challenge, write_authorization_header,
    DigestChallenge, DigestCredentials,
};
pub use crate::build::{
    build_ack, build_bye, build_cancel, build_invite, build_non_2xx_ack,
    build_ok_response, build_register, build_response, LocalIdentity, ResponseBody,
};
pub use crate::call::{CallSession, PendingInvite, RegistrarStatus};
pub use crate::message::{
    extract_contact_uri, extract_from_tag, extract_header, extract_sip_uri,
    extract_tag, extract_to_tag, extract_via_branch, is_response, method_token,
    parse_cseq, request_uri, sdp_body, status_code,
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SipError {
    #[error("invalid message: {0}")]
    Invalid(&'static str),

    #[error("buffer too small")]
    Capacity,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = core::result::Result<T, SipError>;
