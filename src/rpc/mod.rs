//! Outward RPC adapter: a thin Rocket JSON layer translating HTTP
//! requests into `Arbiter`/node calls and `ArbiterError` into HTTP
//! responses, in the familiar `Result<Json<T>, (Status, Json<Value>)>`
//! handler shape.

pub mod admin;
pub mod controller;
pub mod dto;
pub mod node;

use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};

use crate::errors::{ArbiterError, ArbiterErrorCode};

pub type ApiResult<T> = Result<Json<T>, (Status, Json<Value>)>;

/// Maps a domain error onto an HTTP response. The `code` field always
/// carries the stable taxonomy string; the HTTP status is a reasonable
/// REST convention layered on top, not itself part of the contract.
pub fn error_response(err: ArbiterError) -> (Status, Json<Value>) {
    let status = match err.code() {
        ArbiterErrorCode::InvalidArgument => Status::BadRequest,
        ArbiterErrorCode::NotFound => Status::NotFound,
        ArbiterErrorCode::FailedPrecondition => Status::Conflict,
        ArbiterErrorCode::Aborted => Status::Locked,
        ArbiterErrorCode::Internal => Status::InternalServerError,
    };
    let body = Json(json!({
        "code": err.code().as_str(),
        "message": err.to_string(),
    }));
    (status, body)
}
