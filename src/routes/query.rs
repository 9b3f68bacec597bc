//! POST /query
//!
//! Body is a query submission record; the answer is the assembled
//! `QueryResult` as JSON.

use hyper::{Response, StatusCode};

use super::{json_response, session_for, BoxBody};
use crate::protocol::QueryPayload;
use crate::server::AppState;
use crate::types::{CauldronError, Result};

pub async fn handle_query(
    state: &AppState,
    auth_header: Option<&str>,
    body: &[u8],
) -> Result<Response<BoxBody>> {
    let session = session_for(state, auth_header)?;

    let payload: QueryPayload = serde_json::from_slice(body)?;
    if payload.sql.trim().is_empty() {
        return Err(CauldronError::BadRequest("sql is required".into()));
    }

    let result = session.query(payload).await?;
    Ok(json_response(StatusCode::OK, &result))
}
