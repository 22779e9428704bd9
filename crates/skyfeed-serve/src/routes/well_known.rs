//! `did:web` document for the feed generator service.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct DidDocument {
    #[serde(rename = "@context")]
    pub context: Vec<&'static str>,
    pub id: String,
    pub service: Vec<DidService>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub service_endpoint: String,
}

/// `GET /.well-known/did.json`
pub async fn did_document(State(state): State<AppState>) -> Json<DidDocument> {
    Json(DidDocument {
        context: vec!["https://www.w3.org/ns/did/v1"],
        id: state.config.service_did.clone(),
        service: vec![DidService {
            id: "#bsky_fg",
            kind: "BskyFeedGenerator",
            service_endpoint: format!("https://{}", state.config.hostname),
        }],
    })
}
