use super::*;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct ServerState {
    seen_auth: Arc<Mutex<Vec<String>>>,
    seen_queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    posted: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl ServerState {
    fn record_auth(&self, headers: &HeaderMap) {
        let value = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.seen_auth.lock().unwrap().push(value);
    }
}

async fn handle_room(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(room_id): Path<i64>,
) -> impl IntoResponse {
    state.record_auth(&headers);
    if room_id == 404 {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "Room not found"})));
    }
    (
        StatusCode::OK,
        Json(json!({"room": {
            "id": room_id,
            "name": "general",
            "room_type": "public",
            "member_count": 2,
            "members": [{"user_id": 1, "username": "alice", "role": "owner"}]
        }})),
    )
}

async fn handle_messages(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(room_id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    state.record_auth(&headers);
    state.seen_queries.lock().unwrap().push(query);
    Json(json!({
        "messages": [{
            "id": 5,
            "room_id": room_id,
            "user_id": 2,
            "content": null,
            "image_url": "/uploads/cat.png",
            "created_at": "2024-05-01T10:00:00"
        }],
        "pagination": {"page": 1, "pages": 3, "per_page": 10, "total": 21}
    }))
}

async fn handle_post_message(
    State(state): State<ServerState>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    state.posted.lock().unwrap().push(body.clone());
    (
        StatusCode::CREATED,
        Json(json!({"message_data": {
            "id": 77,
            "room_id": body["room_id"],
            "user_id": 1,
            "content": body["content"],
            "created_at": "2024-05-01T10:05:00Z"
        }})),
    )
}

async fn handle_update_message(
    State(state): State<ServerState>,
    Path(id): Path<i64>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    state.posted.lock().unwrap().push(body.clone());
    if id == 404 {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Message not found or unauthorized"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message_data": {
                "id": id,
                "content": body["content"],
                "image_url": "",
                "room_id": 7,
                "created_at": "2024-05-01T10:00:00",
                "updated_at": "2024-05-01T10:06:00",
                "user": {"id": 1, "username": "alice", "role": "member"}
            }
        })),
    )
}

async fn handle_delete_message(Path(id): Path<i64>) -> impl IntoResponse {
    if id == 404 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Message already deleted"})),
        );
    }
    (StatusCode::OK, Json(json!({"status": "success"})))
}

async fn handle_accept(Path(id): Path<i64>) -> impl IntoResponse {
    if id == 9 {
        return (StatusCode::FORBIDDEN, Json(json!({"message": "Invitation expired"})));
    }
    (StatusCode::OK, Json(json!({"room": {"id": 31, "name": "team"}})))
}

async fn handle_search(Query(query): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
    Json(json!({"suggestions": [{
        "user_id": 4,
        "username": format!("{}-match", query.get("q").cloned().unwrap_or_default()),
    }]}))
}

async fn spawn_backend_server() -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = ServerState::default();
    let app = Router::new()
        .route("/rooms/:room_id", get(handle_room))
        .route("/messages/room/:room_id", get(handle_messages))
        .route("/messages", post(handle_post_message))
        .route(
            "/messages/:id",
            put(handle_update_message).delete(handle_delete_message),
        )
        .route(
            "/invitations",
            get(|| async { Json(json!({"invitations": []})) }),
        )
        .route("/invitations/:id/accept", post(handle_accept))
        .route("/invitations/:id/reject", post(|| async { StatusCode::NO_CONTENT }))
        .route("/users/search", get(handle_search))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

#[tokio::test]
async fn fetch_room_sends_bearer_and_unwraps_envelope() {
    let (server_url, state) = spawn_backend_server().await;
    let backend = RestBackend::new(server_url, "tok-1");

    let room = backend.fetch_room(RoomId(3)).await.expect("room");

    assert_eq!(room.id, RoomId(3));
    assert_eq!(room.members.len(), 1);
    assert_eq!(state.seen_auth.lock().unwrap().as_slice(), ["Bearer tok-1"]);
}

#[tokio::test]
async fn error_body_message_is_surfaced() {
    let (server_url, _state) = spawn_backend_server().await;
    let backend = RestBackend::new(server_url, "tok-1");

    let err = backend.fetch_room(RoomId(404)).await.expect_err("missing room");
    let api = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(api.status, 404);
    assert_eq!(api.message, "Room not found");
}

#[tokio::test]
async fn message_page_passes_paging_and_tolerates_null_content() {
    let (server_url, state) = spawn_backend_server().await;
    let backend = RestBackend::new(format!("{server_url}/"), "tok-1");

    let page = backend
        .fetch_messages(RoomId(7), 2, 10)
        .await
        .expect("page");

    assert_eq!(page.messages[0].content, "");
    assert_eq!(page.pagination.map(|p| p.has_older()), Some(true));
    let queries = state.seen_queries.lock().unwrap();
    assert_eq!(queries[0].get("page").map(String::as_str), Some("2"));
    assert_eq!(queries[0].get("per_page").map(String::as_str), Some("10"));
}

#[tokio::test]
async fn post_message_returns_created_message() {
    let (server_url, state) = spawn_backend_server().await;
    let backend = RestBackend::new(server_url, "tok-1");

    let message = backend
        .post_message(&SendMessageBody {
            room_id: RoomId(7),
            content: "hello".into(),
            image_url: None,
        })
        .await
        .expect("posted");

    assert_eq!(message.id.0, 77);
    assert_eq!(message.content, "hello");
    let posted = state.posted.lock().unwrap();
    assert!(posted[0].get("image_url").is_none());
}

#[tokio::test]
async fn invitation_accept_reports_room_and_reject_accepts_empty_body() {
    let (server_url, _state) = spawn_backend_server().await;
    let backend = RestBackend::new(server_url, "tok-1");

    assert_eq!(
        backend.accept_invitation(InvitationId(1)).await.expect("accept"),
        Some(RoomId(31))
    );
    backend
        .reject_invitation(InvitationId(1))
        .await
        .expect("reject");
    assert!(backend.fetch_invitations().await.expect("list").is_empty());

    let err = backend
        .accept_invitation(InvitationId(9))
        .await
        .expect_err("expired");
    assert!(err.to_string().contains("Invitation expired"));
}

#[tokio::test]
async fn member_search_returns_suggestions() {
    let (server_url, _state) = spawn_backend_server().await;
    let backend = RestBackend::new(server_url, "tok-1");

    let found = backend.search_members("al", 8).await.expect("search");
    assert_eq!(found[0].username, "al-match");
}

#[tokio::test]
async fn update_message_puts_body_and_reads_nested_author() {
    let (server_url, state) = spawn_backend_server().await;
    let backend = RestBackend::new(server_url, "tok-1");

    let message = backend
        .update_message(
            MessageId(12),
            &UpdateMessageBody {
                content: "edited".into(),
                image_url: None,
            },
        )
        .await
        .expect("updated");

    assert_eq!(message.id, MessageId(12));
    assert_eq!(message.author_id.0, 1);
    assert_eq!(message.image_url, None);
    assert_eq!(state.posted.lock().unwrap()[0]["content"], "edited");
}

#[tokio::test]
async fn delete_message_surfaces_server_refusal() {
    let (server_url, _state) = spawn_backend_server().await;
    let backend = RestBackend::new(server_url, "tok-1");

    backend.delete_message(MessageId(12)).await.expect("delete");
    let err = backend
        .delete_message(MessageId(404))
        .await
        .expect_err("already deleted");
    assert!(err.to_string().contains("Message already deleted"));
}
