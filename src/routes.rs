use std::time::Duration;

use chrono::NaiveDate;
use log::{error, info, warn};
use serde::Deserialize;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::{self, Response};
use warp::ws::Ws;
use warp::{Filter, Rejection, Reply};

use crate::server::Server;
use crate::validate;

const VISITS_DATE_FORMAT: &str = "%d.%m.%y";

#[derive(Debug, Deserialize)]
struct NewRoom {
    title: String,
    video_url: String,
}

#[derive(Debug, Deserialize)]
struct VisitsQuery {
    #[serde(default)]
    date: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    username: String,
    #[serde(default)]
    room_id: String,
}

/// HTTP surface: room creation and lookup, visit counters and the websocket
/// endpoint that feeds connections into the relay.
pub fn routes(
    server: Server,
    room_ttl: Duration,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_server = warp::any().map(move || server.clone());

    let ping = warp::path::end()
        .and(warp::get())
        .and(with_server.clone())
        .then(ping);

    let visits = warp::path("visits")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<VisitsQuery>())
        .and(with_server.clone())
        .then(get_visits);

    let create_room = warp::path("room")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_server.clone())
        .and(warp::any().map(move || room_ttl))
        .then(create_room);

    let get_room = warp::path!("room" / String)
        .and(warp::get())
        .and(with_server.clone())
        .then(get_room);

    let ws = warp::path("ws")
        .and(warp::path::end())
        .and(warp::query::<WsQuery>())
        .and(warp::ws())
        .and(with_server)
        .then(upgrade);

    ping.or(visits)
        .or(create_room)
        .or(get_room)
        .or(ws)
        .with(warp::cors().allow_any_origin())
}

async fn ping(server: Server) -> Response {
    if let Err(e) = server.store().incr_visits().await {
        error!("failed to count visit: {e}");
    }
    "OK".into_response()
}

async fn get_visits(query: VisitsQuery, server: Server) -> Response {
    let Ok(date) = NaiveDate::parse_from_str(&query.date, VISITS_DATE_FORMAT) else {
        info!("bad visits date '{}'", query.date);
        return StatusCode::BAD_REQUEST.into_response();
    };
    match server.store().visits_on(date).await {
        Ok(visits) => reply::json(&serde_json::json!({ "visits": visits })).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn create_room(body: Bytes, server: Server, room_ttl: Duration) -> Response {
    let room: NewRoom = match serde_json::from_slice(&body) {
        Ok(room) => room,
        Err(e) => {
            warn!("invalid room payload: {e}");
            return StatusCode::UNPROCESSABLE_ENTITY.into_response();
        }
    };
    if !validate::is_title_valid(&room.title) || !validate::is_url_valid(&room.video_url) {
        return StatusCode::UNPROCESSABLE_ENTITY.into_response();
    }

    match server
        .store()
        .create_room(room.title, room.video_url, room_ttl)
        .await
    {
        Ok(room) => reply::json(&room).into_response(),
        Err(e) => {
            error!("failed to create room: {e}");
            StatusCode::CONFLICT.into_response()
        }
    }
}

async fn get_room(room_id: String, server: Server) -> Response {
    match server.store().get_room(&room_id).await {
        Ok(room) => reply::json(&room).into_response(),
        Err(e) => {
            info!("{e}");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn upgrade(query: WsQuery, ws: Ws, server: Server) -> Response {
    if !server.store().room_exists(&query.room_id).await {
        return StatusCode::NOT_FOUND.into_response();
    }
    if !validate::is_name_valid(&query.username) {
        return StatusCode::UNPROCESSABLE_ENTITY.into_response();
    }

    let WsQuery { username, room_id } = query;
    ws.on_upgrade(move |socket| async move {
        server.handle_connection(socket, username, room_id).await;
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Local;
    use futures_util::{SinkExt, StreamExt};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    use super::*;
    use crate::broker::{MemoryBroker, MemoryTransport};
    use crate::connection::ConnectionSettings;
    use crate::messages::Message;
    use crate::room::Room;
    use crate::store::{MemoryStore, RoomStore};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    async fn app() -> (Server, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let server = Server::new(
            Arc::clone(&store) as Arc<dyn RoomStore>,
            Arc::new(MemoryBroker::connect(MemoryTransport::new(64))),
            4,
            ConnectionSettings::default(),
        );
        server.start().await.unwrap();
        (server, store)
    }

    fn upgrade_request(path: &str) -> warp::test::RequestBuilder {
        warp::test::request()
            .path(path)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
    }

    #[test_log::test(tokio::test)]
    async fn ping_counts_visits() {
        let (server, _store) = app().await;
        let api = routes(server, DAY);

        let res = warp::test::request().path("/").reply(&api).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), "OK");
        warp::test::request().path("/").reply(&api).await;

        let today = Local::now().format(VISITS_DATE_FORMAT).to_string();
        let res = warp::test::request()
            .path(&format!("/visits?date={today}"))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body, json!({"visits": 2}));
    }

    #[test_log::test(tokio::test)]
    async fn visits_reject_bad_or_unknown_dates() {
        let (server, _store) = app().await;
        let api = routes(server, DAY);

        let res = warp::test::request().path("/visits?date=2020-01-01").reply(&api).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let res = warp::test::request().path("/visits?date=01.01.01").reply(&api).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[test_log::test(tokio::test)]
    async fn create_then_fetch_room() {
        let (server, _store) = app().await;
        let api = routes(server, DAY);

        let res = warp::test::request()
            .method("POST")
            .path("/room")
            .json(&json!({"title": "Movie night", "video_url": "https://youtube.com/watch?v=1"}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let created: Room = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(created.title, "Movie night");

        let res = warp::test::request()
            .path(&format!("/room/{}", created.id))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let fetched: Room = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(fetched, created);

        let res = warp::test::request().path("/room/missing").reply(&api).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[test_log::test(tokio::test)]
    async fn invalid_rooms_are_unprocessable() {
        let (server, _store) = app().await;
        let api = routes(server, DAY);

        for body in [
            json!({"title": "M", "video_url": "https://youtube.com"}),
            json!({"title": "Movie night", "video_url": "ftp://files.com"}),
            json!({"title": "Movie night"}),
        ] {
            let res = warp::test::request()
                .method("POST")
                .path("/room")
                .json(&body)
                .reply(&api)
                .await;
            assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY, "{body}");
        }
    }

    #[test_log::test(tokio::test)]
    async fn websocket_requires_room_and_valid_name() {
        let (server, store) = app().await;
        let room = store
            .create_room("Movie night".into(), "https://youtube.com".into(), DAY)
            .await
            .unwrap();
        let api = routes(server, DAY);

        let res = upgrade_request("/ws?username=Alice&room_id=missing")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = upgrade_request(&format!("/ws?username=%20x&room_id={}", room.id))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test_log::test(tokio::test)]
    async fn websocket_relays_room_traffic() {
        let (server, store) = app().await;
        let room = store
            .create_room("Movie night".into(), "https://youtube.com".into(), DAY)
            .await
            .unwrap();
        let api = routes(server, DAY);

        let mut client = warp::test::ws()
            .path(&format!("/ws?username=Alice&room_id={}", room.id))
            .handshake(api)
            .await
            .expect("handshake");

        let joined = client.recv().await.unwrap();
        let joined = Message::decode(joined.to_str().unwrap()).unwrap();
        assert_eq!(joined.method, "new_member");

        client
            .send_text(r#"{"id":"1","method":"video_sync","params":{"second":42}}"#)
            .await;
        let synced = client.recv().await.unwrap();
        let synced = Message::decode(synced.to_str().unwrap()).unwrap();
        assert_eq!(synced.method, "video_sync");
        assert_eq!(synced.user_id, joined.user_id);
        assert_eq!(synced.room_id, room.id);
        assert_eq!(synced.params["second"], json!(42));
    }

    #[test_log::test(tokio::test)]
    async fn members_on_a_real_socket_see_each_other() {
        let (server, store) = app().await;
        let room = store
            .create_room("Movie night".into(), "https://youtube.com".into(), DAY)
            .await
            .unwrap();
        let (addr, serve) = warp::serve(routes(server, DAY)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve);

        let url = |name: &str| format!("ws://{addr}/ws?username={name}&room_id={}", room.id);
        let (mut alice, _) = tokio_tungstenite::connect_async(url("Alice")).await.unwrap();
        let _alice_joined = alice.next().await.unwrap().unwrap();
        let (mut bob, _) = tokio_tungstenite::connect_async(url("Bob")).await.unwrap();
        let _bob_joined = bob.next().await.unwrap().unwrap();

        let bob_on_alice = alice.next().await.unwrap().unwrap();
        let bob_on_alice = Message::decode(bob_on_alice.to_text().unwrap()).unwrap();
        assert_eq!(bob_on_alice.params["name"], json!("Bob"));

        bob.send(tokio_tungstenite::tungstenite::Message::text(
            r#"{"id":"1","method":"new_message","params":{"content":"popcorn?"}}"#,
        ))
        .await
        .unwrap();
        let chat = alice.next().await.unwrap().unwrap();
        let chat = Message::decode(chat.to_text().unwrap()).unwrap();
        assert_eq!(chat.params["content"], json!("popcorn?"));
        assert_eq!(chat.user_id, bob_on_alice.user_id);

        bob.close(None).await.unwrap();
        loop {
            let frame = alice.next().await.unwrap().unwrap();
            let Ok(text) = frame.to_text() else { continue };
            let Ok(message) = Message::decode(text) else { continue };
            if message.method == "logout_member" {
                assert_eq!(message.user_id, bob_on_alice.user_id);
                break;
            }
        }
    }
}
