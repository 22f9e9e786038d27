use super::*;

pub(crate) fn router(proxy: Arc<Proxy>) -> Router {
    let path = proxy.settings().path().to_string();

    Router::new()
        .route("/stats", get(stats))
        .route(&path, any(websocket))
        .with_state(proxy)
}

async fn stats(State(proxy): State<Arc<Proxy>>) -> Json<Stats> {
    Json(proxy.stats())
}

async fn websocket(
    State(proxy): State<Arc<Proxy>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let pool = query.get("pool").cloned();

    ws.on_upgrade(move |socket| proxy.accept(WsDownstream { socket }, pool))
}

pub(crate) struct WsDownstream {
    socket: WebSocket,
}

impl Downstream for WsDownstream {
    async fn send(&mut self, message: Message) -> Result {
        let frame = serde_json::to_string(&message)?;

        self.socket
            .send(WsMessage::Text(frame.into()))
            .await
            .context("websocket send failed")
    }

    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.socket.recv().await {
                Some(Ok(WsMessage::Text(text))) => return Some(text.to_string()),
                Some(Ok(WsMessage::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!("websocket receive failed: {err}");
                    return None;
                }
            }
        }
    }
}
