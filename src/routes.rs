use log::{debug, warn};
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::EdgeDetect;
use crate::error::AppError;
use crate::gpio::{EdgeEvent, GpioBackend, GpioManager};

pub struct AppState<B: GpioBackend + 'static> {
    pub manager: Arc<GpioManager<B>>,
}

impl<B: GpioBackend + 'static> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

#[derive(Deserialize)]
struct DetectPayload {
    edge: String,
    #[serde(default)]
    debounce_ms: u64,
}

#[derive(Deserialize)]
struct WaitPayload {
    edge: String,
    #[serde(default)]
    debounce_ms: u64,
    #[serde(default)]
    timeout_ms: u64,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Deserialize, Default)]
struct StreamQuery {
    channel: Option<String>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<EdgeEvent>,
    channel_filter: Option<String>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if channel_filter.as_ref().is_some_and(|c| *c != event.channel) {
                            continue;
                        }
                        if let Ok(text) = serde_json::to_string(&event)
                            && session.text(text).await.is_err()
                        {
                            debug!("event stream client for {channel_filter:?} went away");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = json!({ "error": format!("event stream lagged by {n} messages") });
                        if session.text(notice.to_string()).await.is_err() {
                            warn!("lagging event stream client disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl<B: GpioBackend + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/channels")
                    .route(web::get().to(list_channels::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/channels/events")
                    .route(web::get().to(events_ws::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/channel/{id}")
                    .route(web::get().to(channel_descriptor::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/channel/{id}/setup")
                    .route(web::post().to(setup_input::<B>))
                    .route(not_allowed(&[Method::POST])),
            )
            .service(
                web::resource("/channel/{id}/cleanup")
                    .route(web::post().to(cleanup::<B>))
                    .route(not_allowed(&[Method::POST])),
            )
            .service(
                web::resource("/channel/{id}/value")
                    .route(web::get().to(get_value::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/channel/{id}/detect")
                    .route(web::post().to(add_detect::<B>))
                    .route(web::delete().to(remove_detect::<B>))
                    .route(not_allowed(&[Method::POST, Method::DELETE])),
            )
            .service(
                web::resource("/channel/{id}/detected")
                    .route(web::get().to(event_detected::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/channel/{id}/wait")
                    .route(web::post().to(wait_for_edge::<B>))
                    .route(not_allowed(&[Method::POST])),
            )
            .service(
                web::resource("/channel/{id}/event")
                    .route(web::get().to(get_last_event::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/channel/{id}/events")
                    .route(web::get().to(get_events::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
    }
}

async fn list_channels<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.list_channels()))
}

async fn channel_descriptor<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let id = parse_channel_id(&req)?;
    let desc = state.manager.get_channel(id)?;

    Ok(web::Json(desc))
}

async fn setup_input<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let id = parse_channel_id(&req)?;
    state.manager.setup_input(id)?;

    Ok(HttpResponse::Ok())
}

async fn cleanup<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let id = parse_channel_id(&req)?;
    state.manager.cleanup(id)?;

    Ok(HttpResponse::Ok())
}

async fn get_value<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let id = parse_channel_id(&req)?;
    let value = state.manager.read_value(id)?;

    Ok(web::Json(value))
}

async fn add_detect<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let id = parse_channel_id(&req)?;
    let payload: DetectPayload = parse_json_payload(&body)?;
    let edge = parse_edge(&payload.edge)?;

    state.manager.add_detect(id, edge, payload.debounce_ms)?;

    Ok(HttpResponse::Ok())
}

async fn remove_detect<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let id = parse_channel_id(&req)?;
    state.manager.remove_detect(id)?;

    Ok(HttpResponse::Ok())
}

async fn event_detected<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let id = parse_channel_id(&req)?;
    let detected = state.manager.event_detected(id)?;

    Ok(web::Json(json!({ "detected": detected })))
}

async fn wait_for_edge<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let id = parse_channel_id(&req)?.to_string();
    let payload: WaitPayload = parse_json_payload(&body)?;
    let edge = parse_edge(&payload.edge)?;

    let manager = state.manager.clone();
    let outcome = web::block(move || {
        manager.wait_for_edge(&id, edge, payload.debounce_ms, payload.timeout_ms)
    })
    .await
    .map_err(|e| AppError::Gpio(format!("wait task failed: {e}")))??;

    Ok(web::Json(json!({
        "channel": outcome.channel,
        "detected": outcome.detected,
        "code": outcome.code(),
    })))
}

async fn get_last_event<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let id = parse_channel_id(&req)?;

    match state.manager.get_last_event(id)? {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::Ok().finish()),
    }
}

async fn get_events<B: GpioBackend + 'static>(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let id = parse_channel_id(&req)?;
    let events = state.manager.get_events(id, query.limit)?;

    Ok(web::Json(events))
}

async fn events_ws<B: GpioBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<StreamQuery>,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let channel_filter = query.into_inner().channel;
    if let Some(id) = &channel_filter {
        state.manager.get_channel(id)?;
    }

    let rx = state.manager.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::Gpio(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, channel_filter).await;
    });

    Ok(response)
}

fn parse_channel_id(req: &HttpRequest) -> Result<&str, AppError> {
    req.match_info()
        .get("id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::InvalidValue("Missing channel id".into()))
}

fn parse_json_payload<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty payload".into()));
    }

    serde_json::from_slice(body).map_err(|e| AppError::InvalidValue(format!("Invalid payload: {e}")))
}

fn parse_edge(text: &str) -> Result<EdgeDetect, AppError> {
    text.parse::<EdgeDetect>().map_err(AppError::from)
}

fn not_allowed(allowed: &'static [Method]) -> actix_web::Route {
    web::route()
        .guard(guard_not_methods(allowed))
        .to(method_not_allowed)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
