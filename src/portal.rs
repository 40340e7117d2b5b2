//! # Configuration Portal
//!
//! A small web form for setting the location label from a phone on the same
//! network.
//!
//! | Route                    | Effect                                   |
//! |--------------------------|------------------------------------------|
//! | `GET /`                  | HTML form showing the current label      |
//! | `GET /location`          | current label as `text/plain`            |
//! | `POST /location`         | form body `location=…`, stores, 303 → `/`|
//! | `GET /save?location=…`   | same as the POST, for plain links        |
//!
//! HTTP is served by axum on a background thread with its own current-thread
//! runtime. Handlers never touch the [`ConfigStore`]: they queue a request
//! and wait for the scheduler to answer it from [`ConfigPortal::service`],
//! which only drains the queue and never waits on a socket.

use crate::store::{ConfigStore, MAX_LOCATION_LEN};
use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Something serviced once per tick that may update the location label.
pub trait ConfigPortal {
    fn service(&mut self, store: &mut ConfigStore);
}

/// Requests answered per `service` call at most.
const MAX_REQUESTS_PER_TICK: usize = 4;

const QUEUE_DEPTH: usize = 8;

/// How long a handler waits for the loop before answering 503. The loop can
/// sit in broker backoff for several seconds.
const REPLY_TIMEOUT: Duration = Duration::from_secs(15);

/// Work handed from the HTTP thread to the scheduler.
enum PortalRequest {
    Get(oneshot::Sender<String>),
    Set {
        location: String,
        reply: oneshot::Sender<Result<String, String>>,
    },
}

type Requests = mpsc::Sender<PortalRequest>;

#[derive(Debug, Deserialize)]
struct LocationForm {
    location: Option<String>,
}

pub struct HttpPortal {
    requests: mpsc::Receiver<PortalRequest>,
    local_addr: SocketAddr,
    closed: bool,
    // dropping this stops the server
    _shutdown: oneshot::Sender<()>,
}

impl HttpPortal {
    /// Bind `addr` and start serving. Bind errors are returned here, not
    /// from the server thread.
    pub fn bind(addr: &str) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, requests) = mpsc::channel(QUEUE_DEPTH);
        let (shutdown, stopped) = oneshot::channel::<()>();
        let app = router(tx);

        std::thread::Builder::new()
            .name("portal".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            warn!(error = %e, "portal listener setup failed");
                            return;
                        }
                    };
                    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                        let _ = stopped.await;
                    });
                    if let Err(e) = server.await {
                        warn!(error = %e, "configuration portal stopped");
                    }
                });
            })?;

        info!(addr = %local_addr, "configuration portal listening");
        Ok(Self {
            requests,
            local_addr,
            closed: false,
            _shutdown: shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn answer(&self, request: PortalRequest, store: &mut ConfigStore) {
        match request {
            PortalRequest::Get(reply) => {
                let _ = reply.send(store.location().to_string());
            }
            PortalRequest::Set { location, reply } => {
                let result = match store.set_location(&location) {
                    Ok(stored) => {
                        info!(location = %stored, "location set from portal");
                        Ok(stored.to_string())
                    }
                    Err(e) => {
                        warn!(error = %e, "location not stored");
                        Err(e.to_string())
                    }
                };
                if reply.send(result).is_err() {
                    debug!("portal client gone before the answer");
                }
            }
        }
    }
}

impl ConfigPortal for HttpPortal {
    fn service(&mut self, store: &mut ConfigStore) {
        if self.closed {
            return;
        }
        for _ in 0..MAX_REQUESTS_PER_TICK {
            match self.requests.try_recv() {
                Ok(request) => self.answer(request, store),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    warn!("configuration portal server is gone");
                    self.closed = true;
                    return;
                }
            }
        }
    }
}

fn router(requests: Requests) -> Router {
    Router::new()
        .route("/", get(show_form))
        .route("/location", get(show_location).post(save_form))
        .route("/save", get(save_query))
        .with_state(requests)
}

/// Queue a request for the loop and wait for its answer.
async fn ask<T>(
    requests: &Requests,
    make: impl FnOnce(oneshot::Sender<T>) -> PortalRequest,
) -> Option<T> {
    let (reply, answer) = oneshot::channel();
    requests.send(make(reply)).await.ok()?;
    tokio::time::timeout(REPLY_TIMEOUT, answer).await.ok()?.ok()
}

fn busy() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "node busy, try again\n").into_response()
}

async fn show_form(State(requests): State<Requests>) -> Response {
    match ask(&requests, PortalRequest::Get).await {
        Some(location) => Html(render_form(&location)).into_response(),
        None => busy(),
    }
}

async fn show_location(State(requests): State<Requests>) -> Response {
    match ask(&requests, PortalRequest::Get).await {
        Some(location) => location.into_response(),
        None => busy(),
    }
}

async fn save_form(State(requests): State<Requests>, Form(form): Form<LocationForm>) -> Response {
    save(&requests, form).await
}

async fn save_query(
    State(requests): State<Requests>,
    Query(form): Query<LocationForm>,
) -> Response {
    save(&requests, form).await
}

async fn save(requests: &Requests, form: LocationForm) -> Response {
    let Some(location) = form.location else {
        return (StatusCode::BAD_REQUEST, "missing location\n").into_response();
    };
    match ask(requests, |reply| PortalRequest::Set { location, reply }).await {
        Some(Ok(_)) => Redirect::to("/").into_response(),
        Some(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")).into_response(),
        None => busy(),
    }
}

fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn render_form(location: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width\">\
         <title>AQ node</title></head><body>\
         <h1>Location</h1>\
         <form method=\"post\" action=\"/location\">\
         <input name=\"location\" maxlength=\"{MAX_LOCATION_LEN}\" value=\"{}\">\
         <button type=\"submit\">Save</button>\
         </form></body></html>\n",
        html_escape(location)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Instant;

    fn store() -> ConfigStore {
        ConfigStore::open(Box::new(MemoryStorage::new())).unwrap()
    }

    /// Send `raw` to the portal, servicing it like the scheduler would, and
    /// return the full response.
    fn exchange(portal: &mut HttpPortal, store: &mut ConfigStore, raw: &str) -> String {
        let mut client = TcpStream::connect(portal.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        client.write_all(raw.as_bytes()).unwrap();

        let mut response = Vec::new();
        let mut chunk = [0u8; 1024];
        for _ in 0..1000 {
            portal.service(store);
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(_) => continue,
            }
        }
        assert!(!response.is_empty(), "portal never answered");
        String::from_utf8(response).unwrap()
    }

    fn post(body: &str) -> String {
        format!(
            "POST /location HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\
             Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    fn get(target: &str) -> String {
        format!("GET {target} HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
    }

    #[test]
    fn form_shows_current_label_escaped() {
        let mut portal = HttpPortal::bind("127.0.0.1:0").unwrap();
        let mut store = store();
        store.set_location("<Plaza & \"Parque\">").unwrap();
        let response = exchange(&mut portal, &mut store, &get("/"));
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("value=\"&lt;Plaza &amp; &quot;Parque&quot;&gt;\""));
    }

    #[test]
    fn post_stores_label_and_redirects() {
        let mut portal = HttpPortal::bind("127.0.0.1:0").unwrap();
        let mut store = store();
        let response = exchange(&mut portal, &mut store, &post("location=Ruta+3+-+Cabecera%21"));
        assert!(response.starts_with("HTTP/1.1 303 See Other"));
        assert!(response.to_ascii_lowercase().contains("location: /\r\n"));
        assert_eq!(store.location(), "Ruta 3 - Cabecera!");

        let response = exchange(&mut portal, &mut store, &get("/location"));
        assert!(response.ends_with("\r\n\r\nRuta 3 - Cabecera!"));
    }

    #[test]
    fn percent_encoded_utf8_is_decoded() {
        let mut portal = HttpPortal::bind("127.0.0.1:0").unwrap();
        let mut store = store();
        exchange(&mut portal, &mut store, &post("x=1&location=Gir%C3%B3n"));
        assert_eq!(store.location(), "Girón");
    }

    #[test]
    fn save_link_truncates_long_labels() {
        let mut portal = HttpPortal::bind("127.0.0.1:0").unwrap();
        let mut store = store();
        let target = format!("/save?location={}", "z".repeat(50));
        exchange(&mut portal, &mut store, &get(&target));
        assert_eq!(store.location(), "z".repeat(MAX_LOCATION_LEN));
    }

    #[test]
    fn unknown_routes_and_missing_fields() {
        let mut portal = HttpPortal::bind("127.0.0.1:0").unwrap();
        let mut store = store();
        let response = exchange(&mut portal, &mut store, &get("/admin"));
        assert!(response.starts_with("HTTP/1.1 404"));
        let response = exchange(&mut portal, &mut store, &get("/save?city=x"));
        assert!(response.starts_with("HTTP/1.1 400"));
        assert_eq!(store.location(), "");
    }

    #[test]
    fn idle_portal_returns_immediately() {
        let mut portal = HttpPortal::bind("127.0.0.1:0").unwrap();
        let mut store = store();
        portal.service(&mut store);
        assert_eq!(store.location(), "");
    }

    #[test]
    fn trickling_client_does_not_hold_the_tick() {
        let mut portal = HttpPortal::bind("127.0.0.1:0").unwrap();
        let mut store = store();
        let mut client = TcpStream::connect(portal.local_addr()).unwrap();

        let mut in_service = Duration::ZERO;
        for byte in b"POST /location HTTP/1.1\r\nContent-Le".iter() {
            client.write_all(&[*byte]).unwrap();
            std::thread::sleep(Duration::from_millis(5));
            let started = Instant::now();
            portal.service(&mut store);
            in_service += started.elapsed();
        }
        assert!(in_service < Duration::from_millis(100), "service took {in_service:?}");
        assert_eq!(store.location(), "");
    }
}
