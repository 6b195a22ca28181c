//! Scripted transport and fixtures shared by unit tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Method;

use crate::api::transport::{ApiRequest, ApiResponse, Transport};
use crate::auth::{AuthToken, TokenKind, TokenPair};
use crate::error::{SyncError, SyncResult};

pub enum Reply {
    Respond(ApiResponse),
    Fail(SyncError),
    /// Never answers; exercises timeouts.
    Hang,
}

impl Reply {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Reply::Respond(ApiResponse {
            status,
            headers: HashMap::new(),
            body: body.to_string(),
        })
    }

    pub fn status(status: u16, body: &str) -> Self {
        Reply::Respond(ApiResponse {
            status,
            headers: HashMap::new(),
            body: body.to_string(),
        })
    }

    pub fn with_header(self, name: &str, value: &str) -> Self {
        match self {
            Reply::Respond(mut resp) => {
                resp.headers
                    .insert(name.to_ascii_lowercase(), value.to_string());
                Reply::Respond(resp)
            }
            other => other,
        }
    }
}

type Handler = Box<dyn Fn(&ApiRequest, usize) -> Reply + Send + Sync>;

struct Route {
    method: Method,
    path: String,
    hits: usize,
    handler: Handler,
}

/// Routes requests by exact method and path and records every call.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler; it receives the request and its 0-based hit count.
    pub fn on<F>(&self, method: Method, path: &str, handler: F)
    where
        F: Fn(&ApiRequest, usize) -> Reply + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .unwrap()
            .push(Route {
                method,
                path: path.to_string(),
                hits: 0,
                handler: Box::new(handler),
            });
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.path == path)
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        self.calls.lock().unwrap().push(request.clone());

        let reply = {
            let mut routes = self.routes.lock().unwrap();
            match routes
                .iter_mut()
                .find(|route| route.method == request.method && route.path == request.path)
            {
                Some(route) => {
                    let hit = route.hits;
                    route.hits += 1;
                    (route.handler)(&request, hit)
                }
                None => Reply::status(404, "no route"),
            }
        };

        match reply {
            Reply::Respond(resp) => Ok(resp),
            Reply::Fail(err) => Err(err),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// A token pair valid for another hour.
pub fn valid_tokens() -> TokenPair {
    let now = Utc::now();
    TokenPair {
        access: AuthToken::new("access-1".into(), TokenKind::Access, now, 3600),
        refresh: AuthToken::new("refresh-1".into(), TokenKind::Refresh, now, 86_400),
    }
}

/// Access token already expired, refresh token still valid.
pub fn stale_tokens() -> TokenPair {
    let issued = Utc::now() - Duration::hours(25);
    TokenPair {
        access: AuthToken::new("access-old".into(), TokenKind::Access, issued, 86_400),
        refresh: AuthToken::new("refresh-1".into(), TokenKind::Refresh, issued, 2_592_000),
    }
}
