//! Fake appliance for unit tests
//!
//! Serves sessions dialed through a [`MemoryDialer`]: answers the API key
//! handshake itself and hands every other request to a test-supplied
//! handler.

use crate::client::router::AUTH_METHOD;
use crate::client::transport::memory::{MemoryDialer, MemorySession};
use crate::client::Client;
use crate::config::ClientConfig;
use crate::protocol::{Request, Response, WireError};
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const API_KEY: &str = "1-test-key";
pub(crate) const TIMEOUT: Duration = Duration::from_millis(500);
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Config pointing at the fake appliance
pub(crate) fn config() -> ClientConfig {
    ClientConfig::new("nas.test", API_KEY)
        .with_timeout(TIMEOUT)
        .with_job_poll_interval(POLL_INTERVAL)
}

/// How the appliance answers one request
pub(crate) enum Reply {
    Result(Value),
    Error(WireError),
    /// Never answer
    Silent,
    /// Close the session instead of answering
    Close,
}

type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

struct Shared {
    handler: Handler,
    reorder_batch: usize,
    auth_calls: AtomicUsize,
    requests: Mutex<Vec<Request>>,
    out_of_order: AtomicBool,
}

pub(crate) struct FakeAppliance {
    shared: Arc<Shared>,
    dialer: Arc<MemoryDialer>,
    sessions: Mutex<Option<mpsc::UnboundedReceiver<MemorySession>>>,
}

impl FakeAppliance {
    pub(crate) fn new(handler: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Self {
        let (dialer, sessions) = MemoryDialer::new();
        Self {
            shared: Arc::new(Shared {
                handler: Arc::new(handler),
                reorder_batch: 0,
                auth_calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                out_of_order: AtomicBool::new(false),
            }),
            dialer: Arc::new(dialer),
            sessions: Mutex::new(Some(sessions)),
        }
    }

    /// Hold answers until `n` are ready, then send them newest first
    pub(crate) fn reorder_batch(mut self, n: usize) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.reorder_batch = n;
        }
        self
    }

    pub(crate) fn client(&self) -> Client {
        self.client_with(config())
    }

    pub(crate) fn client_with(&self, config: ClientConfig) -> Client {
        if let Some(mut sessions) = self.sessions.lock().take() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                while let Some(session) = sessions.next().await {
                    tokio::spawn(serve(session, shared.clone()));
                }
            });
        }
        Client::with_dialer(config, self.dialer.clone()).unwrap()
    }

    pub(crate) fn dialer(&self) -> &MemoryDialer {
        &self.dialer
    }

    pub(crate) fn dial_count(&self) -> usize {
        self.dialer.dial_count()
    }

    pub(crate) fn auth_calls(&self) -> usize {
        self.shared.auth_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.shared.requests.lock().clone()
    }

    pub(crate) fn last_request(&self) -> Request {
        self.shared.requests.lock().last().cloned().unwrap()
    }

    pub(crate) fn replied_out_of_order(&self) -> bool {
        self.shared.out_of_order.load(Ordering::SeqCst)
    }
}

async fn serve(mut session: MemorySession, shared: Arc<Shared>) {
    let mut held = Vec::new();

    while let Some(text) = session.requests.next().await {
        let Ok(request) = Request::from_json(&text) else {
            continue;
        };
        shared.requests.lock().push(request.clone());

        if request.method == AUTH_METHOD {
            shared.auth_calls.fetch_add(1, Ordering::SeqCst);
            let key = request
                .params
                .as_ref()
                .and_then(|p| p.get(0))
                .and_then(Value::as_str);
            let response = Response::success(request.id, json!(key == Some(API_KEY)));
            session.reply(response.to_json().unwrap());
            continue;
        }

        let response = match (shared.handler)(&request) {
            Reply::Result(value) => Response::success(request.id, value),
            Reply::Error(err) => Response::failure(request.id, err),
            Reply::Silent => continue,
            Reply::Close => {
                session.close(Some("going away"));
                break;
            }
        };

        if shared.reorder_batch > 1 {
            held.push(response);
            if held.len() == shared.reorder_batch {
                shared.out_of_order.store(true, Ordering::SeqCst);
                for response in held.drain(..).rev() {
                    session.reply(response.to_json().unwrap());
                }
            }
        } else {
            session.reply(response.to_json().unwrap());
        }
    }
}
