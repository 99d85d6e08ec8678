#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::warn;

/// Ready while the EventSub session is connected and reconciled.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_ready(&self, ready: bool) {
		self.ready.store(ready, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// Mirror `connected` into the readiness flag until the sender is dropped.
	pub fn follow(&self, mut connected: watch::Receiver<bool>) {
		let state = self.clone();
		tokio::spawn(async move {
			loop {
				state.set_ready(*connected.borrow_and_update());
				if connected.changed().await.is_err() {
					state.set_ready(false);
					break;
				}
			}
		});
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn route(method: &Method, path: &str, ready: bool) -> (StatusCode, &'static [u8]) {
	if method != Method::GET {
		return (StatusCode::METHOD_NOT_ALLOWED, b"");
	}
	match path {
		"/healthz" => (StatusCode::OK, b"ok"),
		"/readyz" if ready => (StatusCode::OK, b"ready"),
		"/readyz" => (StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		_ => (StatusCode::NOT_FOUND, b""),
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (status, body) = route(req.method(), req.uri().path(), state.is_ready());
	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	Ok(resp)
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn routes_probes() {
		assert_eq!(route(&Method::GET, "/healthz", false).0, StatusCode::OK);
		assert_eq!(route(&Method::GET, "/readyz", false).0, StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(route(&Method::GET, "/readyz", true), (StatusCode::OK, &b"ready"[..]));
		assert_eq!(route(&Method::POST, "/healthz", true).0, StatusCode::METHOD_NOT_ALLOWED);
		assert_eq!(route(&Method::GET, "/metrics", true).0, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn follows_connection_state() {
		let state = HealthState::new();
		let (tx, rx) = watch::channel(false);
		state.follow(rx);

		tx.send_replace(true);
		tokio::time::timeout(Duration::from_secs(1), async {
			while !state.is_ready() {
				tokio::task::yield_now().await;
			}
		})
		.await
		.unwrap();

		drop(tx);
		tokio::time::timeout(Duration::from_secs(1), async {
			while state.is_ready() {
				tokio::task::yield_now().await;
			}
		})
		.await
		.unwrap();
	}
}
