//! Scripted network used by the unit tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{FetchError, Fetcher, Request, Response};

pub struct StubNetwork {
  routes: Mutex<HashMap<String, Response>>,
  calls: Mutex<Vec<(String, String)>>,
  online: AtomicBool,
}

impl StubNetwork {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      calls: Mutex::new(Vec::new()),
      online: AtomicBool::new(true),
    }
  }

  /// Serve `body` with status 200 for `url`.
  pub fn serve(&self, url: &str, body: &str) {
    self.respond(url, Response::new(200, body));
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Number of requests that reached the network for `url`, any method.
  pub fn calls_for(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(_, u)| u == url)
      .count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  fn answer(&self, request: &Request) -> Result<Response, FetchError> {
    let url = request.url.to_string();
    self
      .calls
      .lock()
      .unwrap()
      .push((request.method.to_string(), url.clone()));

    if !self.online.load(Ordering::SeqCst) {
      return Err(FetchError::Unreachable("stub network offline".to_string()));
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&url)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}

impl Fetcher for StubNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send {
    let result = self.answer(request);
    async move { result }
  }
}
