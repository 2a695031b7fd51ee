use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::cache::CacheStorage;
use crate::lifecycle::Platform;
use crate::net::{Fetcher, Request};
use crate::worker::{Intercept, Worker};

/// Platform events
#[derive(Debug)]
pub enum Event {
  Install,
  Activate,
  /// Intercepted resource request
  Fetch(Request),
  /// Payload posted by a client page
  Message(Value),
}

/// What handling an event produced
#[derive(Debug)]
pub enum Outcome {
  Installed(bool),
  /// Names of the partitions deleted during activation
  Activated(Vec<String>),
  Fetched(Intercept),
  Handled,
}

type Envelope = (Event, oneshot::Sender<Outcome>);

/// Event handler that feeds platform events to a worker, one task per event
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl EventHandler {
  pub fn new<S, F, P>(worker: Arc<Worker<S, F, P>>) -> Self
  where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
    P: Platform + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
      while let Some((event, reply)) = rx.recv().await {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
          let outcome = match event {
            Event::Install => Outcome::Installed(worker.install().await),
            Event::Activate => Outcome::Activated(worker.activate().await),
            Event::Fetch(request) => Outcome::Fetched(worker.fetch(&request).await),
            Event::Message(payload) => {
              worker.message(&payload).await;
              Outcome::Handled
            }
          };
          // The caller may have stopped waiting
          let _ = reply.send(outcome);
        });
      }
    });

    Self { tx }
  }

  /// Send an event and wait for it to be handled
  pub async fn dispatch(&self, event: Event) -> Result<Outcome> {
    let (reply_tx, reply_rx) = oneshot::channel();

    self
      .tx
      .send((event, reply_tx))
      .map_err(|_| eyre!("Worker event loop has stopped"))?;

    reply_rx
      .await
      .map_err(|_| eyre!("Worker dropped the event before handling it"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::Config;
  use crate::lifecycle::WorkerState;
  use crate::net::mock::ScriptedFetcher;
  use crate::net::Response;
  use futures::future::join_all;

  fn handler(fetcher: ScriptedFetcher) -> (EventHandler, Arc<WorkerState>) {
    let config = Config::from_yaml("scope: https://app.example.com/\nstatic_assets: [\"./\"]\n").unwrap();
    let platform = Arc::new(WorkerState::new());
    let worker = Worker::new(
      &config,
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      Arc::new(fetcher),
      Arc::clone(&platform),
    );
    (EventHandler::new(Arc::new(worker)), platform)
  }

  #[tokio::test]
  async fn test_lifecycle_events() {
    let (events, platform) =
      handler(ScriptedFetcher::new().respond("https://app.example.com/", Response::new(200, "OK", "root")));

    let installed = events.dispatch(Event::Install).await.unwrap();
    assert!(matches!(installed, Outcome::Installed(true)));
    assert!(platform.skip_waiting_requested());

    let activated = events.dispatch(Event::Activate).await.unwrap();
    assert!(matches!(activated, Outcome::Activated(ref deleted) if deleted.is_empty()));
    assert!(platform.clients_claimed());
  }

  #[tokio::test]
  async fn test_concurrent_fetches_are_independent() {
    let (events, _) = handler(
      ScriptedFetcher::new()
        .respond("https://app.example.com/a.js", Response::new(200, "OK", "a"))
        .respond("https://app.example.com/b.js", Response::new(200, "OK", "b")),
    );

    let outcomes = join_all(["a", "b", "c"].map(|name| {
      let request = Request::parse("GET", &format!("https://app.example.com/{}.js", name)).unwrap();
      events.dispatch(Event::Fetch(request))
    }))
    .await;

    let statuses: Vec<u16> = outcomes
      .into_iter()
      .map(|outcome| match outcome.unwrap() {
        Outcome::Fetched(Intercept::Respond(Ok(served))) => served.response.status,
        other => panic!("unexpected outcome {:?}", other),
      })
      .collect();
    assert_eq!(statuses, vec![200, 200, 503]);
  }

  #[tokio::test]
  async fn test_message_event() {
    let (events, platform) = handler(ScriptedFetcher::new());

    let outcome = events
      .dispatch(Event::Message(serde_json::json!({ "type": "SKIP_WAITING" })))
      .await
      .unwrap();

    assert!(matches!(outcome, Outcome::Handled));
    assert!(platform.skip_waiting_requested());
  }
}
