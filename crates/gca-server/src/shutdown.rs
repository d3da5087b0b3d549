//! Coordinated shutdown for the UDP listener, TCP sync responder, HTTP
//! server and background rotation task: a `CancellationToken` plays the
//! role of a closed channel (§5's "Go-style" shutdown signal) and a
//! `JoinSet` plays the role of a wait group.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct Shutdown {
    token: CancellationToken,
    tasks: JoinSet<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(future);
    }

    /// Signal cancellation and wait for every spawned task to return.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        while self.tasks.join_next().await.is_some() {}
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}
