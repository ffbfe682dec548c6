use std::future::Future;

use tokio_util::sync::CancellationToken;

/// Identifier of one search attempt or one matched session. Events tagged
/// with an older generation are dropped.
pub type Generation = u64;

/// Cancellation scope for everything spawned on behalf of one generation.
///
/// `live` covers work that stops the moment a session starts closing
/// (countdown, message feed, partner watch). `root` additionally covers
/// work that outlives that, such as grace timers. Dropping the scope
/// cancels both.
#[derive(Debug)]
pub struct SessionScope {
    generation: Generation,
    root: CancellationToken,
    live: CancellationToken,
}

impl SessionScope {
    pub fn new(generation: Generation) -> Self {
        let root = CancellationToken::new();
        let live = root.child_token();
        Self {
            generation,
            root,
            live,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.generation == generation && !self.root.is_cancelled()
    }

    /// Spawn work that stops when the session starts closing.
    pub fn spawn_live<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        spawn_scoped(self.live.clone(), fut);
    }

    /// Spawn work that stops only when the whole generation ends.
    pub fn spawn_root<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        spawn_scoped(self.root.clone(), fut);
    }

    /// Stop live work, keeping root work running.
    pub fn close_live(&self) {
        self.live.cancel();
    }

    pub fn is_live(&self) -> bool {
        !self.live.is_cancelled()
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn spawn_scoped<F>(token: CancellationToken, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => {},
            _ = fut => {},
        }
    });
}
