//! Command generations.
//!
//! Every externally triggered lifecycle command takes a [`CommandToken`] before
//! doing any work and carries it through each async step. A step may only
//! mutate shared controller state while its token is still the most recently
//! issued one. Older commands keep running to completion (their backend calls
//! are still awaited and their resources released) but their status side
//! effects are dropped.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use workshop_shared::errors::{WorkshopError, WorkshopResult};

/// Issues strictly increasing command generations.
#[derive(Clone)]
pub struct GenerationCounter {
    tx: Arc<watch::Sender<u64>>,
}

impl GenerationCounter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Start a new command, superseding every token issued before.
    pub fn issue(&self) -> CommandToken {
        let mut generation = 0;
        self.tx.send_modify(|current| {
            *current += 1;
            generation = *current;
        });
        tracing::trace!(generation, "issued command token");
        CommandToken {
            generation,
            rx: self.tx.subscribe(),
        }
    }

    /// Most recently issued generation (0 before the first command).
    pub fn latest(&self) -> u64 {
        *self.tx.borrow()
    }
}

impl Default for GenerationCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that a command was issued at a given generation.
#[derive(Clone, Debug)]
pub struct CommandToken {
    generation: u64,
    rx: watch::Receiver<u64>,
}

impl CommandToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether no newer command has been issued since this one.
    pub fn is_current(&self) -> bool {
        *self.rx.borrow() == self.generation
    }

    /// `Err(Superseded)` once a newer command exists.
    pub fn ensure_current(&self) -> WorkshopResult<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(WorkshopError::Superseded)
        }
    }

    /// Resolves when a newer command is issued (or the counter is dropped).
    pub async fn superseded(&self) {
        let generation = self.generation;
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|latest| *latest != generation).await;
    }

    /// Run `fut` unless this command is superseded first.
    ///
    /// The losing future is dropped, which aborts it.
    pub async fn run<F, T>(&self, fut: F) -> WorkshopResult<T>
    where
        F: Future<Output = T>,
    {
        self.ensure_current()?;
        tokio::select! {
            biased;
            _ = self.superseded() => Err(WorkshopError::Superseded),
            value = fut => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_generations_strictly_increase() {
        let counter = GenerationCounter::new();
        let a = counter.issue();
        let b = counter.issue();
        assert!(b.generation() > a.generation());
        assert_eq!(counter.latest(), b.generation());
    }

    #[test]
    fn test_newer_token_supersedes_older() {
        let counter = GenerationCounter::new();
        let first = counter.issue();
        assert!(first.is_current());

        let second = counter.issue();
        assert!(!first.is_current());
        assert!(second.is_current());
        assert!(first.ensure_current().unwrap_err().is_superseded());
        assert!(second.ensure_current().is_ok());
    }

    #[tokio::test]
    async fn test_superseded_resolves_on_new_command() {
        let counter = GenerationCounter::new();
        let token = counter.issue();

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.superseded().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        counter.issue();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_aborts_pending_future_when_superseded() {
        let counter = GenerationCounter::new();
        let token = counter.issue();

        let issuer = counter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            issuer.issue();
        });

        let result = token.run(std::future::pending::<()>()).await;
        assert!(result.unwrap_err().is_superseded());
    }

    #[tokio::test]
    async fn test_run_returns_value_while_current() {
        let counter = GenerationCounter::new();
        let token = counter.issue();
        assert_eq!(token.run(async { 7 }).await.unwrap(), 7);
    }
}
