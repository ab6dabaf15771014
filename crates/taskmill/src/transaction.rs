//! Multi-document transaction wrapper with post-commit hooks.

use futures_util::future::BoxFuture;
use mongodb::{Client, ClientSession};
use taskmill_core::Result;

const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// Handle passed to the `with_transaction` closure: the session to thread
/// through store operations, plus hooks that only run once the commit is
/// known to have succeeded.
pub struct TransactionContext {
    session: ClientSession,
    hooks: Vec<Box<dyn FnOnce() + Send>>,
}

impl TransactionContext {
    pub fn session(&mut self) -> &mut ClientSession {
        &mut self.session
    }

    /// Run `hook` after the transaction commits. Hooks never run for an
    /// aborted transaction.
    pub fn after_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }
}

pub(crate) async fn with_transaction<T, F>(client: &Client, f: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a mut TransactionContext) -> BoxFuture<'a, Result<T>>,
{
    let session = client.start_session().await?;
    let mut ctx = TransactionContext {
        session,
        hooks: Vec::new(),
    };

    ctx.session.start_transaction().await?;

    let value = match f(&mut ctx).await {
        Ok(value) => value,
        Err(e) => {
            let _ = ctx.session.abort_transaction().await;
            return Err(e);
        }
    };

    loop {
        match ctx.session.commit_transaction().await {
            Ok(()) => break,
            Err(e) if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) => {
                // The server may have committed without us hearing back;
                // retrying the commit is the documented resolution.
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    for hook in ctx.hooks {
        hook();
    }

    Ok(value)
}
