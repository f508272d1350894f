use std::future::Future;

use futures_util::future::{select_all, BoxFuture};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};

type Task = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, AppResult<()>> + Send>;

/// Group launches long-running tasks on a shared cancellation token and
/// reports the first terminal result.
///
/// `run` waits for the first task to finish, cancels the token, joins the
/// remaining tasks, and returns the first task's result. A task that wants
/// to run forever should wait on the token and return when it is cancelled.
#[derive(Default)]
pub struct Group {
    tasks: Vec<Task>,
}

impl Group {
    pub fn new() -> Group {
        Group::default()
    }

    /// Registers a task to be launched by `run`.
    pub fn add<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        self.tasks.push(Box::new(move |stop| Box::pin(task(stop))));
    }

    /// Launches all registered tasks and blocks until the first returns.
    /// The remaining tasks are cancelled and joined before the first
    /// result is handed back. An empty group returns immediately.
    pub async fn run(self) -> AppResult<()> {
        if self.tasks.is_empty() {
            return Ok(());
        }

        let stop = CancellationToken::new();
        let handles: Vec<JoinHandle<AppResult<()>>> = self
            .tasks
            .into_iter()
            .map(|task| tokio::spawn(task(stop.clone())))
            .collect();

        let (first, _index, rest) = select_all(handles).await;
        let result = match first {
            Ok(result) => result,
            Err(join_err) => Err(AppError::Internal(format!("task panicked: {}", join_err))),
        };

        stop.cancel();
        for handle in rest {
            // joined for shutdown ordering only, results are not inspected
            let _ = handle.await;
        }

        result
    }
}
