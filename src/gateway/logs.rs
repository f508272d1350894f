use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::deployer::{DeployerClient, Logs, LogsFilter, LogsRequest};
use crate::error::{AppError, AppResult};
use crate::gateway::GatewayClient;

impl GatewayClient {
    /// Consumes the server-push stream of log requests and answers each one
    /// concurrently while keeping the subscription alive.
    pub(super) async fn stream_log_requests(&self, mut client: DeployerClient) -> AppResult<()> {
        let request = self.request(LogsFilter::default());
        let mut stream = client.stream_log_requests(request).await?.into_inner();

        log::info!("listening for log requests...");

        let mut handlers = FuturesUnordered::new();
        loop {
            tokio::select! {
                message = stream.message() => match message? {
                    Some(logs_request) => {
                        log::info!(
                            "new logs request received: id={} tx_id={}",
                            logs_request.deployment_id,
                            logs_request.tx_id
                        );
                        handlers.push(self.handle_log_request(client.clone(), logs_request));
                    }
                    None => {
                        return Err(AppError::Internal(
                            "log requests stream closed by the gateway".to_string(),
                        ));
                    }
                },
                Some(()) = handlers.next(), if !handlers.is_empty() => {}
            }
        }
    }

    /// Resolves the request to a pod log stream and forwards the lines with
    /// the request's transaction id; the final message carries `eof`.
    async fn handle_log_request(&self, mut client: DeployerClient, logs_request: LogsRequest) {
        let tx_id = logs_request.tx_id.clone();

        let Some(md) = self
            .object_cache
            .model_deployments()
            .into_iter()
            .find(|md| md.id == logs_request.deployment_id)
        else {
            log::warn!(
                "logs requested for unknown deployment {}",
                logs_request.deployment_id
            );
            return;
        };

        let mut lines = match self.pod_logs.logs(&md, &logs_request).await {
            Ok(lines) => lines,
            Err(e) => {
                log::error!("failed to open log stream for {}: {}", md.id, e);
                return;
            }
        };

        let (tx, rx) = tokio::sync::mpsc::channel::<Logs>(16);
        let mut request = tonic::Request::new(ReceiverStream::new(rx));
        self.decorate(request.metadata_mut());

        let sender = tokio::spawn(async move { client.send_logs(request).await });

        let mut created_index: i64 = 0;
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    created_index += 1;
                    let message = Logs {
                        tx_id: tx_id.clone(),
                        line,
                        created_index,
                        eof: false,
                    };
                    if tx.send(message).await.is_err() {
                        log::warn!("log forwarder for tx {} went away", tx_id);
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("log stream for tx {} read failed: {}", tx_id, e);
                    break;
                }
            }
        }

        let _ = tx
            .send(Logs {
                tx_id: tx_id.clone(),
                line: String::new(),
                created_index,
                eof: true,
            })
            .await;
        drop(tx);

        match sender.await {
            Ok(Ok(_)) => log::debug!("log stream for tx {} completed", tx_id),
            Ok(Err(status)) => {
                log::error!("failed to send logs for tx {}: {}", tx_id, status)
            }
            Err(join_err) => {
                log::error!("log sender for tx {} panicked: {}", tx_id, join_err)
            }
        }
    }
}
