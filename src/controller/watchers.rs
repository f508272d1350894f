use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::controller::cache::{CacheObject, KubernetesCache, Meta, ObjectKind};
use crate::error::{AppError, AppResult};
use crate::workgroup::Group;

/// Size of the shared event FIFO between the watches and the cache worker.
pub const EVENT_BUFFER_SIZE: usize = 128;

/// Buffered watch event. A completed relist carries the set of keys that
/// still exist so the worker can sweep entries whose delete was missed.
enum WatchEvent {
    Add(CacheObject),
    Update(CacheObject),
    Delete(CacheObject),
    Replace(ObjectKind, HashSet<Meta>),
}

/// Registers the three resource watches and the single worker that drains
/// their shared buffer into the cache.
pub fn register_watchers(group: &mut Group, client: Client, cache: Arc<KubernetesCache>) {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);

    {
        let cache = cache.clone();
        group.add(move |stop| drain(rx, cache, stop));
    }

    {
        let api: Api<Service> = Api::all(client.clone());
        let tx = tx.clone();
        group.add(move |stop| watch(api, ObjectKind::Service, CacheObject::Service, tx, stop));
    }

    {
        let api: Api<Deployment> = Api::all(client.clone());
        let tx = tx.clone();
        group.add(move |stop| {
            watch(api, ObjectKind::Deployment, CacheObject::Deployment, tx, stop)
        });
    }

    {
        let api: Api<Ingress> = Api::all(client);
        group.add(move |stop| watch(api, ObjectKind::Ingress, CacheObject::Ingress, tx, stop));
    }
}

async fn watch<K>(
    api: Api<K>,
    kind: ObjectKind,
    wrap: fn(K) -> CacheObject,
    tx: mpsc::Sender<WatchEvent>,
    stop: CancellationToken,
) -> AppResult<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    log::info!("watch {:?} started", kind);
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);

    let mut relist: Option<HashSet<Meta>> = None;
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                log::info!("watch {:?} stopped", kind);
                return Ok(());
            }
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Init)) => {
                    relist = Some(HashSet::new());
                }
                Some(Ok(watcher::Event::InitApply(obj))) => {
                    if let Some(seen) = relist.as_mut() {
                        seen.insert(Meta::new(obj.namespace().unwrap_or_default(), obj.name_any()));
                    }
                    send(&tx, WatchEvent::Add(wrap(obj))).await?;
                }
                Some(Ok(watcher::Event::InitDone)) => {
                    if let Some(seen) = relist.take() {
                        send(&tx, WatchEvent::Replace(kind, seen)).await?;
                    }
                }
                Some(Ok(watcher::Event::Apply(obj))) => {
                    send(&tx, WatchEvent::Update(wrap(obj))).await?;
                }
                Some(Ok(watcher::Event::Delete(obj))) => {
                    send(&tx, WatchEvent::Delete(wrap(obj))).await?;
                }
                Some(Err(e)) => {
                    log::warn!("watch {:?} error: {}", kind, e);
                }
                None => {
                    log::warn!("watch {:?} stream ended", kind);
                    return Ok(());
                }
            }
        }
    }
}

/// Never drops an event: a full buffer blocks the watch instead, so the
/// cache observes every transition and missed deletes cannot orphan
/// cluster objects.
async fn send(tx: &mpsc::Sender<WatchEvent>, event: WatchEvent) -> AppResult<()> {
    match tx.try_send(event) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::info!("event buffer is full, applying backpressure to the watch");
            tx.send(event)
                .await
                .map_err(|_| AppError::Internal("event buffer closed".to_string()))
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(AppError::Internal("event buffer closed".to_string()))
        }
    }
}

async fn drain(
    mut rx: mpsc::Receiver<WatchEvent>,
    cache: Arc<KubernetesCache>,
    stop: CancellationToken,
) -> AppResult<()> {
    log::info!("event buffer started");
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                log::info!("event buffer stopped");
                return Ok(());
            }
            event = rx.recv() => match event {
                Some(event) => apply_event(&cache, event),
                None => return Ok(()),
            }
        }
    }
}

fn apply_event(cache: &KubernetesCache, event: WatchEvent) {
    match event {
        WatchEvent::Add(obj) | WatchEvent::Update(obj) => {
            cache.insert(obj);
        }
        WatchEvent::Delete(obj) => {
            cache.remove(&obj);
        }
        WatchEvent::Replace(kind, keep) => {
            cache.retain(kind, &keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::controller::annotations::ANN_CONTROLLER_IDENTIFIER;

    fn owned_service(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                annotations: Some(BTreeMap::from([(
                    ANN_CONTROLLER_IDENTIFIER.to_string(),
                    "5555".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn events_dispatch_to_cache_operations() {
        let cache = KubernetesCache::new("5555");

        apply_event(
            &cache,
            WatchEvent::Add(CacheObject::Service(owned_service("ds-a-1"))),
        );
        apply_event(
            &cache,
            WatchEvent::Update(CacheObject::Service(owned_service("ds-b-2"))),
        );
        assert_eq!(cache.services().len(), 2);

        apply_event(
            &cache,
            WatchEvent::Delete(CacheObject::Service(owned_service("ds-a-1"))),
        );
        assert!(cache.get_service("ns", "ds-a-1").is_none());
        assert!(cache.get_service("ns", "ds-b-2").is_some());

        apply_event(
            &cache,
            WatchEvent::Replace(ObjectKind::Service, HashSet::new()),
        );
        assert!(cache.services().is_empty());
    }

    #[tokio::test]
    async fn worker_drains_the_buffer_into_the_cache() {
        let cache = Arc::new(KubernetesCache::new("5555"));
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);

        let worker = tokio::spawn(drain(rx, cache.clone(), CancellationToken::new()));

        send(&tx, WatchEvent::Add(CacheObject::Service(owned_service("ds-a-1"))))
            .await
            .expect("event accepted");
        drop(tx);
        worker.await.expect("worker joins").expect("worker ok");

        assert!(cache.get_service("ns", "ds-a-1").is_some());
    }
}
